use std::{cell::RefCell, rc::Rc, time::Duration};

use ferry::{
    CloseReason, ConnId, ConnectOptions, Core, CoreOptions, ListenerConfig, ListenerRole,
    Processor, RoleKind, Runtime, TlsOptions,
};

/// Echoes on accepted links and prints what comes back on outbound ones.
#[derive(Default)]
struct Relay {
    replies: Rc<RefCell<Vec<u8>>>,
}

impl Processor for Relay {
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        _allow_partial: bool,
    ) -> Result<(), CloseReason> {
        let outbound = core.connection(id).is_some_and(|c| c.is_outbound());
        let Some(inbuf) = core.inbuf_mut(id) else { return Ok(()) };
        let data = inbuf.extract_all();
        inbuf.clear();

        if outbound {
            self.replies.borrow_mut().extend_from_slice(&data);
        } else {
            core.append_bytes(id, &data).map_err(|e| CloseReason::Protocol(e.to_string()))?;
        }
        Ok(())
    }

    fn finished_connecting(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        println!("Link {id} open, sending greeting");
        core.append_bytes(id, b"hello over tls").map_err(|e| CloseReason::Protocol(e.to_string()))?;
        Ok(())
    }
}

fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let tls = TlsOptions::self_signed().unwrap();
    let relay = Relay::default();
    let replies = Rc::clone(&relay.replies);

    let mut rt = Runtime::new(CoreOptions::default().with_tls(tls))
        .unwrap()
        .with_processor(RoleKind::Relay, relay);

    let listener = rt
        .core_mut()
        .open_listener(
            ListenerConfig::tcp("127.0.0.1:0".parse().unwrap(), ListenerRole::Relay).with_tls(),
        )
        .unwrap();
    let addr = rt.core().connection(listener).unwrap().address().cloned().unwrap();
    println!("Listening on {addr}");

    rt.core_mut().connect(RoleKind::Relay, addr, ConnectOptions::default().with_tls()).unwrap();
    let done = rt
        .run_until(Duration::from_secs(5), |_| replies.borrow().len() == b"hello over tls".len())
        .unwrap();
    println!("Reply: {:?} (done: {done})", String::from_utf8_lossy(&replies.borrow()));

    let stats = rt.core().stats();
    println!("Received: {}B, sent: {}B", stats.bytes_rx(), stats.bytes_tx());
    rt.shutdown().unwrap();
}
