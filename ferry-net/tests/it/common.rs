use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use ferry_net::{
    Address, CloseReason, ConnId, Core, CoreOptions, ListenerConfig, ListenerRole, Processor,
    Runtime,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// What a [`Recorder`] saw.
#[derive(Debug, Default)]
pub struct Seen {
    pub received: Vec<u8>,
    pub connected: Vec<ConnId>,
    pub accepted: Vec<ConnId>,
    pub eof: Vec<ConnId>,
    pub flushed: Vec<ConnId>,
    pub closed: Vec<(ConnId, Option<CloseReason>)>,
}

impl Seen {
    pub fn closed_ids(&self) -> Vec<ConnId> {
        self.closed.iter().map(|(id, _)| *id).collect()
    }
}

/// Records every hook and collects inbound bytes.
#[derive(Debug, Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Seen>>);

impl Recorder {
    pub fn seen(&self) -> std::cell::Ref<'_, Seen> {
        self.0.borrow()
    }
}

impl Processor for Recorder {
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        _allow_partial: bool,
    ) -> Result<(), CloseReason> {
        if let Some(inbuf) = core.inbuf_mut(id) {
            let data = inbuf.extract_all();
            inbuf.clear();
            self.0.borrow_mut().received.extend_from_slice(&data);
        }
        Ok(())
    }

    fn finished_flushing(&mut self, _core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.0.borrow_mut().flushed.push(id);
        Ok(())
    }

    fn reached_eof(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.0.borrow_mut().eof.push(id);
        if core.connection(id).is_some_and(|c| !c.is_marked_for_close()) {
            core.mark_for_close(id).unwrap();
        }
        Ok(())
    }

    fn finished_connecting(&mut self, _core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.0.borrow_mut().connected.push(id);
        Ok(())
    }

    fn accepted(&mut self, _core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.0.borrow_mut().accepted.push(id);
        Ok(())
    }

    fn about_to_close(&mut self, _core: &mut Core, id: ConnId, reason: Option<&CloseReason>) {
        self.0.borrow_mut().closed.push((id, reason.cloned()));
    }
}

/// Writes back whatever it reads.
#[derive(Debug, Default)]
pub struct Echo;

impl Processor for Echo {
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        _allow_partial: bool,
    ) -> Result<(), CloseReason> {
        let Some(inbuf) = core.inbuf_mut(id) else { return Ok(()) };
        let data = inbuf.extract_all();
        inbuf.clear();
        core.append_bytes(id, &data).map_err(|e| CloseReason::Protocol(e.to_string()))?;
        Ok(())
    }
}

/// Echoes on accepted connections and records on outbound ones. For roles that play both
/// sides, like relay links.
#[derive(Debug, Clone, Default)]
pub struct Mirror(pub Recorder);

impl Processor for Mirror {
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        allow_partial: bool,
    ) -> Result<(), CloseReason> {
        if core.connection(id).is_some_and(|c| c.is_outbound()) {
            self.0.process_inbound(core, id, allow_partial)
        } else {
            Echo.process_inbound(core, id, allow_partial)
        }
    }

    fn finished_connecting(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.0.finished_connecting(core, id)
    }

    fn accepted(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.0.accepted(core, id)
    }

    fn about_to_close(&mut self, core: &mut Core, id: ConnId, reason: Option<&CloseReason>) {
        self.0.about_to_close(core, id, reason)
    }
}

/// Opens a listener and returns its id and bound address.
pub fn listen(runtime: &mut Runtime, config: ListenerConfig) -> (ConnId, Address) {
    let id = runtime.core_mut().open_listener(config).unwrap();
    let addr = runtime.core().connection(id).unwrap().address().cloned().unwrap();
    (id, addr)
}

pub fn runtime(options: CoreOptions) -> Runtime {
    let _ = tracing_subscriber::fmt::try_init();
    Runtime::new(options.with_tick_interval(Duration::from_millis(10))).unwrap()
}

pub fn entry_listener() -> ListenerConfig {
    ListenerConfig::tcp(localhost(), ListenerRole::Entry)
}
