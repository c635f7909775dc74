use ferry_net::{
    CloseReason, ConnId, ConnectOptions, Core, CoreOptions, ListenerConfig, ListenerRole,
    Processor, RelayState, Role, RoleKind, TransportKind,
};
use ferry_transport::{tls::TlsOptions, StreamKind};

use crate::common::{listen, localhost, runtime, Mirror, Recorder, WAIT};

fn tls_runtime(mirror: &Mirror) -> ferry_net::Runtime {
    let tls = TlsOptions::self_signed().unwrap();
    runtime(CoreOptions::default().with_tls(tls)).with_processor(RoleKind::Relay, mirror.clone())
}

#[test]
fn tls_relay_link_opens_and_carries_data() {
    let mirror = Mirror::default();
    let mut rt = tls_runtime(&mirror);

    let (_, addr) = listen(&mut rt, ListenerConfig::tcp(localhost(), ListenerRole::Relay).with_tls());
    let id = rt
        .core_mut()
        .connect(RoleKind::Relay, addr, ConnectOptions::default().with_tls())
        .unwrap();

    let seen = &mirror.0;
    assert!(rt
        .run_until(WAIT, |_| seen.seen().connected.contains(&id) && !seen.seen().accepted.is_empty())
        .unwrap());

    let client = rt.core().connection(id).unwrap();
    assert_eq!(client.role(), &Role::Relay(RelayState::Open));
    assert_eq!(client.kind(), TransportKind::Stream(StreamKind::Tls));
    let server = seen.seen().accepted[0];
    assert_eq!(rt.core().connection(server).unwrap().role(), &Role::Relay(RelayState::Open));

    let payload: Vec<u8> = (0..100_000).map(|i| (i % 253) as u8).collect();
    rt.core_mut().append_bytes(id, &payload).unwrap();
    assert!(rt.run_until(WAIT, |_| seen.seen().received.len() == payload.len()).unwrap());
    assert_eq!(seen.seen().received, payload);
}

#[test]
fn tls_needs_configuration() {
    let mut rt = runtime(CoreOptions::default());

    let err = rt
        .core_mut()
        .open_listener(ListenerConfig::tcp(localhost(), ListenerRole::Relay).with_tls())
        .unwrap_err();
    assert!(matches!(err, ferry_net::Error::TlsNotConfigured));

    let err = rt
        .core_mut()
        .connect(RoleKind::Relay, localhost().into(), ConnectOptions::default().with_tls())
        .unwrap_err();
    assert!(matches!(err, ferry_net::Error::TlsNotConfigured));
}

/// Answers the first request on an accepted link with one large reply, then closes the link
/// with a flush. Outbound links record what they get.
#[derive(Debug, Clone)]
struct Farewell {
    reply: Vec<u8>,
    client: Recorder,
}

impl Processor for Farewell {
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        allow_partial: bool,
    ) -> Result<(), CloseReason> {
        if core.connection(id).is_some_and(|c| c.is_outbound()) {
            return self.client.process_inbound(core, id, allow_partial);
        }
        if let Some(inbuf) = core.inbuf_mut(id) {
            inbuf.clear();
        }
        if core.connection(id).is_some_and(|c| !c.is_marked_for_close()) {
            core.append_bytes(id, &self.reply).map_err(|e| CloseReason::Protocol(e.to_string()))?;
            core.mark_and_flush(id).map_err(|e| CloseReason::Protocol(e.to_string()))?;
        }
        Ok(())
    }

    fn reached_eof(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        if core.connection(id).is_some_and(|c| c.is_outbound()) {
            return self.client.reached_eof(core, id);
        }
        if core.connection(id).is_some_and(|c| !c.is_marked_for_close()) {
            core.mark_for_close(id).map_err(|e| CloseReason::Protocol(e.to_string()))?;
        }
        Ok(())
    }

    fn finished_connecting(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        self.client.finished_connecting(core, id)
    }

    fn about_to_close(&mut self, core: &mut Core, id: ConnId, reason: Option<&CloseReason>) {
        self.client.about_to_close(core, id, reason)
    }
}

#[test]
fn flushing_close_delivers_every_record() {
    // Far more than the socket buffers hold, so the final records queue inside the session.
    let reply: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    let client = Recorder::default();
    let farewell = Farewell { reply: reply.clone(), client: client.clone() };

    let tls = TlsOptions::self_signed().unwrap();
    let mut rt = runtime(CoreOptions::default().with_tls(tls)).with_processor(RoleKind::Relay, farewell);

    let (_, addr) = listen(&mut rt, ListenerConfig::tcp(localhost(), ListenerRole::Relay).with_tls());
    let id = rt
        .core_mut()
        .connect(RoleKind::Relay, addr, ConnectOptions::default().with_tls())
        .unwrap();
    assert!(rt.run_until(WAIT, |_| client.seen().connected.contains(&id)).unwrap());

    rt.core_mut().append_bytes(id, b"send it all").unwrap();
    assert!(rt.run_until(WAIT, |_| client.seen().eof.contains(&id)).unwrap());

    let seen = client.seen();
    assert_eq!(seen.received.len(), reply.len());
    assert!(seen.received == reply);
    assert!(seen.closed.iter().all(|(_, reason)| reason.is_none()), "{:?}", seen.closed);
}
