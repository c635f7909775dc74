use ferry_net::{ConnectOptions, CoreOptions, ListenerConfig, ListenerRole, RoleKind};
use ferry_transport::{quic::QuicConfig, StreamKind};

use crate::common::{listen, localhost, runtime, Echo, Recorder, WAIT};

#[test]
fn quic_streams_run_through_the_same_loop() {
    let recorder = Recorder::default();
    let options = CoreOptions::default().with_quic(QuicConfig::self_signed().unwrap());
    let mut rt = runtime(options)
        .with_processor(RoleKind::Entry, Echo)
        .with_processor(RoleKind::Exit, recorder.clone());

    let (_, addr) = listen(&mut rt, ListenerConfig::quic(localhost(), ListenerRole::Entry));
    let id = rt.core_mut().connect(RoleKind::Exit, addr, ConnectOptions::default().over_quic()).unwrap();
    assert_eq!(
        rt.core().connection(id).unwrap().kind(),
        ferry_net::TransportKind::Stream(StreamKind::Quic)
    );

    assert!(rt.run_until(WAIT, |_| recorder.seen().connected.contains(&id)).unwrap());

    // The server learns about the stream from its first bytes.
    rt.core_mut().append_bytes(id, b"quic ping").unwrap();
    assert!(rt.run_until(WAIT, |_| recorder.seen().received == b"quic ping").unwrap());
    assert_eq!(rt.core().stats().accepted(), 1);

    // QUIC streams share the endpoint's descriptor.
    let listeners_and_endpoint = 2;
    assert_eq!(rt.core().descriptor_count(), listeners_and_endpoint);
}

#[test]
fn quic_finish_after_data_reaches_the_server() {
    let client = Recorder::default();
    let server = Recorder::default();
    let options = CoreOptions::default().with_quic(QuicConfig::self_signed().unwrap());
    let mut rt = runtime(options)
        .with_processor(RoleKind::Entry, server.clone())
        .with_processor(RoleKind::Exit, client.clone());

    let (_, addr) = listen(&mut rt, ListenerConfig::quic(localhost(), ListenerRole::Entry));
    let id = rt.core_mut().connect(RoleKind::Exit, addr, ConnectOptions::default().over_quic()).unwrap();
    assert!(rt.run_until(WAIT, |_| client.seen().connected.contains(&id)).unwrap());

    // More than the stream's event queue holds, followed at once by the finish.
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 239) as u8).collect();
    rt.core_mut().append_bytes(id, &payload).unwrap();
    rt.core_mut().mark_and_flush(id).unwrap();

    assert!(rt.run_until(WAIT, |_| !server.seen().eof.is_empty()).unwrap());
    let seen = server.seen();
    assert_eq!(seen.received.len(), payload.len());
    assert!(seen.received == payload);
    assert_eq!(seen.eof, seen.accepted);
    drop(seen);

    assert_eq!(client.seen().closed_ids(), vec![id]);
    assert_eq!(client.seen().closed[0].1, None);
}

#[test]
fn quic_needs_the_backend() {
    let mut rt = runtime(CoreOptions::default());
    let err = rt
        .core_mut()
        .open_listener(ListenerConfig::quic(localhost(), ListenerRole::Entry))
        .unwrap_err();
    assert!(matches!(
        err,
        ferry_net::Error::Transport(ferry_transport::Error::QuicDisabled)
    ));
}
