use std::{
    io::Write,
    net::{Shutdown, TcpStream},
    time::{Duration, Instant},
};

use ferry_net::{BandwidthOptions, ConnectOptions, CoreOptions, RoleKind, TransportKind};

use crate::common::{entry_listener, listen, runtime, Echo, Recorder, WAIT};

#[test]
fn echo_round_trip_and_close() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default())
        .with_processor(RoleKind::Entry, Echo)
        .with_processor(RoleKind::Exit, recorder.clone());

    let (_, addr) = listen(&mut rt, entry_listener());
    let id = rt.core_mut().connect(RoleKind::Exit, addr, ConnectOptions::default()).unwrap();
    assert!(rt.core().connection(id).unwrap().is_connecting());

    assert!(rt.run_until(WAIT, |_| recorder.seen().connected.contains(&id)).unwrap());
    let conn = rt.core().connection(id).unwrap();
    assert!(conn.role().is_open());
    assert!(conn.is_local());
    assert!(matches!(conn.kind(), TransportKind::Stream(_)));

    rt.core_mut().append_bytes(id, b"hello ").unwrap();
    rt.core_mut().append_bytes(id, b"ferry").unwrap();
    assert!(rt.run_until(WAIT, |_| recorder.seen().received.len() == 11).unwrap());
    assert_eq!(recorder.seen().received, b"hello ferry");
    assert!(recorder.seen().flushed.contains(&id));

    let stats = rt.core().stats();
    assert_eq!(stats.accepted(), 1);
    assert_eq!(stats.connects_started(), 1);
    assert!(stats.bytes_rx() >= 22);
    assert!(stats.bytes_tx() >= 22);

    // Closing our side gives the echo side an EOF, and it closes too.
    rt.core_mut().mark_for_close(id).unwrap();
    assert!(rt.run_until(WAIT, |core| core.len() == 1).unwrap());
    assert_eq!(recorder.seen().closed_ids(), vec![id]);
    assert_eq!(recorder.seen().closed[0].1, None);
    assert_eq!(rt.core().stats().closed(), 2);
}

#[test]
fn eof_behind_data_is_not_lost() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Entry, recorder.clone());

    let (_, addr) = listen(&mut rt, entry_listener());
    let mut peer = TcpStream::connect(addr.as_inet().unwrap()).unwrap();
    // Data and FIN are both queued before the loop first looks at the socket, so they arrive
    // as a single readiness edge.
    peer.write_all(b"last words").unwrap();
    peer.shutdown(Shutdown::Write).unwrap();

    assert!(rt.run_until(WAIT, |_| !recorder.seen().eof.is_empty()).unwrap());
    let seen = recorder.seen();
    assert_eq!(seen.received, b"last words");
    assert_eq!(seen.eof, seen.accepted);
    drop(seen);

    assert!(rt.run_until(WAIT, |core| core.len() == 1).unwrap());
    assert_eq!(recorder.seen().closed_ids(), recorder.seen().accepted);
}

#[test]
fn refused_connect_is_reported() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Exit, recorder.clone());

    // Bind and drop to find a port nobody listens on.
    let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let id = match rt.core_mut().connect(RoleKind::Exit, addr.into(), ConnectOptions::default()) {
        Ok(id) => id,
        // Loopback connects may fail on the spot.
        Err(_) => {
            assert_eq!(rt.core().stats().connects_failed(), 1);
            return;
        }
    };

    assert!(rt.run_until(WAIT, |core| core.connection(id).is_none()).unwrap());
    let seen = recorder.seen();
    assert!(seen.connected.is_empty());
    assert!(matches!(
        seen.closed.as_slice(),
        [(closed, Some(ferry_net::CloseReason::ConnectFailed(_)))] if *closed == id
    ));
    assert_eq!(rt.core().stats().connects_failed(), 1);
}

#[test]
fn entry_connections_are_never_dialed() {
    let mut rt = runtime(CoreOptions::default());
    let err = rt
        .core_mut()
        .connect(RoleKind::Entry, crate::common::localhost().into(), ConnectOptions::default())
        .unwrap_err();
    assert!(matches!(err, ferry_net::Error::NotConnectable(RoleKind::Entry)));

    let tls = ConnectOptions::default().with_tls();
    let err =
        rt.core_mut().connect(RoleKind::Exit, crate::common::localhost().into(), tls).unwrap_err();
    assert!(matches!(err, ferry_net::Error::Unsupported(_)));
}

#[test]
fn rate_limited_transfer_arrives_intact() {
    const LEN: usize = 512 * 1024;

    // Count loopback traffic so the buckets apply.
    let bandwidth = BandwidthOptions::default()
        .with_rate(1024 * 1024, 64 * 1024)
        .with_private_bandwidth_counted(true);
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default().with_bandwidth(bandwidth))
        .with_processor(RoleKind::Entry, Echo)
        .with_processor(RoleKind::Exit, recorder.clone());

    let (_, addr) = listen(&mut rt, entry_listener());
    let id = rt.core_mut().connect(RoleKind::Exit, addr, ConnectOptions::default()).unwrap();
    assert!(!rt.core().connection(id).unwrap().is_local());

    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    let start = Instant::now();
    rt.core_mut().append_bytes(id, &payload).unwrap();

    assert!(rt
        .run_until(Duration::from_secs(30), |_| recorder.seen().received.len() == LEN)
        .unwrap());
    assert_eq!(recorder.seen().received, payload);

    // Most of it had to wait for refills.
    assert!(start.elapsed() >= Duration::from_millis(200));
    let stats = rt.core().stats();
    assert!(stats.read_blocked() + stats.write_blocked() > 0);
}
