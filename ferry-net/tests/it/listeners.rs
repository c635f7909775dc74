use std::{net::TcpStream, time::Duration};

use ferry_net::{
    policy::AddressPolicy, CoreOptions, ListenerConfig, ListenerRole, RoleKind,
};

use crate::common::{entry_listener, listen, localhost, runtime, Recorder, WAIT};

#[test]
fn reconcile_keeps_unchanged_listeners() {
    let mut rt = runtime(CoreOptions::default());
    let path = std::env::temp_dir().join(format!("ferry-it-{}.sock", std::process::id()));

    let tcp = ListenerConfig::tcp(localhost(), ListenerRole::Relay);
    let unix = ListenerConfig::unix(&path, ListenerRole::Control);

    let diff = rt.core_mut().reconcile_listeners(&[tcp.clone(), unix.clone()]);
    assert_eq!(diff.opened.len(), 2);
    assert!(diff.closed.is_empty());
    assert!(path.exists());

    let again = rt.core_mut().reconcile_listeners(&[unix.clone(), tcp.clone()]);
    assert!(again.opened.is_empty());
    assert!(again.closed.is_empty());

    let shrunk = rt.core_mut().reconcile_listeners(&[tcp.clone()]);
    assert!(shrunk.opened.is_empty());
    assert_eq!(shrunk.closed, vec![diff.opened[1]]);

    rt.turn(Some(Duration::ZERO)).unwrap();
    assert_eq!(rt.core().len(), 1);
    assert!(!path.exists());

    // A listener that can't be opened is reported; the rest still happens.
    let tls = ListenerConfig::tcp(localhost(), ListenerRole::Relay).with_tls();
    let failed = rt.core_mut().reconcile_listeners(&[tcp, tls.clone()]);
    assert!(failed.opened.is_empty());
    assert_eq!(failed.failed.len(), 1);
    assert_eq!(failed.failed[0].0, tls);
}

#[test]
fn admission_policy_rejects_by_source() {
    let policy: AddressPolicy = "reject 127.0.0.0/8, accept *".parse().unwrap();
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default().with_policy(ListenerRole::Entry, policy))
        .with_processor(RoleKind::Entry, recorder.clone());

    let (_, addr) = listen(&mut rt, entry_listener());
    let _client = TcpStream::connect(addr.as_inet().unwrap()).unwrap();

    assert!(rt.run_until(WAIT, |core| core.stats().rejected() == 1).unwrap());
    assert_eq!(rt.core().stats().accepted(), 0);
    assert!(recorder.seen().accepted.is_empty());
    assert_eq!(rt.core().len(), 1);
}

#[test]
fn unix_listener_accepts_and_reads() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Control, recorder.clone());
    let path = std::env::temp_dir().join(format!("ferry-ctl-{}.sock", std::process::id()));

    let (_, addr) = listen(&mut rt, ListenerConfig::unix(&path, ListenerRole::Control));
    assert_eq!(addr, ferry_net::Address::Unix(path.clone()));

    let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
    std::io::Write::write_all(&mut client, b"AUTHENTICATE\r\n").unwrap();

    assert!(rt.run_until(WAIT, |_| recorder.seen().received == b"AUTHENTICATE\r\n").unwrap());
    let id = recorder.seen().accepted[0];
    let conn = rt.core().connection(id).unwrap();
    assert!(conn.is_local());
    assert!(!conn.role().is_open());

    drop(client);
    assert!(rt.run_until(WAIT, |_| recorder.seen().eof.contains(&id)).unwrap());
}
