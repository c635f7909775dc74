use ferry_net::{
    CloseReason, ConnectOptions, CoreOptions, ListenerConfig, ListenerRole, OosOptions, RoleKind,
};

use crate::common::{listen, localhost, runtime, Recorder, WAIT};

#[test]
fn relay_links_with_fewest_sessions_are_closed_first() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default().with_oos(OosOptions::disabled()))
        .with_processor(RoleKind::Relay, recorder.clone());

    let (_, addr) = listen(&mut rt, ListenerConfig::tcp(localhost(), ListenerRole::Relay));
    let outbound: Vec<_> = (0..3)
        .map(|_| {
            rt.core_mut().connect(RoleKind::Relay, addr.clone(), ConnectOptions::default()).unwrap()
        })
        .collect();
    assert!(rt
        .run_until(WAIT, |_| {
            let seen = recorder.seen();
            seen.connected.len() == 3 && seen.accepted.len() == 3
        })
        .unwrap());

    let inbound = recorder.seen().accepted.clone();
    for (i, id) in outbound.iter().enumerate() {
        rt.core_mut().set_active_sessions(*id, 10 + i);
    }
    for (i, id) in inbound.iter().enumerate() {
        rt.core_mut().set_active_sessions(*id, i);
    }

    // A listener and six links.
    let open = rt.core().descriptor_count();
    assert_eq!(open, 7);

    rt.core_mut().set_oos_options(OosOptions::new(6, 4));
    assert_eq!(rt.core_mut().check_oos(open, false), 3);
    for id in &inbound {
        let conn = rt.core().connection(*id).unwrap();
        assert!(conn.is_marked_for_close());
        assert_eq!(conn.close_reason(), Some(&CloseReason::OutOfSockets));
    }
    assert!(outbound.iter().all(|id| !rt.core().connection(*id).unwrap().is_marked_for_close()));
    assert_eq!(rt.core().stats().oos_victims(), 3);

    // The victims no longer hold descriptors, so checking again closes nothing more.
    let open = rt.core().descriptor_count();
    assert_eq!(open, 4);
    assert_eq!(rt.core_mut().check_oos(open, false), 0);

    assert!(rt
        .run_until(WAIT, |_| {
            let seen = recorder.seen();
            seen.closed.iter().filter(|(_, r)| r == &Some(CloseReason::OutOfSockets)).count() == 3
        })
        .unwrap());
}

#[test]
fn exhaustion_sheds_a_tenth() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default().with_oos(OosOptions::disabled()))
        .with_processor(RoleKind::Exit, recorder.clone());

    let (_, addr) = listen(&mut rt, ListenerConfig::tcp(localhost(), ListenerRole::Entry));
    let ids: Vec<_> = (0..9)
        .map(|_| rt.core_mut().connect(RoleKind::Exit, addr.clone(), ConnectOptions::default()).unwrap())
        .collect();
    assert!(rt.run_until(WAIT, |core| core.stats().accepted() == 9).unwrap());

    // 19 open, far below the threshold; a failed allocation still costs one tenth.
    rt.core_mut().set_oos_options(OosOptions::new(1000, 500));
    let open = rt.core().descriptor_count();
    assert_eq!(open, 19);
    assert_eq!(rt.core_mut().check_oos(open, true), 2);
    assert_eq!(rt.core_mut().check_oos(open, false), 0);

    // Nothing is a relay link and nobody reported sessions, so the oldest go first.
    assert!(rt.core().connection(ids[0]).unwrap().is_marked_for_close());
    assert!(!rt.core().connection(ids[8]).unwrap().is_marked_for_close());
}
