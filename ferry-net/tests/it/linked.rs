use ferry_net::{CoreOptions, EntryState, ExitState, Role, RoleKind, TransportKind};

use crate::common::{runtime, Echo, Recorder, WAIT};

#[test]
fn linked_pair_moves_bytes_without_sockets() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default())
        .with_processor(RoleKind::Entry, Echo)
        .with_processor(RoleKind::Exit, recorder.clone());

    let (entry, exit) = rt
        .core_mut()
        .create_linked_pair(Role::Entry(EntryState::Open), Role::Exit(ExitState::Open));
    let conn = rt.core().connection(entry).unwrap();
    assert_eq!(conn.kind(), TransportKind::Linked);
    assert_eq!(conn.linked_peer(), Some(exit));
    assert_eq!(rt.core().descriptor_count(), 0);

    rt.core_mut().append_bytes(exit, b"ping").unwrap();
    assert!(rt.run_until(WAIT, |_| recorder.seen().received == b"ping").unwrap());
    assert!(recorder.seen().flushed.contains(&exit));
    assert_eq!(rt.core().connection(entry).unwrap().bytes_read(), 4);
    assert_eq!(rt.core().connection(exit).unwrap().bytes_written(), 4);
}

#[test]
fn flushing_close_delivers_then_ends_the_stream() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Exit, recorder.clone());

    let (entry, exit) = rt
        .core_mut()
        .create_linked_pair(Role::Entry(EntryState::Open), Role::Exit(ExitState::Open));

    rt.core_mut().append_bytes(entry, b"last words").unwrap();
    rt.core_mut().mark_and_flush(entry).unwrap();
    assert!(rt.core().connection(entry).unwrap().is_marked_for_close());

    assert!(rt.run_until(WAIT, |core| core.is_empty()).unwrap());
    let seen = recorder.seen();
    assert_eq!(seen.received, b"last words");
    assert_eq!(seen.eof, vec![exit]);
    assert_eq!(seen.closed_ids(), vec![exit]);
}

#[test]
fn freeing_one_side_unlinks_the_other() {
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Exit, recorder.clone());

    let (entry, exit) = rt
        .core_mut()
        .create_linked_pair(Role::Entry(EntryState::Open), Role::Exit(ExitState::Open));

    // Without flushing, pending output is dropped with the connection.
    rt.core_mut().append_bytes(entry, b"lost").unwrap();
    rt.core_mut().close_immediately(entry);
    rt.core_mut().mark_for_close(entry).unwrap();

    assert!(rt.run_until(WAIT, |core| core.connection(entry).is_none()).unwrap());
    assert!(rt.run_until(WAIT, |_| recorder.seen().eof.contains(&exit)).unwrap());
    assert!(recorder.seen().received.is_empty());
}
