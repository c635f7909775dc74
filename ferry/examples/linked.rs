use std::time::Duration;

use ferry::{
    CloseReason, ConnId, Core, CoreOptions, EntryState, ExitState, Processor, Role, RoleKind,
    Runtime,
};

/// Prints whatever arrives, line by line.
struct Printer;

impl Processor for Printer {
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        allow_partial: bool,
    ) -> Result<(), CloseReason> {
        let Some(inbuf) = core.inbuf_mut(id) else { return Ok(()) };
        while let Some(line) = inbuf.take_line() {
            println!("{id}: {}", String::from_utf8_lossy(&line));
        }
        if allow_partial && !inbuf.is_empty() {
            println!("{id}: {} (unterminated)", String::from_utf8_lossy(&inbuf.extract_all()));
            inbuf.clear();
        }
        Ok(())
    }
}

fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut rt = Runtime::new(CoreOptions::default())
        .unwrap()
        .with_processor(RoleKind::Exit, Printer);

    // Two connections joined in-process: no sockets, no descriptors, no rate limits.
    let (entry, _exit) = rt
        .core_mut()
        .create_linked_pair(Role::Entry(EntryState::Open), Role::Exit(ExitState::Open));

    rt.core_mut().append_bytes(entry, b"first line\nsecond line\nno newline").unwrap();
    rt.core_mut().mark_and_flush(entry).unwrap();

    rt.run_until(Duration::from_secs(1), |core| core.is_empty()).unwrap();
}
