use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{CloseReason, ConnId, Core, CoreOptions, Error, RoleKind};

/// Protocol logic for one connection role. The core calls these hooks from its loop; each
/// gets the core itself so it can inspect buffers, queue output or close connections.
///
/// A hook that returns an error closes the connection through
/// [`Core::close_for_error`] with that reason.
pub trait Processor {
    /// New bytes are in the connection's input buffer. `allow_partial` is set at end of
    /// stream, when no more bytes will complete a partial message.
    fn process_inbound(
        &mut self,
        core: &mut Core,
        id: ConnId,
        allow_partial: bool,
    ) -> Result<(), CloseReason>;

    /// The output buffer was drained to the transport.
    fn finished_flushing(&mut self, _core: &mut Core, _id: ConnId) -> Result<(), CloseReason> {
        Ok(())
    }

    /// The peer closed its side. By default the connection is closed too.
    fn reached_eof(&mut self, core: &mut Core, id: ConnId) -> Result<(), CloseReason> {
        if core.connection(id).is_some_and(|c| !c.is_marked_for_close()) {
            if let Err(e) = core.mark_for_close(id) {
                debug!(%id, ?e, "Can't close after EOF");
            }
        }
        Ok(())
    }

    /// An outbound connection is up, including any proxy and TLS handshakes.
    fn finished_connecting(&mut self, _core: &mut Core, _id: ConnId) -> Result<(), CloseReason> {
        Ok(())
    }

    /// An inbound connection was accepted, and its TLS handshake finished if it has one.
    fn accepted(&mut self, _core: &mut Core, _id: ConnId) -> Result<(), CloseReason> {
        Ok(())
    }

    /// The connection is about to be freed. `reason` is set if it was closed on an error
    /// path.
    fn about_to_close(&mut self, _core: &mut Core, _id: ConnId, _reason: Option<&CloseReason>) {}
}

/// Leaves input where it is. Used for roles nobody registered a processor for.
#[derive(Debug, Default)]
pub(crate) struct Unprocessed;

impl Processor for Unprocessed {
    fn process_inbound(&mut self, _: &mut Core, _: ConnId, _: bool) -> Result<(), CloseReason> {
        Ok(())
    }
}

pub(crate) type Processors = FxHashMap<RoleKind, Box<dyn Processor>>;

/// A [`Core`] together with the processors for its roles: everything needed to run the loop.
pub struct Runtime {
    core: Core,
    processors: Processors,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("roles", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Runtime {
    pub fn new(options: CoreOptions) -> Result<Self, Error> {
        Ok(Self { core: Core::new(options)?, processors: FxHashMap::default() })
    }

    /// Installs the processor for connections of `kind`, replacing any previous one.
    pub fn with_processor(mut self, kind: RoleKind, processor: impl Processor + 'static) -> Self {
        self.processors.insert(kind, Box::new(processor));
        self
    }

    pub fn set_processor(&mut self, kind: RoleKind, processor: impl Processor + 'static) {
        self.processors.insert(kind, Box::new(processor));
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    /// Runs one loop turn, waiting at most `timeout` for readiness.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.core.turn(&mut self.processors, timeout)
    }

    /// Runs the loop until `done` returns `true` or `timeout` passes. Returns whether `done`
    /// was satisfied.
    pub fn run_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&Core) -> bool,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&self.core) {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.turn(Some(deadline - now))?;
        }
    }

    /// Closes everything and runs one last sweep so processors see every close.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        debug!(connections = self.core.len(), "Shutting down");
        self.core.shutdown();
        self.turn(Some(Duration::ZERO))
    }
}
