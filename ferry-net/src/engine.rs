//! The readiness loop: turns events into reads and writes, charges the buckets, runs the
//! timers and frees closed connections.

use std::{
    io, mem,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use ferry_transport::IoOutcome;

use crate::{
    bandwidth::{Direction, RateClass},
    connection::{Io, RelayState, Role},
    reactor::{rate_class_of, WAKER_TOKEN},
    runtime::{Processor, Processors, Unprocessed},
    CloseReason, ConnId, Core, Error, TransportKind,
};

impl Core {
    /// Runs one loop turn: waits for readiness (at most `timeout`, and never past the next
    /// tick), handles every ready connection, runs the tick if it is due and frees the
    /// connections marked for close.
    pub(crate) fn turn(
        &mut self,
        procs: &mut Processors,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let timeout = if !self.ready_again.is_empty() || !self.pending_linked.is_empty() {
            Duration::ZERO
        } else {
            let until_tick = self.next_tick.saturating_duration_since(now);
            timeout.map_or(until_tick, |t| t.min(until_tick))
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                if let Some(quic) = &self.quic {
                    for token in quic.notifier().take_ready() {
                        ready.push((ConnId::from_token(token), true, true));
                    }
                }
                continue;
            }

            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            ready.push((ConnId::from_token(event.token()), readable, writable));
        }

        let mut again: Vec<_> = mem::take(&mut self.ready_again).into_iter().collect();
        again.sort_unstable();
        ready.extend(again.into_iter().map(|id| (id, true, true)));

        for (id, readable, writable) in ready {
            self.dispatch(procs, id, readable, writable);
        }

        let mut linked: Vec<_> = mem::take(&mut self.pending_linked).into_iter().collect();
        linked.sort_unstable();
        for id in linked {
            self.read_linked(procs, id);
        }

        let now = Instant::now();
        if now >= self.next_tick {
            self.tick(now);
        }

        self.sweep(procs, now);
        Ok(())
    }

    /// Handles readiness on one connection. The read always comes before the write.
    fn dispatch(&mut self, procs: &mut Processors, id: ConnId, readable: bool, writable: bool) {
        let Some(conn) = self.conns.get(&id) else {
            trace!(%id, "Readiness for a freed connection");
            return;
        };
        let marked = conn.is_marked_for_close();
        if marked && !conn.flags.hold_open_until_flushed {
            return;
        }

        match conn.kind() {
            TransportKind::Listener => {
                if readable && !marked {
                    self.accept_ready(procs, id);
                }
                return;
            }
            TransportKind::Linked | TransportKind::Closed => return,
            TransportKind::Stream(_) => {}
        }

        if conn.flags.connecting {
            self.finish_connecting(procs, id);
            return;
        }

        // A TLS session that needs the other direction's readiness turns that readiness into
        // the operation it was waiting for.
        let flags = conn.flags;
        let read = !marked &&
            ((readable && flags.reading && !flags.read_blocked_on_bw) ||
                (writable && flags.want_write_for_read));
        let write = (writable && flags.writing && !flags.write_blocked_on_bw) ||
            (readable && flags.want_read_for_write);

        if read {
            self.handle_read(procs, id);
        }

        let still_writable = self
            .conns
            .get(&id)
            .is_some_and(|c| !c.is_marked_for_close() || c.flags.hold_open_until_flushed);
        if write && still_writable {
            self.handle_write(procs, id);
        }
    }

    fn handle_read(&mut self, procs: &mut Processors, id: ConnId) {
        let now = Instant::now();
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let class = rate_class_of(&self.limiter, conn, now);
        let budget = self.limiter.budget(Direction::Read, class, conn.bucket.as_ref());
        if budget == 0 {
            self.block_on_bandwidth(id, Direction::Read);
            return;
        }

        let Io::Stream(stream) = &mut conn.io else { return };
        let result = {
            let _span = conn.span.enter();
            stream.read_into(&mut conn.inbuf, budget)
        };

        let want_write = matches!(result, Ok(IoOutcome::WantWrite));
        let (n, eof) = match result {
            Ok(IoOutcome::Transferred(n)) => (n, false),
            Ok(IoOutcome::Closed) => (0, true),
            Ok(IoOutcome::WouldBlock | IoOutcome::WantRead | IoOutcome::WantWrite) => (0, false),
            Err(e) => {
                debug!(parent: &conn.span, ?e, "Read failed");
                self.close_for_error(id, CloseReason::Transport(e.to_string()));
                return;
            }
        };

        if conn.flags.want_write_for_read != want_write {
            conn.flags.want_write_for_read = want_write;
            self.refresh_interest(id);
        }

        if n > 0 {
            trace!(%id, n, budget, "Read");
            self.account(id, n, 0, class, now);
            // Edge-triggered: keep reading until the stream reports would-block or EOF, or a
            // FIN that arrived with the data is never seen.
            self.ready_again.insert(id);
        }

        self.check_tls_handshake(procs, id);
        if n > 0 {
            self.process_read(procs, id, false);
        }
        if eof {
            self.handle_eof(procs, id);
        }
    }

    /// Moves bytes from a linked peer's output buffer into our input buffer. No system call
    /// is involved; the peer's buffer chunks are relinked.
    fn read_linked(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else { return };
        if conn.is_marked_for_close() || !conn.flags.reading || !conn.is_linked() {
            return;
        }
        let budget = self.limiter.budget(Direction::Read, RateClass::UNLIMITED, None);

        let peer = conn.linked_peer;
        let taken = peer.and_then(|p| self.conns.get_mut(&p)).map(|p| {
            let marked = p.is_marked_for_close();
            (p.id, mem::take(&mut p.outbuf), marked)
        });
        let Some((peer, mut src, peer_marked)) = taken else {
            trace!(%id, "Linked peer is gone");
            self.handle_eof(procs, id);
            return;
        };

        let moved = match self.conns.get_mut(&id) {
            Some(conn) => src.move_to(&mut conn.inbuf, budget),
            None => 0,
        };
        let remaining = src.len();
        let now = Instant::now();
        if let Some(p) = self.conns.get_mut(&peer) {
            p.outbuf = src;
            if moved > 0 {
                p.counters.bytes_written += moved as u64;
                p.counters.last_written = Some(now);
            }
        }

        if moved > 0 {
            trace!(%id, %peer, moved, "Linked read");
            self.account(id, moved, 0, RateClass::UNLIMITED, now);
            self.process_read(procs, id, false);
        }
        if remaining > 0 {
            self.pending_linked.insert(id);
        } else {
            self.linked_peer_drained(procs, peer);
        }
        if peer_marked && remaining == 0 {
            self.handle_eof(procs, id);
        }
    }

    /// The reading side of a linked pair emptied `peer`'s output buffer.
    fn linked_peer_drained(&mut self, procs: &mut Processors, peer: ConnId) {
        let Some(p) = self.conns.get_mut(&peer) else { return };
        p.flags.hold_open_until_flushed = false;
        if !p.flags.writing {
            return;
        }
        p.flags.writing = false;
        if !p.is_marked_for_close() {
            self.call(procs, peer, |p, core| p.finished_flushing(core, peer));
        }
    }

    fn handle_write(&mut self, procs: &mut Processors, id: ConnId) {
        let now = Instant::now();
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let class = rate_class_of(&self.limiter, conn, now);
        let budget = self.limiter.budget(Direction::Write, class, conn.bucket.as_ref());
        if budget == 0 {
            self.block_on_bandwidth(id, Direction::Write);
            return;
        }

        let Io::Stream(stream) = &mut conn.io else { return };
        let result = {
            let _span = conn.span.enter();
            stream.write_from(&mut conn.outbuf, budget)
        };

        let want_read = matches!(result, Ok(IoOutcome::WantRead));
        let n = match result {
            // Zero bytes written is not an error: the transport will take more later.
            Ok(IoOutcome::Transferred(n)) => n,
            Ok(IoOutcome::WouldBlock | IoOutcome::WantRead | IoOutcome::WantWrite) => 0,
            Ok(IoOutcome::Closed) => {
                self.close_for_error(id, CloseReason::Transport("closed while writing".into()));
                return;
            }
            Err(e) => {
                debug!(parent: &conn.span, ?e, "Write failed");
                self.close_for_error(id, CloseReason::Transport(e.to_string()));
                return;
            }
        };
        let flushed = conn.outbuf.is_empty() && !stream.has_pending_output();

        if conn.flags.want_read_for_write != want_read {
            conn.flags.want_read_for_write = want_read;
            self.refresh_interest(id);
        }

        if n > 0 {
            trace!(%id, n, budget, "Wrote");
            self.account(id, 0, n, class, now);
            if n >= budget && !flushed {
                self.ready_again.insert(id);
            }
        }

        self.check_tls_handshake(procs, id);
        if flushed {
            self.output_flushed(procs, id);
        }
    }

    /// The output buffer reached the network.
    fn output_flushed(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if conn.flags.want_read_for_write {
            return;
        }

        if conn.flags.writing {
            conn.flags.writing = false;
            self.refresh_interest(id);
        }

        let Some(conn) = self.conns.get(&id) else { return };
        if conn.flags.hold_open_until_flushed {
            trace!(%id, "Flushed before close");
            return;
        }
        // Handshake traffic is ours, not the processor's.
        let handshaking = matches!(conn.role, Role::Relay(state) if state != RelayState::Open);
        if !conn.is_marked_for_close() && !handshaking {
            self.call(procs, id, |p, core| p.finished_flushing(core, id));
        }
    }

    /// Hands new input to the processor, or to the proxy handshake while one is running.
    fn process_read(&mut self, procs: &mut Processors, id: ConnId, allow_partial: bool) {
        let Some(conn) = self.conns.get(&id) else { return };
        if conn.is_marked_for_close() {
            return;
        }

        let relay = match &conn.role {
            Role::Relay(state) => Some(*state),
            _ => None,
        };
        let idle = conn.inbuf.is_empty() && !allow_partial;

        match relay {
            Some(RelayState::ProxyHandshaking) => self.advance_proxy(procs, id),
            // The session is still being negotiated; nothing is plaintext yet.
            Some(RelayState::Connecting | RelayState::TlsHandshaking) => {}
            _ if idle => {}
            _ => self.call(procs, id, |p, core| p.process_inbound(core, id, allow_partial)),
        }
    }

    fn handle_eof(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if conn.flags.reached_eof {
            return;
        }
        debug!(parent: &conn.span, "Reached EOF");
        conn.flags.reached_eof = true;
        conn.flags.reading = false;
        let midway = matches!(conn.role, Role::Relay(state) if state != RelayState::Open);
        self.refresh_interest(id);

        if midway {
            self.close_for_error(id, CloseReason::Transport("EOF during handshake".into()));
            return;
        }

        let Some(conn) = self.conns.get(&id) else { return };
        if conn.is_marked_for_close() {
            return;
        }
        if !conn.inbuf.is_empty() {
            self.process_read(procs, id, true);
        }
        if self.conns.get(&id).is_some_and(|c| !c.is_marked_for_close()) {
            self.call(procs, id, |p, core| p.reached_eof(core, id));
        }
    }

    /// Relay links leave the TLS handshake state once the session is established.
    pub(crate) fn check_tls_handshake(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else { return };
        if conn.role != Role::Relay(RelayState::TlsHandshaking) || conn.is_marked_for_close() {
            return;
        }
        let Io::Stream(stream) = &conn.io else { return };
        if stream.is_handshaking() {
            return;
        }

        debug!(parent: &conn.span, "TLS handshake finished");
        self.relay_open(procs, id);
    }

    /// Usage counters, stats, bucket charges and the traffic sink, after `read` and
    /// `written` bytes moved.
    fn account(&mut self, id: ConnId, read: usize, written: usize, class: RateClass, now: Instant) {
        let Some(conn) = self.conns.get_mut(&id) else { return };

        if read > 0 {
            conn.counters.bytes_read += read as u64;
            conn.counters.last_read = Some(now);
            self.stats.increment_rx(read);
            self.limiter.spend(Direction::Read, class, conn.bucket.as_mut(), read);
        }
        if written > 0 {
            conn.counters.bytes_written += written as u64;
            conn.counters.last_written = Some(now);
            self.stats.increment_tx(written);
            self.limiter.spend(Direction::Write, class, conn.bucket.as_mut(), written);
        }

        let bucket = conn.bucket.as_ref();
        let read_empty = read > 0 && self.limiter.is_exhausted(Direction::Read, class, bucket);
        let write_empty =
            written > 0 && self.limiter.is_exhausted(Direction::Write, class, bucket);

        if let Some(sink) = self.sink.as_mut() {
            sink.record(id, conn.role.kind(), read, written, now);
        }

        if read_empty {
            self.block_on_bandwidth(id, Direction::Read);
        }
        if write_empty {
            self.block_on_bandwidth(id, Direction::Write);
        }
    }

    fn tick(&mut self, now: Instant) {
        self.refill(now);

        let open = self.descriptor_count();
        self.check_oos(open, false);

        self.next_tick = now + self.options.tick_interval;
    }

    /// Frees connections marked for close, except those still flushing before their
    /// deadline.
    fn sweep(&mut self, procs: &mut Processors, now: Instant) {
        let mut doomed = Vec::new();
        let mut expired = Vec::new();
        for conn in self.conns.values() {
            if !conn.is_marked_for_close() {
                continue;
            }

            let can_flush = match conn.io {
                Io::Stream(_) => true,
                Io::Linked => conn.linked_peer.is_some(),
                Io::Listener(_) | Io::Closed => false,
            };
            let unflushed = !conn.outbuf.is_empty() || conn.io.has_pending_output();
            if conn.flags.hold_open_until_flushed && can_flush && unflushed {
                if conn.flush_deadline.map_or(true, |deadline| now < deadline) {
                    continue;
                }
                expired.push(conn.id);
            }
            doomed.push(conn.id);
        }

        for id in expired {
            warn!(%id, "Gave up flushing");
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.close_reason.get_or_insert(CloseReason::FlushTimeout);
            }
            self.close_immediately(id);
        }

        doomed.sort_unstable();
        for id in doomed {
            let reason = self.conns.get(&id).and_then(|c| c.close_reason.clone());
            self.call_about_to_close(procs, id, reason.as_ref());

            let Some(mut conn) = self.conns.remove(&id) else { continue };
            conn.release_io(self.poll.registry());
            if let Some(peer) = conn.linked_peer {
                if let Some(p) = self.conns.get_mut(&peer) {
                    p.linked_peer = None;
                }
                self.pending_linked.insert(peer);
            }
            self.ready_again.remove(&id);
            self.pending_linked.remove(&id);
            self.stats.increment_closed();
            debug!(parent: &conn.span, ?reason, "Freed");
        }
    }

    /// Runs a processor hook for the connection's role. A hook error closes the connection
    /// on the error path.
    pub(crate) fn call(
        &mut self,
        procs: &mut Processors,
        id: ConnId,
        hook: impl FnOnce(&mut dyn Processor, &mut Self) -> Result<(), CloseReason>,
    ) {
        let Some(kind) = self.conns.get(&id).map(|c| c.role.kind()) else { return };
        let mut fallback = Unprocessed;
        let processor: &mut dyn Processor = match procs.get_mut(&kind) {
            Some(p) => p.as_mut(),
            None => &mut fallback,
        };

        if let Err(reason) = hook(processor, self) {
            debug!(%id, %reason, "Processor failed");
            self.close_for_error(id, reason);
        }
    }

    fn call_about_to_close(
        &mut self,
        procs: &mut Processors,
        id: ConnId,
        reason: Option<&CloseReason>,
    ) {
        let Some(kind) = self.conns.get(&id).map(|c| c.role.kind()) else { return };
        if let Some(processor) = procs.get_mut(&kind) {
            processor.about_to_close(self, id, reason);
        }
    }
}
