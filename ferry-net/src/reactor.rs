use std::{fmt, panic::Location, time::Instant};

use mio::{Events, Poll, Token, Waker};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use ferry_transport::{quic::QuicContext, Address};
use ferry_wire::Buffer;

use crate::{
    bandwidth::{Direction, Limiter, RateClass, RELAY_RECORD_SIZE, STREAM_RECORD_SIZE},
    connection::{Connection, Io, RelayState, Role, RoleKind},
    oos::{self, OosCandidate},
    options::{BandwidthOptions, CoreOptions, OosOptions},
    stats::{CoreStats, TrafficSink},
    CloseReason, ConnId, Error,
};

/// Token of the waker the QUIC backend uses. Connection ids never get this high.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// The connection core: every connection and listener, the buckets, and the readiness loop
/// that drives them.
///
/// All state is owned here and touched from one thread. Protocol code works on it through
/// the [`Processor`](crate::Processor) callbacks, which receive `&mut Core`.
pub struct Core {
    pub(crate) poll: Poll,
    pub(crate) events: Events,
    pub(crate) conns: FxHashMap<ConnId, Connection>,
    next_id: usize,
    pub(crate) limiter: Limiter,
    pub(crate) options: CoreOptions,
    pub(crate) quic: Option<QuicContext>,
    pub(crate) stats: CoreStats,
    pub(crate) sink: Option<Box<dyn TrafficSink>>,
    /// Connections to attempt again without waiting for a readiness event. The loop is
    /// edge-triggered, so anything that stopped short of would-block goes here.
    pub(crate) ready_again: FxHashSet<ConnId>,
    /// Linked connections whose peer has bytes (or an EOF) for them.
    pub(crate) pending_linked: FxHashSet<ConnId>,
    pub(crate) next_tick: Instant,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("connections", &self.conns.len())
            .field("quic", &self.quic.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Core {
    pub fn new(options: CoreOptions) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let quic = match options.quic.clone() {
            Some(config) => {
                let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
                Some(QuicContext::new(waker, config)?)
            }
            None => None,
        };

        let now = Instant::now();
        Ok(Self {
            events: Events::with_capacity(options.event_capacity),
            poll,
            conns: FxHashMap::default(),
            next_id: 1,
            limiter: Limiter::new(options.bandwidth.clone(), now),
            next_tick: now + options.tick_interval,
            options,
            quic,
            stats: CoreStats::default(),
            sink: None,
            ready_again: FxHashSet::default(),
            pending_linked: FxHashSet::default(),
        })
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn stats(&self) -> &CoreStats {
        &self.stats
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut Limiter {
        &mut self.limiter
    }

    /// Applies new bandwidth options. Open relay links keep their current buckets.
    pub fn reconfigure_bandwidth(&mut self, options: BandwidthOptions) {
        self.limiter.reconfigure(options.clone());
        self.options.bandwidth = options;
    }

    pub fn set_oos_options(&mut self, oos: OosOptions) {
        self.options.oos = oos;
    }

    pub fn set_traffic_sink(&mut self, sink: impl TrafficSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.conns.values()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn inbuf_mut(&mut self, id: ConnId) -> Option<&mut Buffer> {
        self.conns.get_mut(&id).map(|c| &mut c.inbuf)
    }

    /// Direct access to the output buffer. Call [`Core::start_writing`] after adding bytes.
    pub fn outbuf_mut(&mut self, id: ConnId) -> Option<&mut Buffer> {
        self.conns.get_mut(&id).map(|c| &mut c.outbuf)
    }

    /// Queues `data` for writing and makes sure the connection is writing. Returns the new
    /// length of the output buffer.
    pub fn append_bytes(&mut self, id: ConnId, data: &[u8]) -> Result<usize, Error> {
        let conn = self.conns.get_mut(&id).ok_or(Error::UnknownConnection(id))?;
        if conn.is_marked_for_close() && !conn.flags.hold_open_until_flushed {
            trace!(%id, "Dropping bytes for a closing connection");
            return Ok(conn.outbuf.len());
        }

        let len = conn.outbuf.append(data);
        self.start_writing(id)?;
        Ok(len)
    }

    pub fn start_reading(&mut self, id: ConnId) -> Result<(), Error> {
        self.set_reading(id, true)
    }

    pub fn stop_reading(&mut self, id: ConnId) -> Result<(), Error> {
        self.set_reading(id, false)
    }

    pub fn start_writing(&mut self, id: ConnId) -> Result<(), Error> {
        self.set_writing(id, true)
    }

    pub fn stop_writing(&mut self, id: ConnId) -> Result<(), Error> {
        self.set_writing(id, false)
    }

    pub(crate) fn set_reading(&mut self, id: ConnId, reading: bool) -> Result<(), Error> {
        let conn = self.conns.get_mut(&id).ok_or(Error::UnknownConnection(id))?;
        conn.flags.reading = reading;
        if reading && conn.is_linked() {
            self.pending_linked.insert(id);
        }
        self.refresh_interest(id);
        Ok(())
    }

    pub(crate) fn set_writing(&mut self, id: ConnId, writing: bool) -> Result<(), Error> {
        let conn = self.conns.get_mut(&id).ok_or(Error::UnknownConnection(id))?;
        conn.flags.writing = writing;
        if writing {
            // Linked connections never write; their peer pulls.
            if let Some(peer) = conn.linked_peer {
                self.pending_linked.insert(peer);
            }
        }
        self.refresh_interest(id);
        Ok(())
    }

    /// Schedules the connection for teardown at the end of the current loop turn. Marking a
    /// connection twice is a bug in the caller and reported as [`Error::AlreadyMarked`].
    #[track_caller]
    pub fn mark_for_close(&mut self, id: ConnId) -> Result<(), Error> {
        self.mark(id, Location::caller(), false)
    }

    /// Like [`Core::mark_for_close`], but the connection stays around until its output
    /// buffer is flushed or the flush timeout expires.
    #[track_caller]
    pub fn mark_and_flush(&mut self, id: ConnId) -> Result<(), Error> {
        self.mark(id, Location::caller(), true)
    }

    fn mark(
        &mut self,
        id: ConnId,
        location: &'static Location<'static>,
        flush: bool,
    ) -> Result<(), Error> {
        let flush_timeout = self.options.flush_timeout;
        let conn = self.conns.get_mut(&id).ok_or(Error::UnknownConnection(id))?;
        if let Some(first) = conn.marked_at {
            warn!(%id, %first, again = %location, "Connection marked for close twice");
            return Err(Error::AlreadyMarked { id, first });
        }

        debug!(parent: &conn.span, %location, flush, "Marked for close");
        conn.marked_at = Some(location);
        if flush && (!conn.outbuf.is_empty() || conn.io.has_pending_output()) {
            conn.flags.hold_open_until_flushed = true;
            conn.flags.writing = true;
            conn.flush_deadline = Some(Instant::now() + flush_timeout);
        }

        if let Some(peer) = conn.linked_peer {
            // The peer reads an EOF once our output is drained.
            self.pending_linked.insert(peer);
        }
        self.refresh_interest(id);
        Ok(())
    }

    /// Shuts the transport down right away. The connection itself stays registered until it
    /// is marked and swept, so other holders of its id see a closed connection, not a
    /// missing one. Pending output is discarded.
    pub fn close_immediately(&mut self, id: ConnId) {
        let registry = self.poll.registry();
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if matches!(conn.io, Io::Closed) {
            trace!(%id, "Transport already closed");
            return;
        }

        debug!(parent: &conn.span, "Closing transport");
        conn.release_io(registry);
        conn.outbuf.clear();
        conn.flags.reading = false;
        conn.flags.writing = false;
        conn.flags.hold_open_until_flushed = false;
    }

    /// The error path: closes the transport, marks the connection, and records `reason` for
    /// the processor's [`about_to_close`](crate::Processor::about_to_close) hook.
    #[track_caller]
    pub fn close_for_error(&mut self, id: ConnId, reason: CloseReason) {
        let location = Location::caller();
        let Some(conn) = self.conns.get_mut(&id) else { return };

        debug!(parent: &conn.span, %reason, "Closing on error");
        let marked = conn.is_marked_for_close();
        if conn.close_reason.is_none() {
            conn.close_reason = Some(reason);
        }

        self.close_immediately(id);
        if !marked {
            let _ = self.mark(id, location, false);
        }
    }

    /// Moves a connection to a new state of the same role. Returns `false` and changes
    /// nothing if the connection is marked for close or the role would change.
    pub fn transition(&mut self, id: ConnId, role: Role) -> bool {
        let now = Instant::now();
        let Some(conn) = self.conns.get_mut(&id) else { return false };
        if conn.is_marked_for_close() {
            trace!(%id, ?role, "Ignoring transition of a closing connection");
            return false;
        }
        if conn.role.kind() != role.kind() {
            warn!(%id, from = ?conn.role, to = ?role, "Refusing to change the role of a connection");
            return false;
        }

        debug!(parent: &conn.span, from = ?conn.role, to = ?role, "Transition");
        if role == Role::Relay(RelayState::Open) && conn.bucket.is_none() && !conn.flags.local {
            conn.bucket = self.limiter.connection_bucket(now);
        }
        conn.role = role;
        true
    }

    /// Records how many sessions the layer above multiplexes over a connection.
    pub fn set_active_sessions(&mut self, id: ConnId, sessions: usize) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.active_sessions = sessions;
        }
    }

    /// Records that a client used the connection, which keeps a relay link out of the
    /// relayed traffic class for a while.
    pub fn note_client_use(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.counters.last_client_use = Some(Instant::now());
        }
    }

    /// Creates two connections that exchange bytes in-process. Both start out reading.
    pub fn create_linked_pair(&mut self, a: Role, b: Role) -> (ConnId, ConnId) {
        let now = Instant::now();
        let (a_id, b_id) = (self.next_id(), self.next_id());

        for (id, role, peer) in [(a_id, a, b_id), (b_id, b, a_id)] {
            let mut conn = Connection::new(id, role, Io::Linked, None, self.options.chunk_size, now);
            conn.flags.linked = true;
            conn.flags.local = true;
            conn.flags.reading = true;
            conn.linked_peer = Some(peer);
            self.conns.insert(id, conn);
        }

        debug!(a = %a_id, b = %b_id, "Created linked pair");
        (a_id, b_id)
    }

    /// Descriptors held by connections, listeners, and the QUIC client endpoint.
    pub fn descriptor_count(&self) -> usize {
        let quic = self.quic.as_ref().is_some_and(QuicContext::has_client_endpoint);
        self.conns.values().filter(|c| c.io.holds_descriptor()).count() + usize::from(quic)
    }

    /// Connections marked for close that still hold a descriptor.
    pub fn moribund_count(&self) -> usize {
        self.conns.values().filter(|c| c.is_moribund()).count()
    }

    /// Runs the out-of-sockets defense for `open` descriptors, `exhaustion` telling whether
    /// the attempt that triggered the check failed for lack of resources. Returns the number
    /// of connections closed.
    pub fn check_oos(&mut self, open: usize, exhaustion: bool) -> usize {
        let victims = oos::plan(open, exhaustion, &self.options.oos, self.moribund_count());
        if victims == 0 {
            return 0;
        }

        let mut candidates: Vec<_> = self
            .conns
            .values()
            .filter(|c| {
                !c.is_marked_for_close() &&
                    !c.role.is_listener() &&
                    !c.is_linked() &&
                    c.io.holds_descriptor()
            })
            .map(|c| OosCandidate {
                id: c.id,
                is_relay: c.role.is_relay(),
                sessions: c.active_sessions,
            })
            .collect();
        candidates.sort_by_key(|c| c.id);

        let chosen = oos::select_victims(candidates, victims);
        warn!(open, exhaustion, wanted = victims, closing = chosen.len(), "Running out of sockets");

        for &id in &chosen {
            self.close_for_error(id, CloseReason::OutOfSockets);
        }
        self.stats.increment_oos_victims(chosen.len());
        chosen.len()
    }

    /// Closes every connection and listener on the error path with [`CloseReason::Shutdown`].
    pub fn shutdown(&mut self) {
        let mut ids: Vec<_> = self.conns.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.close_for_error(id, CloseReason::Shutdown);
        }
    }

    pub(crate) fn next_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Creates a connection and starts watching it.
    pub(crate) fn insert(&mut self, conn: Connection) -> ConnId {
        let id = conn.id;
        self.conns.insert(id, conn);
        self.refresh_interest(id);
        id
    }

    /// Local connections (linked, Unix-domain, and private addresses unless configured
    /// otherwise) aren't rate limited.
    pub(crate) fn is_local_address(&self, address: Option<&Address>) -> bool {
        match address {
            Some(Address::Inet(addr)) => {
                !self.options.bandwidth.count_private_bandwidth &&
                    crate::policy::is_internal(addr.ip())
            }
            Some(Address::Unix(_)) | None => true,
        }
    }

    /// Brings the registration with the readiness loop in line with the connection's flags.
    /// Anything newly watched is also queued for an attempt, since edges that fired while
    /// we weren't watching are lost.
    pub(crate) fn refresh_interest(&mut self, id: ConnId) {
        let registry = self.poll.registry();
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if conn.is_linked() {
            return;
        }

        let desired = conn.desired_interest();
        let current = conn.registered;
        if desired == current {
            return;
        }

        if let Err(e) = conn.io.update_registration(registry, id.token(), current, desired) {
            warn!(%id, ?e, "Failed to update registration");
            conn.registered = None;
            self.close_for_error(id, CloseReason::Transport(e.to_string()));
            return;
        }
        conn.registered = desired;

        let gained = desired.is_some_and(|d| {
            current.map_or(true, |c| {
                (d.is_readable() && !c.is_readable()) || (d.is_writable() && !c.is_writable())
            })
        });
        if gained {
            self.ready_again.insert(id);
        }
    }

    /// Marks a direction as blocked on an empty bucket.
    pub(crate) fn block_on_bandwidth(&mut self, id: ConnId, dir: Direction) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        match dir {
            Direction::Read if !conn.flags.read_blocked_on_bw => {
                conn.flags.read_blocked_on_bw = true;
                self.stats.increment_read_blocked();
            }
            Direction::Write if !conn.flags.write_blocked_on_bw => {
                conn.flags.write_blocked_on_bw = true;
                self.stats.increment_write_blocked();
            }
            _ => return,
        }
        trace!(parent: &conn.span, ?dir, "Blocked on bandwidth");
        self.refresh_interest(id);
    }

    /// Refills every bucket and unblocks connections whose relevant buckets all have
    /// something in them again.
    pub fn refill(&mut self, now: Instant) {
        self.limiter.refill(now);

        let mut unblocked = Vec::new();
        for conn in self.conns.values_mut() {
            if let Some(bucket) = conn.bucket.as_mut() {
                bucket.refill(now);
            }
            if !conn.flags.read_blocked_on_bw && !conn.flags.write_blocked_on_bw {
                continue;
            }

            let class = rate_class_of(&self.limiter, conn, now);
            let bucket = conn.bucket.as_ref();
            let mut changed = false;
            if conn.flags.read_blocked_on_bw &&
                self.limiter.may_resume(Direction::Read, class, bucket)
            {
                conn.flags.read_blocked_on_bw = false;
                changed = true;
            }
            if conn.flags.write_blocked_on_bw &&
                self.limiter.may_resume(Direction::Write, class, bucket)
            {
                conn.flags.write_blocked_on_bw = false;
                changed = true;
            }
            if changed {
                unblocked.push(conn.id);
            }
        }

        for id in unblocked {
            trace!(%id, "Unblocked after refill");
            self.refresh_interest(id);
        }
    }
}

/// How the limiter treats `conn`. Local connections are never limited.
pub(crate) fn rate_class_of(limiter: &Limiter, conn: &Connection, now: Instant) -> RateClass {
    if conn.flags.local {
        return RateClass::UNLIMITED;
    }

    let relay = conn.role.kind() == RoleKind::Relay;
    RateClass {
        limited: true,
        relayed: relay && limiter.is_relayed(conn.counters.last_client_use, now),
        base: if relay { RELAY_RECORD_SIZE } else { STREAM_RECORD_SIZE },
        priority: conn.role.kind() != RoleKind::Dir,
    }
}
