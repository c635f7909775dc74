use std::{fmt, panic::Location, time::Instant};

use mio::{Interest, Registry, Token};
use tracing::{debug, Span};

use ferry_transport::{Address, Listener, Stream, StreamKind};
use ferry_wire::{proxy::ProxyHandshake, Buffer};

use crate::{bandwidth::TokenBucket, CloseReason};

mod role;
pub use role::*;

/// Identifies a connection for its whole lifetime. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) usize);

impl ConnId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a connection moves bytes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream(StreamKind),
    Listener,
    /// An in-process peer connection.
    Linked,
    /// The transport was released by a close.
    Closed,
}

/// The transport handle a connection owns.
#[derive(Debug)]
pub(crate) enum Io {
    Stream(Stream),
    Listener(Listener),
    Linked,
    Closed,
}

impl Io {
    pub(crate) fn kind(&self) -> TransportKind {
        match self {
            Self::Stream(s) => TransportKind::Stream(s.kind()),
            Self::Listener(_) => TransportKind::Listener,
            Self::Linked => TransportKind::Linked,
            Self::Closed => TransportKind::Closed,
        }
    }

    /// Returns `true` if this handle holds a descriptor of its own. QUIC streams ride on a
    /// shared endpoint; QUIC listeners own theirs.
    pub(crate) fn holds_descriptor(&self) -> bool {
        match self {
            Self::Stream(s) => s.kind() != StreamKind::Quic,
            Self::Listener(_) => true,
            Self::Linked | Self::Closed => false,
        }
    }

    /// Returns `true` while the transport still holds output it accepted from the buffer,
    /// such as sealed TLS records or QUIC data in flight.
    pub(crate) fn has_pending_output(&self) -> bool {
        match self {
            Self::Stream(s) => s.has_pending_output(),
            Self::Listener(_) | Self::Linked | Self::Closed => false,
        }
    }

    /// Registers, reregisters or deregisters the handle so that the loop watches for
    /// `interest` (nothing when `None`).
    pub(crate) fn update_registration(
        &mut self,
        registry: &Registry,
        token: Token,
        current: Option<Interest>,
        interest: Option<Interest>,
    ) -> std::io::Result<()> {
        let Self::Stream(stream) = self else { return Ok(()) };
        match (current, interest) {
            (None, Some(interest)) => stream.register(registry, token, interest),
            (Some(_), Some(interest)) => stream.reregister(registry, token, interest),
            (Some(_), None) => stream.deregister(registry),
            (None, None) => Ok(()),
        }
    }
}

/// Lifecycle and scheduling flags.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Flags {
    pub(crate) reading: bool,
    pub(crate) writing: bool,
    pub(crate) read_blocked_on_bw: bool,
    pub(crate) write_blocked_on_bw: bool,
    /// A TLS read needs the socket to be writable first.
    pub(crate) want_write_for_read: bool,
    /// A TLS write needs the socket to be readable first.
    pub(crate) want_read_for_write: bool,
    /// An outbound connect hasn't completed.
    pub(crate) connecting: bool,
    pub(crate) reached_eof: bool,
    /// Keep the connection until its output buffer is flushed, even though it is marked.
    pub(crate) hold_open_until_flushed: bool,
    /// Upgrade to TLS once connected (and through the proxy).
    pub(crate) upgrade_tls: bool,
    pub(crate) outbound: bool,
    /// One half of an in-process pair.
    pub(crate) linked: bool,
    /// Local connections bypass rate limiting.
    pub(crate) local: bool,
}

/// Usage counters and timestamps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Counters {
    pub(crate) created: Instant,
    pub(crate) last_read: Option<Instant>,
    pub(crate) last_written: Option<Instant>,
    pub(crate) last_client_use: Option<Instant>,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl Counters {
    fn new(now: Instant) -> Self {
        Self {
            created: now,
            last_read: None,
            last_written: None,
            last_client_use: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }
}

/// A network endpoint: a transport handle, the buffers in front of it, and the protocol
/// role it plays.
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) role: Role,
    pub(crate) io: Io,
    pub(crate) address: Option<Address>,
    pub(crate) inbuf: Buffer,
    pub(crate) outbuf: Buffer,
    pub(crate) flags: Flags,
    /// Where the connection was marked for close, if it was.
    pub(crate) marked_at: Option<&'static Location<'static>>,
    pub(crate) flush_deadline: Option<Instant>,
    pub(crate) close_reason: Option<CloseReason>,
    /// The other half of an in-process pair. Cleared when either side is freed.
    pub(crate) linked_peer: Option<ConnId>,
    /// Per-connection buckets, once a relay link is open.
    pub(crate) bucket: Option<TokenBucket>,
    pub(crate) proxy: Option<ProxyHandshake>,
    /// Sessions multiplexed over this connection, as reported by the layer above.
    pub(crate) active_sessions: usize,
    /// What the readiness loop currently watches for.
    pub(crate) registered: Option<Interest>,
    pub(crate) counters: Counters,
    pub(crate) span: Span,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("transport", &self.io.kind())
            .field("address", &self.address)
            .field("inbuf", &self.inbuf.len())
            .field("outbuf", &self.outbuf.len())
            .field("marked", &self.marked_at.is_some())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        role: Role,
        io: Io,
        address: Option<Address>,
        chunk_size: usize,
        now: Instant,
    ) -> Self {
        let span = tracing::debug_span!("conn", id = id.0, role = ?role.kind());
        Self {
            id,
            role,
            io,
            address,
            inbuf: Buffer::with_chunk_size(chunk_size),
            outbuf: Buffer::with_chunk_size(chunk_size),
            flags: Flags::default(),
            marked_at: None,
            flush_deadline: None,
            close_reason: None,
            linked_peer: None,
            bucket: None,
            proxy: None,
            active_sessions: 0,
            registered: None,
            counters: Counters::new(now),
            span,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn kind(&self) -> TransportKind {
        self.io.kind()
    }

    /// The peer address, or the bound address for listeners.
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn inbuf(&self) -> &Buffer {
        &self.inbuf
    }

    pub fn inbuf_mut(&mut self) -> &mut Buffer {
        &mut self.inbuf
    }

    pub fn outbuf(&self) -> &Buffer {
        &self.outbuf
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.marked_at.is_some()
    }

    /// Marked for close but still holding a descriptor.
    pub fn is_moribund(&self) -> bool {
        self.is_marked_for_close() && self.io.holds_descriptor()
    }

    pub fn is_linked(&self) -> bool {
        self.flags.linked
    }

    pub fn linked_peer(&self) -> Option<ConnId> {
        self.linked_peer
    }

    pub fn is_reading(&self) -> bool {
        self.flags.reading
    }

    pub fn is_writing(&self) -> bool {
        self.flags.writing
    }

    pub fn is_read_blocked_on_bandwidth(&self) -> bool {
        self.flags.read_blocked_on_bw
    }

    pub fn is_write_blocked_on_bandwidth(&self) -> bool {
        self.flags.write_blocked_on_bw
    }

    pub fn is_connecting(&self) -> bool {
        self.flags.connecting
    }

    pub fn is_outbound(&self) -> bool {
        self.flags.outbound
    }

    pub fn is_local(&self) -> bool {
        self.flags.local
    }

    pub fn reached_eof(&self) -> bool {
        self.flags.reached_eof
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn bucket(&self) -> Option<&TokenBucket> {
        self.bucket.as_ref()
    }

    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.counters.bytes_written
    }

    pub fn created(&self) -> Instant {
        self.counters.created
    }

    pub fn last_read(&self) -> Option<Instant> {
        self.counters.last_read
    }

    pub fn last_written(&self) -> Option<Instant> {
        self.counters.last_written
    }

    pub fn last_client_use(&self) -> Option<Instant> {
        self.counters.last_client_use
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The readiness the loop should watch for, given the current flags.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        if self.marked_at.is_some() && !self.flags.hold_open_until_flushed {
            return None;
        }

        let flags = &self.flags;
        let readable = (flags.reading && !flags.read_blocked_on_bw) || flags.want_read_for_write;
        let writable = (flags.writing && !flags.write_blocked_on_bw) ||
            flags.want_write_for_read ||
            flags.connecting;

        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Shuts down and releases the transport handle. Safe to call more than once.
    pub(crate) fn release_io(&mut self, registry: &Registry) {
        let io = std::mem::replace(&mut self.io, Io::Closed);
        match io {
            Io::Stream(mut stream) => {
                if self.registered.is_some() {
                    if let Err(e) = stream.deregister(registry) {
                        debug!(id = %self.id, ?e, "Deregister failed");
                    }
                }
                stream.shutdown();
            }
            Io::Listener(mut listener) => {
                if let Err(e) = listener.deregister(registry) {
                    debug!(id = %self.id, ?e, "Deregister failed");
                }
            }
            Io::Linked | Io::Closed => {}
        }
        self.registered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked(now: Instant) -> Connection {
        let mut conn =
            Connection::new(ConnId(1), Role::Exit(ExitState::Open), Io::Linked, None, 4096, now);
        conn.flags.linked = true;
        conn
    }

    #[test]
    fn interest_follows_flags() {
        let mut conn = linked(Instant::now());
        assert_eq!(conn.desired_interest(), None);

        conn.flags.reading = true;
        assert_eq!(conn.desired_interest(), Some(Interest::READABLE));

        conn.flags.read_blocked_on_bw = true;
        assert_eq!(conn.desired_interest(), None);

        // A TLS write that wants the socket readable overrides the bandwidth block.
        conn.flags.want_read_for_write = true;
        conn.flags.writing = true;
        assert_eq!(conn.desired_interest(), Some(Interest::READABLE | Interest::WRITABLE));

        conn.marked_at = Some(Location::caller());
        assert_eq!(conn.desired_interest(), None);
        conn.flags.hold_open_until_flushed = true;
        assert!(conn.desired_interest().is_some());
    }

    #[test]
    fn linked_connections_hold_no_descriptor() {
        let mut conn = linked(Instant::now());
        assert_eq!(conn.kind(), TransportKind::Linked);
        assert!(conn.is_linked());
        assert!(!conn.io.holds_descriptor());

        conn.marked_at = Some(Location::caller());
        assert!(conn.is_marked_for_close());
        assert!(!conn.is_moribund());
    }
}
