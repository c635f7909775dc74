//! Outbound connects and the handshakes a relay link goes through before it opens: the
//! proxy tunnel, then TLS.

use std::{mem, net::SocketAddr, time::Instant};

use tracing::{debug, info};

use ferry_transport::{tcp, unix, Address, Stream};
use ferry_wire::proxy::{
    ProxyCredentials, ProxyError, ProxyHandshake, ProxyProtocol, ProxyRequest, ProxyStatus,
};

use crate::{
    connection::{Connection, Io, RelayState, Role, RoleKind},
    runtime::Processors,
    CloseReason, ConnId, Core, Error,
};

/// The proxy a relay link tunnels through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// The dialect the proxy speaks.
    pub protocol: ProxyProtocol,
    /// Where the proxy listens. The socket connects here; the proxy connects on to the target.
    pub addr: SocketAddr,
    /// Authentication for the proxy, if it needs any.
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyConfig {
    /// An unauthenticated proxy at `addr`.
    pub fn new(protocol: ProxyProtocol, addr: SocketAddr) -> Self {
        Self { protocol, addr, credentials: None }
    }

    /// Authenticates with `credentials`. SOCKS4 sends the username as its user id.
    pub fn with_credentials(mut self, credentials: ProxyCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// A SOCKS5 proxy run by a pluggable transport, with its per-destination argument string
    /// packed into the authentication fields.
    pub fn pluggable_transport(addr: SocketAddr, args: &[u8]) -> Result<Self, ProxyError> {
        let credentials = ProxyCredentials::from_transport_args(args)?;
        Ok(Self::new(ProxyProtocol::Socks5, addr).with_credentials(credentials))
    }

    fn request(&self, target: SocketAddr) -> ProxyRequest {
        let request = ProxyRequest::new(self.protocol, target);
        match &self.credentials {
            Some(credentials) => request.with_credentials(credentials.clone()),
            None => request,
        }
    }
}

/// How to reach the target of an outbound connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Upgrade the link to TLS once it is connected (relay links only).
    pub tls: bool,
    /// Use the QUIC backend instead of a stream socket.
    pub quic: bool,
    /// Tunnel through a proxy (relay links only).
    pub proxy: Option<ProxyConfig>,
    /// Local address to bind before connecting.
    pub bind: Option<SocketAddr>,
}

impl ConnectOptions {
    /// See [`ConnectOptions::tls`].
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// See [`ConnectOptions::quic`].
    pub fn over_quic(mut self) -> Self {
        self.quic = true;
        self
    }

    /// See [`ConnectOptions::proxy`].
    pub fn through_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// See [`ConnectOptions::bind`].
    pub fn bind_to(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }
}

impl Core {
    /// Starts connecting to `target` for a connection of role `kind`. The connect finishes
    /// in the loop; the role's processor hears about it through
    /// [`finished_connecting`](crate::Processor::finished_connecting).
    ///
    /// A connect that fails for lack of descriptors runs the out-of-sockets defense before
    /// the error is returned.
    pub fn connect(
        &mut self,
        kind: RoleKind,
        target: Address,
        opts: ConnectOptions,
    ) -> Result<ConnId, Error> {
        let role = Role::connecting(kind).ok_or(Error::NotConnectable(kind))?;
        self.validate_connect(kind, &target, &opts)?;

        let id = self.next_id();
        let stream = match self.open_stream(id, &target, &opts) {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.increment_connects_failed();
                debug!(%target, ?e, "Connect failed");
                if e.is_resource_exhaustion() {
                    let open = self.descriptor_count();
                    self.check_oos(open, true);
                }
                return Err(e);
            }
        };

        let dialed = match &opts.proxy {
            Some(proxy) => Address::Inet(proxy.addr),
            None => target.clone(),
        };
        let now = Instant::now();
        let mut conn = Connection::new(
            id,
            role,
            Io::Stream(stream),
            Some(target.clone()),
            self.options.chunk_size,
            now,
        );
        conn.flags.connecting = true;
        conn.flags.reading = true;
        conn.flags.outbound = true;
        conn.flags.upgrade_tls = opts.tls;
        conn.flags.local = self.is_local_address(Some(&dialed));
        conn.proxy = match (&opts.proxy, target.as_inet()) {
            (Some(proxy), Some(addr)) => Some(ProxyHandshake::new(proxy.request(addr))),
            _ => None,
        };

        debug!(%id, %target, %dialed, ?kind, tls = opts.tls, quic = opts.quic, "Connecting");
        self.stats.increment_connects_started();
        self.insert(conn);

        let open = self.descriptor_count();
        self.check_oos(open, false);
        Ok(id)
    }

    fn validate_connect(
        &self,
        kind: RoleKind,
        target: &Address,
        opts: &ConnectOptions,
    ) -> Result<(), Error> {
        if kind != RoleKind::Relay && (opts.tls || opts.proxy.is_some()) {
            return Err(Error::Unsupported("TLS and proxies are only used for relay links"));
        }
        if opts.quic && (opts.tls || opts.proxy.is_some()) {
            return Err(Error::Unsupported("QUIC links can't be wrapped in TLS or proxied"));
        }
        if matches!(target, Address::Unix(_)) && (opts.tls || opts.proxy.is_some() || opts.quic) {
            return Err(Error::Unsupported("Unix-domain targets are dialed directly"));
        }
        if opts.tls && self.options.tls.is_none() {
            return Err(Error::TlsNotConfigured);
        }
        Ok(())
    }

    fn open_stream(
        &mut self,
        id: ConnId,
        target: &Address,
        opts: &ConnectOptions,
    ) -> Result<Stream, Error> {
        if opts.quic {
            let Some(addr) = target.as_inet() else {
                return Err(Error::Unsupported("QUIC needs an IP target"));
            };
            let quic = self.quic.as_mut().ok_or(ferry_transport::Error::QuicDisabled)?;
            return Ok(Stream::Quic(Box::new(quic.connect(addr, id.token())?)));
        }

        if let Some(proxy) = &opts.proxy {
            return Ok(Stream::Tcp(tcp::connect(proxy.addr, opts.bind)?));
        }

        match target {
            Address::Inet(addr) => Ok(Stream::Tcp(tcp::connect(*addr, opts.bind)?)),
            Address::Unix(path) => Ok(Stream::Unix(unix::connect(path)?)),
        }
    }

    /// Checks whether a pending connect completed.
    pub(crate) fn finish_connecting(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let Io::Stream(stream) = &mut conn.io else { return };

        match stream.poll_connected() {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                debug!(parent: &conn.span, ?e, "Connect failed");
                self.stats.increment_connects_failed();
                self.close_for_error(id, CloseReason::ConnectFailed(e.to_string()));
                return;
            }
        }

        debug!(parent: &conn.span, address = ?conn.address, "Connected");
        conn.flags.connecting = false;
        self.refresh_interest(id);
        // The socket stays writable, so no new edge will announce it.
        self.ready_again.insert(id);
        self.on_connected(procs, id);
    }

    fn on_connected(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if !conn.role.is_relay() {
            if let Some(next) = conn.role.connected() {
                self.transition(id, next);
            }
            self.call(procs, id, |p, core| p.finished_connecting(core, id));
            return;
        }

        let Some(proxy) = conn.proxy.as_mut() else {
            self.proxy_done(procs, id);
            return;
        };

        let span = conn.span.clone();
        if let Err(e) = proxy.start(&mut conn.outbuf) {
            debug!(parent: &span, ?e, "Can't start proxy handshake");
            self.close_for_error(id, e.into());
            return;
        }
        self.transition(id, Role::Relay(RelayState::ProxyHandshaking));
        self.resume_handshake_io(id);
    }

    /// Turns on both directions for a handshake step. A connection that can't be driven any
    /// further is closed.
    fn resume_handshake_io(&mut self, id: ConnId) -> bool {
        let result = self.set_reading(id, true).and_then(|()| self.set_writing(id, true));
        if let Err(e) = result {
            debug!(%id, ?e, "Can't resume handshake I/O");
            self.close_for_error(id, CloseReason::Transport(e.to_string()));
            return false;
        }
        true
    }

    /// Feeds the proxy's reply to the handshake.
    pub(crate) fn advance_proxy(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let Some(proxy) = conn.proxy.as_mut() else { return };

        let queued = conn.outbuf.len();
        match proxy.advance(&mut conn.inbuf, &mut conn.outbuf) {
            Ok(ProxyStatus::Pending) => {
                if conn.outbuf.len() > queued {
                    if let Err(e) = self.set_writing(id, true) {
                        debug!(%id, ?e, "Can't send proxy request");
                        self.close_for_error(id, CloseReason::Transport(e.to_string()));
                    }
                }
            }
            Ok(ProxyStatus::Connected) => {
                info!(parent: &conn.span, "Proxy tunnel established");
                conn.proxy = None;
                self.proxy_done(procs, id);
            }
            Err(e) => {
                debug!(parent: &conn.span, ?e, "Proxy handshake failed");
                self.close_for_error(id, e.into());
            }
        }
    }

    /// The link reached its target: start TLS if asked to, or open.
    fn proxy_done(&mut self, procs: &mut Processors, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if !conn.flags.upgrade_tls {
            self.relay_open(procs, id);
            return;
        }

        let Some(tls) = self.options.tls.as_ref() else {
            self.close_for_error(id, CloseReason::Transport("TLS is not configured".into()));
            return;
        };

        let plain = mem::replace(&mut conn.io, Io::Closed);
        let Io::Stream(stream) = plain else {
            conn.io = plain;
            return;
        };
        // Same descriptor under a new owner, so the registration carries over.
        match stream.into_tls_client(tls) {
            Ok(stream) => conn.io = Io::Stream(stream),
            Err(e) => {
                debug!(parent: &conn.span, ?e, "TLS upgrade failed");
                conn.registered = None;
                self.close_for_error(id, CloseReason::Transport(e.to_string()));
                return;
            }
        }

        conn.flags.upgrade_tls = false;
        self.transition(id, Role::Relay(RelayState::TlsHandshaking));
        // Writing sends the ClientHello.
        if self.resume_handshake_io(id) {
            self.ready_again.insert(id);
        }
    }

    /// A relay link finished its handshakes.
    pub(crate) fn relay_open(&mut self, procs: &mut Processors, id: ConnId) {
        if !self.transition(id, Role::Relay(RelayState::Open)) {
            return;
        }
        let Some(conn) = self.conns.get(&id) else { return };
        info!(parent: &conn.span, address = ?conn.address, outbound = conn.flags.outbound, "Relay link open");

        if !conn.inbuf.is_empty() {
            self.ready_again.insert(id);
        }
        if conn.flags.outbound {
            self.call(procs, id, |p, core| p.finished_connecting(core, id));
        } else {
            self.call(procs, id, |p, core| p.accepted(core, id));
        }
    }
}
