use std::{net::SocketAddr, path::PathBuf, time::Instant};

use mio::Interest;
use tracing::{debug, info, warn};

use ferry_transport::{Address, ListenAddress, Listener};

use crate::{
    connection::{Connection, Io, RelayState, Role},
    runtime::Processors,
    ConnId, Core, Error,
};

/// What connections accepted on a listener are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerRole {
    /// Links from other relays. May speak TLS.
    Relay,
    /// Client application streams entering the overlay.
    Entry,
    /// Directory requests.
    Dir,
    /// The local control channel.
    Control,
}

/// One listener in the desired set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerConfig {
    /// Where to listen, and over which transport.
    pub addr: ListenAddress,
    /// The role every accepted connection gets.
    pub role: ListenerRole,
    /// Accepted connections start with the server side of a TLS handshake. Only relay
    /// listeners on TCP use this.
    pub tls: bool,
}

impl ListenerConfig {
    /// A plain TCP listener on `addr`.
    pub fn tcp(addr: SocketAddr, role: ListenerRole) -> Self {
        Self { addr: ListenAddress::Tcp(addr), role, tls: false }
    }

    /// A Unix-domain listener bound at `path`. A stale socket file there is replaced.
    pub fn unix(path: impl Into<PathBuf>, role: ListenerRole) -> Self {
        Self { addr: ListenAddress::Unix(path.into()), role, tls: false }
    }

    /// A QUIC endpoint on `addr`. Needs the QUIC backend configured on the core.
    pub fn quic(addr: SocketAddr, role: ListenerRole) -> Self {
        Self { addr: ListenAddress::Quic(addr), role, tls: false }
    }

    /// Runs the server side of a TLS handshake on every accepted connection.
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }
}

/// The outcome of [`Core::reconcile_listeners`].
#[derive(Debug, Default)]
pub struct ListenerDiff {
    /// Listeners opened by this call.
    pub opened: Vec<ConnId>,
    /// Listeners closed because they are no longer wanted.
    pub closed: Vec<ConnId>,
    /// Listeners that couldn't be opened, and why.
    pub failed: Vec<(ListenerConfig, Error)>,
}

impl Core {
    /// Brings the open listeners in line with `desired`. Listeners already open with the same
    /// configuration are left alone; the others are closed, and missing ones are opened.
    pub fn reconcile_listeners(&mut self, desired: &[ListenerConfig]) -> ListenerDiff {
        let mut diff = ListenerDiff::default();

        let mut open: Vec<(ConnId, ListenerConfig)> = self
            .conns
            .values()
            .filter(|c| !c.is_marked_for_close())
            .filter_map(|c| match &c.role {
                Role::Listener(config) => Some((c.id, config.clone())),
                _ => None,
            })
            .collect();
        open.sort_by_key(|(id, _)| *id);

        let mut kept = Vec::new();
        for (id, config) in open {
            if desired.contains(&config) && !kept.contains(&config) {
                kept.push(config);
                continue;
            }

            info!(%id, addr = ?config.addr, role = ?config.role, "Closing listener");
            self.close_immediately(id);
            if let Err(e) = self.mark_for_close(id) {
                debug!(%id, ?e, "Listener was already marked for close");
            }
            diff.closed.push(id);
        }

        for config in desired {
            if kept.contains(config) {
                continue;
            }
            kept.push(config.clone());

            match self.open_listener(config.clone()) {
                Ok(id) => diff.opened.push(id),
                Err(e) => {
                    warn!(addr = ?config.addr, role = ?config.role, ?e, "Failed to open listener");
                    diff.failed.push((config.clone(), e));
                }
            }
        }

        diff
    }

    /// Binds a listener and starts accepting on it.
    pub fn open_listener(&mut self, config: ListenerConfig) -> Result<ConnId, Error> {
        if config.tls && self.options.tls.as_ref().and_then(|t| t.server.as_ref()).is_none() {
            return Err(Error::TlsNotConfigured);
        }

        let id = self.next_id();
        let mut listener = match Listener::bind(&config.addr, self.quic.as_mut(), id.token()) {
            Ok(listener) => listener,
            Err(e) => {
                let e = Error::from(e);
                if e.is_resource_exhaustion() {
                    let open = self.descriptor_count();
                    self.check_oos(open, true);
                }
                return Err(e);
            }
        };
        listener.register(self.poll.registry(), id.token())?;

        let address = listener.local_addr();
        info!(%id, ?address, role = ?config.role, tls = config.tls, "Listening");

        let mut conn = Connection::new(
            id,
            Role::Listener(config),
            Io::Listener(listener),
            address,
            self.options.chunk_size,
            Instant::now(),
        );
        conn.flags.reading = true;
        conn.flags.local = true;
        conn.registered = Some(Interest::READABLE);
        self.conns.insert(id, conn);

        // Anything queued before registration won't raise an edge.
        self.ready_again.insert(id);
        Ok(id)
    }

    /// Accepts everything pending on a listener.
    pub(crate) fn accept_ready(&mut self, procs: &mut Processors, id: ConnId) {
        loop {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            let Role::Listener(config) = &conn.role else { return };
            let config = config.clone();
            let Io::Listener(listener) = &mut conn.io else { return };

            let (stream, peer) = match listener.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) => {
                    let e = Error::from(e);
                    warn!(parent: &conn.span, ?e, "Accept failed");
                    if e.is_resource_exhaustion() {
                        let open = self.descriptor_count();
                        self.check_oos(open, true);
                    }
                    return;
                }
            };

            if !self.admits(&config, &peer) {
                debug!(listener = %id, %peer, "Rejected connection");
                self.stats.increment_rejected();
                drop(stream);
                continue;
            }

            self.accept_one(procs, &config, stream, peer);

            let open = self.descriptor_count();
            self.check_oos(open, false);
        }
    }

    /// Plausible peer address and admission policy for the listener's role. Unix-domain
    /// peers are always admitted.
    fn admits(&self, config: &ListenerConfig, peer: &Address) -> bool {
        let Address::Inet(addr) = peer else { return true };
        if addr.ip().is_unspecified() || addr.port() == 0 {
            warn!(%peer, "Accepted connection has an implausible peer address");
            return false;
        }

        self.options.policies.get(&config.role).map_or(true, |policy| policy.allows(addr.ip()))
    }

    fn accept_one(
        &mut self,
        procs: &mut Processors,
        config: &ListenerConfig,
        stream: ferry_transport::Stream,
        peer: Address,
    ) {
        let tls = config.tls && config.role == ListenerRole::Relay;
        let stream = if tls {
            let Some(server) = self.options.tls.as_ref().and_then(|t| t.server.clone()) else {
                return;
            };
            match stream.into_tls_server(server) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, ?e, "Failed to start TLS on accepted connection");
                    return;
                }
            }
        } else {
            stream
        };

        let now = Instant::now();
        let id = self.next_id();
        let role = Role::accepted(config.role, tls);
        let local = self.is_local_address(Some(&peer));
        let mut conn =
            Connection::new(id, role, Io::Stream(stream), Some(peer), self.options.chunk_size, now);
        conn.flags.local = local;
        conn.flags.reading = true;
        conn.flags.writing = tls;
        if conn.role == Role::Relay(RelayState::Open) && !local {
            conn.bucket = self.limiter.connection_bucket(now);
        }

        debug!(%id, peer = ?conn.address, role = ?conn.role, "Accepted connection");
        self.stats.increment_accepted();
        self.insert(conn);

        if !tls {
            self.call(procs, id, |p, core| p.accepted(core, id));
        }
    }
}
