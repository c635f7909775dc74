use std::{io, net::SocketAddr, path::PathBuf};

use mio::{net::TcpListener, Interest, Registry, Token};
use tracing::{debug, trace};

use ferry_common::errno;

use crate::{
    quic::{QuicContext, QuicListener},
    tcp,
    unix::UnixListenerHandle,
    Address, Error, Stream,
};

/// What a listener binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddress {
    /// A stream socket on an IP address.
    Tcp(SocketAddr),
    /// A Unix-domain stream socket.
    Unix(PathBuf),
    /// A datagram endpoint for the QUIC backend.
    Quic(SocketAddr),
}

/// A bound, non-blocking listener.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListenerHandle),
    Quic(QuicListener),
}

impl Listener {
    /// Binds a listener. QUIC listeners need the runtime's [`QuicContext`] and announce
    /// accepted streams by waking `token`.
    pub fn bind(
        addr: &ListenAddress,
        quic: Option<&mut QuicContext>,
        token: Token,
    ) -> Result<Self, Error> {
        let listener = match addr {
            ListenAddress::Tcp(addr) => Self::Tcp(tcp::bind_listener(*addr)?),
            ListenAddress::Unix(path) => Self::Unix(UnixListenerHandle::bind(path.clone())?),
            ListenAddress::Quic(addr) => {
                let Some(quic) = quic else {
                    return Err(Error::QuicDisabled);
                };
                Self::Quic(quic.listen(*addr, token)?)
            }
        };

        debug!(addr = ?listener.local_addr(), "Listener bound");
        Ok(listener)
    }

    /// The bound address. For port-zero binds this has the port the OS picked.
    pub fn local_addr(&self) -> Option<Address> {
        match self {
            Self::Tcp(l) => l.local_addr().ok().map(Address::Inet),
            Self::Unix(l) => Some(Address::Unix(l.path().to_path_buf())),
            Self::Quic(l) => Some(Address::Inet(l.local_addr())),
        }
    }

    /// Accepts one pending connection. Returns `Ok(None)` once nothing is pending.
    ///
    /// Connections that vanish between the readiness event and `accept(2)` are skipped.
    pub fn accept(&mut self) -> Result<Option<(Stream, Address)>, Error> {
        loop {
            let result = match self {
                Self::Tcp(l) => l.accept().and_then(|(stream, addr)| {
                    stream.set_nodelay(true)?;
                    Ok((Stream::Tcp(stream), Address::Inet(addr)))
                }),
                Self::Unix(l) => {
                    // Unix peers are almost always unnamed; report the listener's path.
                    let path = l.path().to_path_buf();
                    l.accept().map(|stream| (Stream::Unix(stream), Address::Unix(path)))
                }
                Self::Quic(l) => {
                    return Ok(l.accept()?.map(|stream| {
                        let peer = stream.peer_addr();
                        (Stream::Quic(Box::new(stream)), Address::Inet(peer))
                    }))
                }
            };

            match result {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if errno::is_accept_retryable(&e) => {
                    trace!(?e, "Retrying accept");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            Self::Tcp(l) => registry.register(l, token, Interest::READABLE),
            Self::Unix(l) => registry.register(l.source(), token, Interest::READABLE),
            // Woken through the QUIC notifier with the token given at bind time.
            Self::Quic(_) => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(l) => registry.deregister(l),
            Self::Unix(l) => registry.deregister(l.source()),
            Self::Quic(_) => Ok(()),
        }
    }
}
