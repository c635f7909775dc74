use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use mio::{
    net::{TcpStream, UnixStream},
    Interest, Registry, Token,
};

use ferry_wire::Buffer;

use crate::{
    io::{flush_from_buffer, read_to_buffer},
    quic::QuicStream,
    tcp,
    tls::{TlsOptions, TlsStream},
    unix, Error, IoOutcome,
};

/// The backend a [`Stream`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Tcp,
    Unix,
    Tls,
    Quic,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::Tls => "tls",
            Self::Quic => "quic",
        })
    }
}

/// The address of a stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl Address {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet(addr) => Some(*addr),
            Self::Unix(_) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

impl From<PathBuf> for Address {
    fn from(path: PathBuf) -> Self {
        Self::Unix(path)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A non-blocking byte stream over any of the supported backends.
///
/// All backends share the same surface: reads append to a [`Buffer`], writes drain one, and
/// both report transient conditions through [`IoOutcome`].
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<TlsStream>),
    Quic(Box<QuicStream>),
}

impl Stream {
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Tcp(_) => StreamKind::Tcp,
            Self::Unix(_) => StreamKind::Unix,
            Self::Tls(_) => StreamKind::Tls,
            Self::Quic(_) => StreamKind::Quic,
        }
    }

    pub fn read_into(&mut self, buf: &mut Buffer, at_most: usize) -> Result<IoOutcome, Error> {
        match self {
            Self::Tcp(s) => Ok(read_to_buffer(s, buf, at_most)?),
            Self::Unix(s) => Ok(read_to_buffer(s, buf, at_most)?),
            Self::Tls(s) => s.read_into(buf, at_most),
            Self::Quic(s) => s.read_into(buf, at_most),
        }
    }

    pub fn write_from(&mut self, buf: &mut Buffer, at_most: usize) -> Result<IoOutcome, Error> {
        match self {
            Self::Tcp(s) => Ok(flush_from_buffer(s, buf, at_most)?),
            Self::Unix(s) => Ok(flush_from_buffer(s, buf, at_most)?),
            Self::Tls(s) => s.write_from(buf, at_most),
            Self::Quic(s) => s.write_from(buf, at_most),
        }
    }

    /// Returns `true` if bytes taken from a buffer haven't reached the network yet.
    pub fn has_pending_output(&self) -> bool {
        match self {
            Self::Tcp(_) | Self::Unix(_) => false,
            Self::Tls(s) => s.has_pending_output(),
            Self::Quic(s) => s.has_pending_output(),
        }
    }

    /// Returns `true` while a TLS handshake is still running.
    pub fn is_handshaking(&self) -> bool {
        match self {
            Self::Tls(s) => s.is_handshaking(),
            _ => false,
        }
    }

    /// Checks whether an outbound connect has completed. See [`tcp::finish_connect`].
    pub fn poll_connected(&mut self) -> Result<bool, Error> {
        match self {
            Self::Tcp(s) => Ok(tcp::finish_connect(s)?),
            Self::Unix(s) => Ok(unix::finish_connect(s)?),
            Self::Tls(s) => Ok(tcp::finish_connect(s.get_ref())?),
            Self::Quic(s) => s.poll_connected(),
        }
    }

    pub fn peer_addr(&self) -> Option<Address> {
        match self {
            Self::Tcp(s) => s.peer_addr().ok().map(Address::Inet),
            Self::Unix(s) => {
                s.peer_addr().ok()?.as_pathname().map(|p| Address::Unix(p.to_path_buf()))
            }
            Self::Tls(s) => s.get_ref().peer_addr().ok().map(Address::Inet),
            Self::Quic(s) => Some(Address::Inet(s.peer_addr())),
        }
    }

    /// Registers the stream with the readiness loop. QUIC streams aren't sockets of ours; they
    /// wake the loop through their notifier instead.
    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.register(s, token, interests),
            Self::Unix(s) => registry.register(s, token, interests),
            Self::Tls(s) => registry.register(s.get_mut(), token, interests),
            Self::Quic(s) => {
                s.set_token(token);
                Ok(())
            }
        }
    }

    pub fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.reregister(s, token, interests),
            Self::Unix(s) => registry.reregister(s, token, interests),
            Self::Tls(s) => registry.reregister(s.get_mut(), token, interests),
            Self::Quic(_) => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => registry.deregister(s),
            Self::Unix(s) => registry.deregister(s),
            Self::Tls(s) => registry.deregister(s.get_mut()),
            Self::Quic(_) => Ok(()),
        }
    }

    /// Shuts the stream down. The descriptor itself is released on drop.
    pub fn shutdown(&mut self) {
        match self {
            Self::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Self::Unix(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Self::Tls(s) => s.shutdown(),
            Self::Quic(s) => s.shutdown(),
        }
    }

    /// Wraps a connected TCP stream in the client side of a TLS session.
    pub fn into_tls_client(self, options: &TlsOptions) -> Result<Self, Error> {
        match self {
            Self::Tcp(s) => Ok(Self::Tls(Box::new(TlsStream::client(s, options)?))),
            other => Err(Error::NotUpgradable(other.kind())),
        }
    }

    /// Wraps an accepted TCP stream in the server side of a TLS session.
    pub fn into_tls_server(self, config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        match self {
            Self::Tcp(s) => Ok(Self::Tls(Box::new(TlsStream::server(s, config)?))),
            other => Err(Error::NotUpgradable(other.kind())),
        }
    }
}
