use std::{io, panic::Location};

use thiserror::Error;

use ferry_common::errno;
use ferry_wire::proxy::ProxyError;

use crate::{connection::ConnId, RoleKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] ferry_transport::Error),
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnId),
    #[error("Connection {id} was already marked for close at {first}")]
    AlreadyMarked { id: ConnId, first: &'static Location<'static> },
    #[error("{0:?} connections are never dialed")]
    NotConnectable(RoleKind),
    #[error("Unsupported connect: {0}")]
    Unsupported(&'static str),
    #[error("TLS is not configured")]
    TlsNotConfigured,
}

impl Error {
    /// Returns `true` if the error means we are out of descriptors or kernel memory.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::Io(e) => errno::is_resource_exhaustion(e),
            Self::Transport(e) => e.is_resource_exhaustion(),
            _ => false,
        }
    }
}

/// Why a connection was closed on an error path. Handed to the protocol processor right
/// before the connection is freed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseReason {
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("proxy handshake failed: {0}")]
    Proxy(String),
    #[error("closed to free descriptors")]
    OutOfSockets,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("gave up flushing")]
    FlushTimeout,
    #[error("shutting down")]
    Shutdown,
}

impl From<ProxyError> for CloseReason {
    fn from(err: ProxyError) -> Self {
        Self::Proxy(err.to_string())
    }
}
