use std::io;

use thiserror::Error;

use ferry_common::errno;

/// A fatal transport error. Transient conditions (would-block, want-read, want-write) are
/// reported through [`IoOutcome`](crate::IoOutcome) instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),
    #[error(transparent)]
    QuicConnect(#[from] quinn::ConnectError),
    #[error(transparent)]
    QuicConnection(#[from] quinn::ConnectionError),
    #[error("QUIC stream failed: {0}")]
    QuicStream(String),
    #[error("Endpoint closed")]
    ClosedEndpoint,
    #[error("QUIC backend not enabled")]
    QuicDisabled,
    #[error("Cannot upgrade a {0:?} stream to TLS")]
    NotUpgradable(crate::StreamKind),
}

impl Error {
    /// Returns `true` if the error means we are out of descriptors or kernel memory.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::Io(e) => errno::is_resource_exhaustion(e),
            _ => false,
        }
    }
}
