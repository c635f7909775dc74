#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use ferry_net::*;

pub use ferry_common::constants;
pub use ferry_transport::{quic::QuicConfig, tls::TlsOptions, IoOutcome, StreamKind};
pub use ferry_wire::{compression, proxy, Buffer};

/// The transport backends underneath the core.
pub mod transport {
    pub use ferry_transport::*;
}
