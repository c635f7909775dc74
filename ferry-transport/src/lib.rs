//! Non-blocking transport backends for ferry.
//!
//! Every backend moves bytes between a [`ferry_wire::Buffer`] and the network without blocking,
//! and reports how an attempt went as an [`IoOutcome`]: bytes transferred, would-block, a need
//! for the other direction's readiness (TLS), or a clean close. Anything else is an [`Error`]
//! and fatal for the stream.
//!
//! - [`tcp`] and [`unix`]: plain sockets on [`mio`], built with [`socket2`] where socket options
//!   matter.
//! - [`tls`]: `rustls` sessions layered on TCP sockets.
//! - [`quic`]: `quinn` streams driven by a background runtime that wakes the readiness loop.

mod error;
pub use error::Error;

pub mod io;
pub use io::IoOutcome;

pub mod listener;
pub use listener::{ListenAddress, Listener};

pub mod quic;
pub mod tcp;
pub mod tls;
pub mod unix;

mod stream;
pub use stream::{Address, Stream, StreamKind};
