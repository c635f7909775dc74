//! The connection core of a ferry relay.
//!
//! A [`Core`] owns every connection and listener along with the rate-limiting buckets, and
//! drives them from a single-threaded [`mio`] readiness loop. Protocol logic plugs in per
//! connection role through the [`Processor`] trait; a [`Runtime`] bundles a core with its
//! processors.
//!
//! Connections are never freed where they are closed. [`Core::mark_for_close`] schedules
//! teardown for the end of the loop turn, so ids handed out to other parts of the program
//! stay valid until the sweep, and processors get a last look through
//! [`Processor::about_to_close`].

pub mod bandwidth;
pub mod connection;
pub use connection::{
    ConnId, Connection, ControlState, DirState, EntryState, ExitState, RelayState, Role,
    RoleKind, TransportKind,
};

mod reactor;
pub use crate::reactor::Core;

mod engine;

mod error;
pub use error::{CloseReason, Error};

mod handshake;
pub use handshake::{ConnectOptions, ProxyConfig};

mod listener;
pub use listener::{ListenerConfig, ListenerDiff, ListenerRole};

pub mod oos;

mod options;
pub use options::{BandwidthOptions, CoreOptions, OosOptions};

pub mod policy;

mod runtime;
pub use runtime::{Processor, Runtime};

mod stats;
pub use stats::{CoreStats, TrafficSink};

pub use ferry_transport::{Address, ListenAddress};
