use std::time::Duration;

use rustc_hash::FxHashMap;

use ferry_common::constants::GiB;
use ferry_transport::{quic::QuicConfig, tls::TlsOptions};
use ferry_wire::buf::DEFAULT_CHUNK_SIZE;

use crate::{bandwidth::RefillConfig, listener::ListenerRole, policy::AddressPolicy};

/// Options for the connection core.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// How often buckets are refilled and timers are checked.
    pub tick_interval: Duration,
    /// How long a connection marked with [`Core::mark_and_flush`](crate::Core::mark_and_flush)
    /// may keep flushing before it is closed anyway.
    pub flush_timeout: Duration,
    /// Capacity of the readiness event list.
    pub event_capacity: usize,
    /// Preferred chunk size for connection buffers.
    pub chunk_size: usize,
    pub bandwidth: BandwidthOptions,
    pub oos: OosOptions,
    /// TLS settings for relay links. Required for TLS connects and TLS listeners.
    pub tls: Option<TlsOptions>,
    /// Enables the QUIC backend.
    pub quic: Option<QuicConfig>,
    /// Admission policies for accepted connections, per listener role.
    pub policies: FxHashMap<ListenerRole, AddressPolicy>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            flush_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            bandwidth: BandwidthOptions::default(),
            oos: OosOptions::default(),
            tls: None,
            quic: None,
            policies: FxHashMap::default(),
        }
    }
}

impl CoreOptions {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: BandwidthOptions) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_oos(mut self, oos: OosOptions) -> Self {
        self.oos = oos;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_quic(mut self, quic: QuicConfig) -> Self {
        self.quic = Some(quic);
        self
    }

    /// Sets the admission policy for connections accepted on listeners of `role`.
    pub fn with_policy(mut self, role: ListenerRole, policy: AddressPolicy) -> Self {
        self.policies.insert(role, policy);
        self
    }
}

/// Bandwidth limits, in bytes per second and bytes of burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthOptions {
    pub rate: u32,
    pub burst: u32,
    /// Limits for relayed traffic. Defaults to the global limits.
    pub relayed_rate: Option<u32>,
    pub relayed_burst: Option<u32>,
    /// Limits for each open relay link. No per-link buckets when unset.
    pub per_connection_rate: Option<u32>,
    pub per_connection_burst: Option<u32>,
    /// Rate limit connections to and from private addresses too.
    pub count_private_bandwidth: bool,
    /// A relay link stops counting as client traffic this long after a client last used it.
    pub client_idle_threshold: Duration,
}

impl Default for BandwidthOptions {
    fn default() -> Self {
        Self {
            rate: GiB,
            burst: GiB,
            relayed_rate: None,
            relayed_burst: None,
            per_connection_rate: None,
            per_connection_burst: None,
            count_private_bandwidth: false,
            client_idle_threshold: Duration::from_secs(30),
        }
    }
}

impl BandwidthOptions {
    pub fn with_rate(mut self, rate: u32, burst: u32) -> Self {
        self.rate = rate;
        self.burst = burst;
        self
    }

    pub fn with_relayed_rate(mut self, rate: u32, burst: u32) -> Self {
        self.relayed_rate = Some(rate);
        self.relayed_burst = Some(burst);
        self
    }

    pub fn with_per_connection_rate(mut self, rate: u32, burst: u32) -> Self {
        self.per_connection_rate = Some(rate);
        self.per_connection_burst = Some(burst);
        self
    }

    pub fn with_private_bandwidth_counted(mut self, count: bool) -> Self {
        self.count_private_bandwidth = count;
        self
    }

    pub fn with_client_idle_threshold(mut self, threshold: Duration) -> Self {
        self.client_idle_threshold = threshold;
        self
    }

    pub fn global(&self) -> RefillConfig {
        RefillConfig::new(self.rate, self.burst)
    }

    pub fn relayed(&self) -> RefillConfig {
        RefillConfig::new(
            self.relayed_rate.unwrap_or(self.rate),
            self.relayed_burst.unwrap_or(self.burst),
        )
    }

    pub fn per_connection(&self) -> Option<RefillConfig> {
        let rate = self.per_connection_rate?;
        Some(RefillConfig::new(rate, self.per_connection_burst.unwrap_or(rate)))
    }
}

/// Thresholds for the out-of-sockets defense, in open descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OosOptions {
    pub enabled: bool,
    /// Above this many open descriptors, connections are closed down to `low_threshold`.
    pub high_threshold: usize,
    pub low_threshold: usize,
}

impl Default for OosOptions {
    fn default() -> Self {
        Self::from_descriptor_limit(4096)
    }
}

impl OosOptions {
    pub fn new(high_threshold: usize, low_threshold: usize) -> Self {
        Self { enabled: true, high_threshold, low_threshold }
    }

    /// Thresholds derived from a descriptor limit: a small reserve below the limit, and
    /// three quarters of it as the target.
    pub fn from_descriptor_limit(limit: usize) -> Self {
        let reserve = (limit / 16).clamp(1, 32);
        Self::new(limit.saturating_sub(reserve), limit * 3 / 4)
    }

    /// Thresholds derived from this process' descriptor limit.
    pub fn from_process_limit() -> std::io::Result<Self> {
        let limit = ferry_common::descriptor_limit()?;
        Ok(Self::from_descriptor_limit(usize::try_from(limit).unwrap_or(usize::MAX)))
    }

    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }
}
