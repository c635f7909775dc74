use std::time::Instant;

use crate::{ConnId, RoleKind};

/// Receives byte counts after every read and write, for traffic classification and
/// accounting done outside the core.
pub trait TrafficSink {
    fn record(&mut self, id: ConnId, role: RoleKind, read: usize, written: usize, now: Instant);
}

/// Counters for the whole core.
#[derive(Debug, Default, Clone)]
pub struct CoreStats {
    /// Total bytes read from transports and linked peers
    bytes_rx: u64,
    /// Total bytes written to transports
    bytes_tx: u64,
    accepted: u64,
    rejected: u64,
    connects_started: u64,
    connects_failed: u64,
    closed: u64,
    read_blocked: u64,
    write_blocked: u64,
    oos_victims: u64,
}

impl CoreStats {
    #[inline]
    pub(crate) fn increment_rx(&mut self, bytes: usize) {
        self.bytes_rx += bytes as u64;
    }

    #[inline]
    pub(crate) fn increment_tx(&mut self, bytes: usize) {
        self.bytes_tx += bytes as u64;
    }

    #[inline]
    pub(crate) fn increment_accepted(&mut self) {
        self.accepted += 1;
    }

    #[inline]
    pub(crate) fn increment_rejected(&mut self) {
        self.rejected += 1;
    }

    #[inline]
    pub(crate) fn increment_connects_started(&mut self) {
        self.connects_started += 1;
    }

    #[inline]
    pub(crate) fn increment_connects_failed(&mut self) {
        self.connects_failed += 1;
    }

    #[inline]
    pub(crate) fn increment_closed(&mut self) {
        self.closed += 1;
    }

    #[inline]
    pub(crate) fn increment_read_blocked(&mut self) {
        self.read_blocked += 1;
    }

    #[inline]
    pub(crate) fn increment_write_blocked(&mut self) {
        self.write_blocked += 1;
    }

    #[inline]
    pub(crate) fn increment_oos_victims(&mut self, n: usize) {
        self.oos_victims += n as u64;
    }

    #[inline]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx
    }

    #[inline]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx
    }

    #[inline]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Connections refused by an admission policy or an implausible peer address.
    #[inline]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    #[inline]
    pub fn connects_started(&self) -> u64 {
        self.connects_started
    }

    #[inline]
    pub fn connects_failed(&self) -> u64 {
        self.connects_failed
    }

    /// Connections freed by the teardown sweep.
    #[inline]
    pub fn closed(&self) -> u64 {
        self.closed
    }

    #[inline]
    pub fn read_blocked(&self) -> u64 {
        self.read_blocked
    }

    #[inline]
    pub fn write_blocked(&self) -> u64 {
        self.write_blocked
    }

    #[inline]
    pub fn oos_victims(&self) -> u64 {
        self.oos_victims
    }
}
