//! Token buckets and the per-attempt budget computation.
//!
//! There are two process-wide bucket pairs: the global one, and one that only applies to
//! relayed traffic. Relay links that reached their open state may carry a third pair of
//! their own. Local connections are never limited.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::options::BandwidthOptions;

/// Record size on relay links. Attempts are rounded to multiples of it.
pub const RELAY_RECORD_SIZE: usize = 514;
/// Payload size of a relayed stream record, the rounding base for everything else.
pub const STREAM_RECORD_SIZE: usize = 498;
/// Budget for one attempt on a connection that isn't rate limited.
pub const UNLIMITED_ATTEMPT: usize = 16 * 1024;

/// Which half of a bucket pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Refill rate and burst size, both in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillConfig {
    /// Bytes added per second.
    pub rate: u32,
    /// The most a bucket can hold.
    pub burst: u32,
}

impl RefillConfig {
    pub const fn new(rate: u32, burst: u32) -> Self {
        Self { rate, burst }
    }
}

/// A read/write pair of token buckets sharing one refill configuration.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    config: RefillConfig,
    read: i64,
    write: i64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket pair.
    pub fn new(config: RefillConfig, now: Instant) -> Self {
        let burst = i64::from(config.burst);
        Self { config, read: burst, write: burst, last_refill: now }
    }

    pub fn config(&self) -> RefillConfig {
        self.config
    }

    pub fn get(&self, dir: Direction) -> i64 {
        match dir {
            Direction::Read => self.read,
            Direction::Write => self.write,
        }
    }

    /// Changes rate and burst, clamping both buckets to the new burst.
    pub fn reconfigure(&mut self, config: RefillConfig) {
        self.config = config;
        let burst = i64::from(config.burst);
        self.read = self.read.min(burst);
        self.write = self.write.min(burst);
    }

    /// Adds `rate × elapsed` to both buckets, capped at the burst size.
    ///
    /// Time that isn't worth a whole byte yet keeps accumulating until it is.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let add = u128::from(self.config.rate) * elapsed.as_nanos() / 1_000_000_000;
        if add == 0 {
            return;
        }

        let burst = i64::from(self.config.burst);
        let add = i64::try_from(add).unwrap_or(i64::MAX);
        self.read = self.read.saturating_add(add).min(burst);
        self.write = self.write.saturating_add(add).min(burst);
        self.last_refill = now;
    }

    /// Takes `n` bytes out of one bucket. The bucket can go negative if the caller spent more
    /// than a budget allowed; refills pay the debt back first.
    pub fn spend(&mut self, dir: Direction, n: usize) {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        match dir {
            Direction::Read => self.read = self.read.saturating_sub(n),
            Direction::Write => self.write = self.write.saturating_sub(n),
        }
    }

    /// Sets a bucket to a fixed value, clamped to the burst size.
    pub fn set(&mut self, dir: Direction, value: i64) {
        let value = value.min(i64::from(self.config.burst));
        match dir {
            Direction::Read => self.read = value,
            Direction::Write => self.write = value,
        }
    }
}

/// How the limiter treats one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateClass {
    /// Subject to the global buckets at all.
    pub limited: bool,
    /// Also subject to the relayed-traffic buckets.
    pub relayed: bool,
    /// Rounding base for budgets.
    pub base: usize,
    /// Prioritized connections get larger shares per attempt.
    pub priority: bool,
}

impl RateClass {
    pub const UNLIMITED: Self =
        Self { limited: false, relayed: false, base: STREAM_RECORD_SIZE, priority: true };
}

/// Computes the budget for one attempt from the relevant bucket levels.
///
/// An eighth of the global bucket, rounded down to a multiple of `base` and clamped between a
/// low and a high multiple of it, then capped by both the global and the connection bucket.
pub fn share(base: usize, priority: bool, global: i64, conn: Option<i64>) -> usize {
    let base = base as i64;
    let high = if priority { 32 } else { 16 } * base;
    let low = if priority { 4 } else { 2 } * base;

    let mut at_most = global / 8;
    at_most -= at_most % base;
    at_most = at_most.clamp(low, high);
    at_most = at_most.min(global);
    if let Some(conn) = conn {
        at_most = at_most.min(conn);
    }

    usize::try_from(at_most).unwrap_or(0)
}

/// The process-wide bucket pairs and the policy for using them.
#[derive(Debug)]
pub struct Limiter {
    options: BandwidthOptions,
    global: TokenBucket,
    relayed: TokenBucket,
}

impl Limiter {
    pub fn new(options: BandwidthOptions, now: Instant) -> Self {
        let global = TokenBucket::new(options.global(), now);
        let relayed = TokenBucket::new(options.relayed(), now);
        Self { options, global, relayed }
    }

    pub fn options(&self) -> &BandwidthOptions {
        &self.options
    }

    pub fn global(&self) -> &TokenBucket {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut TokenBucket {
        &mut self.global
    }

    pub fn relayed(&self) -> &TokenBucket {
        &self.relayed
    }

    pub fn relayed_mut(&mut self) -> &mut TokenBucket {
        &mut self.relayed
    }

    /// Applies new options, keeping current bucket levels where they still fit.
    pub fn reconfigure(&mut self, options: BandwidthOptions) {
        self.global.reconfigure(options.global());
        self.relayed.reconfigure(options.relayed());
        self.options = options;
    }

    /// A fresh bucket pair for an open relay link, if per-connection limits are configured.
    pub fn connection_bucket(&self, now: Instant) -> Option<TokenBucket> {
        self.options.per_connection().map(|config| TokenBucket::new(config, now))
    }

    /// The traffic class counts as relayed unless a client used the link within the idle
    /// threshold.
    pub fn is_relayed(&self, last_client_use: Option<Instant>, now: Instant) -> bool {
        last_client_use
            .map_or(true, |t| now.saturating_duration_since(t) > self.options.client_idle_threshold)
    }

    pub fn client_idle_threshold(&self) -> Duration {
        self.options.client_idle_threshold
    }

    /// Bytes a connection of class `class` may move in one attempt.
    pub fn budget(&self, dir: Direction, class: RateClass, conn: Option<&TokenBucket>) -> usize {
        let conn = conn.map(|b| b.get(dir));
        if !class.limited {
            return conn.map_or(UNLIMITED_ATTEMPT, |c| usize::try_from(c).unwrap_or(0));
        }

        let mut global = self.global.get(dir);
        if class.relayed {
            global = global.min(self.relayed.get(dir));
        }

        share(class.base, class.priority, global, conn)
    }

    /// Charges `n` bytes to every bucket relevant to `class`.
    pub fn spend(
        &mut self,
        dir: Direction,
        class: RateClass,
        conn: Option<&mut TokenBucket>,
        n: usize,
    ) {
        if !class.limited || n == 0 {
            return;
        }

        self.global.spend(dir, n);
        if class.relayed {
            self.relayed.spend(dir, n);
        }
        if let Some(conn) = conn {
            conn.spend(dir, n);
        }
        trace!(?dir, n, global = self.global.get(dir), "Charged buckets");
    }

    /// Returns `true` if any bucket relevant to `class` is empty.
    pub fn is_exhausted(&self, dir: Direction, class: RateClass, conn: Option<&TokenBucket>) -> bool {
        !self.all_positive(dir, class, conn)
    }

    /// Returns `true` if every bucket relevant to `class` has something in it. A connection
    /// blocked on bandwidth may only resume when this holds.
    pub fn may_resume(&self, dir: Direction, class: RateClass, conn: Option<&TokenBucket>) -> bool {
        self.all_positive(dir, class, conn)
    }

    fn all_positive(&self, dir: Direction, class: RateClass, conn: Option<&TokenBucket>) -> bool {
        if conn.is_some_and(|b| b.get(dir) <= 0) {
            return false;
        }
        if !class.limited {
            return true;
        }
        self.global.get(dir) > 0 && (!class.relayed || self.relayed.get(dir) > 0)
    }

    pub fn refill(&mut self, now: Instant) {
        self.global.refill(now);
        self.relayed.refill(now);
    }
}
