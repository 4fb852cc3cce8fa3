//! Cross-shard capacity accounting.
//!
//! A [`FairGroup`] holds the process-wide budget for one rate-limited
//! resource. Shards take capacity with a single atomic fetch-add and then
//! check whether the granted frontier has caught up with their reservation;
//! a timer-driven replenisher advances that frontier at a fixed rate. Three
//! atomic rovers carry all shared state:
//!
//! ```text
//!   0 ──────── head ──────────── tail ──────── ceil ────────►
//!              │◄─── deficit ────►│
//!              │◄───────── headroom ───────────►│
//! ```
//!
//! `tail` moves on every grab, `head` moves on replenishment (never past
//! `ceil`), and `ceil` moves when completed requests release their capacity
//! back. Capacity once grabbed is never returned to the pool directly; it
//! re-enters only as headroom for future replenishment, which keeps issuance
//! globally rate-limited.
//!
//! # Time
//!
//! The group never reads a wall clock. Callers pass `now_us` (microseconds)
//! into every time-dependent operation, which keeps behavior reproducible
//! under simulated time. In production a reactor timer calls
//! [`FairGroup::replenish_capacity`] roughly every 500 microseconds.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::ticket::{wrapping_difference, Ticket};

/// Fixed-point capacity units per unit of normalized cost.
///
/// Chosen so that sub-unit costs survive long accumulation without drift.
pub const FIXED_POINT_FACTOR: f64 = (1u64 << 24) as f64;

/// Length of one rate-resolution tick in microseconds.
///
/// Per-second configuration rates are divided by the implied ticks per
/// second (1000) to obtain per-tick cost.
pub const RATE_RESOLUTION_US: u64 = 1_000;

const TICKS_PER_SECOND: u64 = 1_000_000 / RATE_RESOLUTION_US;

/// Minimum fixed-point units worth applying in one replenishment.
const REPLENISH_THRESHOLD: u64 = 1;

/// Fixed-point scalar capacity derived from a ticket.
pub type Capacity = u64;

/// Configuration for a [`FairGroup`].
#[derive(Debug, Clone)]
pub struct FairGroupConfig {
    /// Maximum simultaneous in-flight operation count.
    pub max_weight: u32,

    /// Maximum simultaneous in-flight byte volume.
    pub max_size: u32,

    /// Operations granted per second.
    pub weight_rate: u64,

    /// Bytes granted per second.
    pub size_rate: u64,

    /// Replenishment speed in full-cost units per tick. The effective rate
    /// is `rate_factor * FIXED_POINT_FACTOR` capacity units per tick.
    pub rate_factor: f64,

    /// Window over which unused capacity may accumulate (microseconds).
    /// Together with the rate this bounds the burst a long-idle group can
    /// issue at once.
    pub rate_limit_duration_us: u64,

    /// Number of shards sharing this group. Divides the per-dispatch
    /// capacity quota of each shard's queue.
    pub shard_count: u32,
}

impl FairGroupConfig {
    /// Creates a configuration from the in-flight maxima and per-second
    /// rates.
    #[must_use]
    pub const fn new(max_weight: u32, max_size: u32, weight_rate: u64, size_rate: u64) -> Self {
        Self {
            max_weight,
            max_size,
            weight_rate,
            size_rate,
            rate_factor: 1.0,
            rate_limit_duration_us: 2_000,
            shard_count: 1,
        }
    }

    /// Sets the replenishment rate factor.
    #[must_use]
    pub const fn with_rate_factor(mut self, factor: f64) -> Self {
        self.rate_factor = factor;
        self
    }

    /// Sets the burst accumulation window.
    #[must_use]
    pub const fn with_rate_limit_duration_us(mut self, duration_us: u64) -> Self {
        self.rate_limit_duration_us = duration_us;
        self
    }

    /// Sets the number of shards sharing the group.
    #[must_use]
    pub const fn with_shard_count(mut self, shards: u32) -> Self {
        self.shard_count = shards;
        self
    }

    /// Creates a configuration for testing.
    ///
    /// One thousand in-flight operations or 1 MiB in flight, replenished at
    /// one million operations or 64 MiB per second.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_weight: 1_000,
            max_size: 1 << 20,
            weight_rate: 1_000_000,
            size_rate: 64 << 20,
            rate_factor: 1.0,
            rate_limit_duration_us: 2_000,
            shard_count: 1,
        }
    }
}

impl Default for FairGroupConfig {
    fn default() -> Self {
        Self::new(1_000, 1 << 20, 1_000_000, 64 << 20)
    }
}

/// Read-only snapshot of the group's rovers.
#[derive(Debug, Clone, Copy)]
pub struct FairGroupStats {
    /// Reservation frontier: total capacity ever grabbed.
    pub capacity_tail: Capacity,
    /// Grant frontier: total capacity ever issued by replenishment.
    pub capacity_head: Capacity,
    /// Release ceiling: bound on how far the grant frontier may advance.
    pub capacity_ceil: Capacity,
    /// Capacity reserved but not yet granted.
    pub outstanding: Capacity,
    /// Capacity replenishment may still issue before hitting the ceiling.
    pub headroom: Capacity,
}

/// Process-wide capacity accountant shared by every shard's fair queue.
///
/// All methods take `&self`; cross-shard coordination happens entirely
/// through the atomic rovers and the replenishment compare-exchange.
#[derive(Debug)]
pub struct FairGroup {
    /// Reference budget for rating in-flight tickets.
    shares_capacity: Ticket,
    /// Per-tick cost budget for rating request tickets.
    cost_capacity: Ticket,
    /// Fixed-point capacity units issued per tick.
    replenish_rate: f64,
    /// Maximum capacity retained between replenishments.
    replenish_limit: Capacity,
    replenish_threshold: Capacity,
    /// Timestamp (microseconds) of the last applied replenishment.
    replenished_us: AtomicU64,
    capacity_tail: AtomicU64,
    capacity_head: AtomicU64,
    capacity_ceil: AtomicU64,
    shard_count: u32,
}

impl FairGroup {
    /// Creates a group with the full burst allowance available as headroom
    /// and nothing yet granted.
    #[must_use]
    pub fn new(config: &FairGroupConfig, now_us: u64) -> Self {
        let cost_capacity = Ticket::new(
            u32::try_from(config.weight_rate / TICKS_PER_SECOND).unwrap_or(u32::MAX),
            u32::try_from(config.size_rate / TICKS_PER_SECOND).unwrap_or(u32::MAX),
        );
        let replenish_rate = config.rate_factor * FIXED_POINT_FACTOR;
        let duration_ticks = config.rate_limit_duration_us as f64 / RATE_RESOLUTION_US as f64;
        let replenish_limit = (replenish_rate * duration_ticks).round() as Capacity;

        let group = Self {
            shares_capacity: Ticket::new(config.max_weight, config.max_size),
            cost_capacity,
            replenish_rate,
            replenish_limit,
            replenish_threshold: REPLENISH_THRESHOLD,
            replenished_us: AtomicU64::new(now_us),
            capacity_tail: AtomicU64::new(0),
            capacity_head: AtomicU64::new(0),
            capacity_ceil: AtomicU64::new(replenish_limit),
            shard_count: config.shard_count.max(1),
        };
        debug!(
            shares = %group.shares_capacity,
            cost = %group.cost_capacity,
            rate = group.replenish_rate,
            limit = group.replenish_limit,
            shards = group.shard_count,
            "created fair group"
        );
        group
    }

    /// Reserves `cap` capacity units, returning the reservation frontier as
    /// it was before this grab. Never fails, never blocks.
    ///
    /// The caller's slot ends in the rover at `prior + cap`; whether that
    /// slot is already granted is answered by [`Self::capacity_deficiency`].
    pub fn grab_capacity(&self, cap: Capacity) -> Capacity {
        self.capacity_tail.fetch_add(cap, Ordering::Relaxed)
    }

    /// Returns `cap` capacity units as headroom for future replenishment.
    /// Called when a dispatched request completes.
    pub fn release_capacity(&self, cap: Capacity) {
        self.capacity_ceil.fetch_add(cap, Ordering::Relaxed);
    }

    /// Advances the grant frontier by the capacity earned since the last
    /// replenishment, bounded by the release ceiling.
    ///
    /// Any shard may call this from its timer. The compare-exchange elects a
    /// single winner per interval, so total issuance stays globally
    /// rate-limited without a lock; losers return immediately.
    pub fn replenish_capacity(&self, now_us: u64) {
        let ts = self.replenished_us.load(Ordering::Relaxed);
        if now_us <= ts {
            return;
        }

        let delta_ticks = (now_us - ts) as f64 / RATE_RESOLUTION_US as f64;
        let extra = (self.replenish_rate * delta_ticks).round() as Capacity;
        if extra < self.replenish_threshold {
            return;
        }

        if self
            .replenished_us
            .compare_exchange(ts, now_us, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Another shard applied this interval.
            return;
        }

        let headroom = wrapping_difference(
            self.capacity_ceil.load(Ordering::Relaxed),
            self.capacity_head.load(Ordering::Relaxed),
        );
        let granted = extra.min(headroom);
        self.capacity_head.fetch_add(granted, Ordering::Relaxed);
        trace!(extra, granted, headroom, "replenished capacity");
    }

    /// How far past the grant frontier the position `from` lies. Zero means
    /// the reservation ending at `from` is fully granted.
    #[must_use]
    pub fn capacity_deficiency(&self, from: Capacity) -> Capacity {
        wrapping_difference(from, self.capacity_head.load(Ordering::Relaxed))
    }

    /// Converts a ticket into fixed-point capacity against the per-tick
    /// cost budget.
    #[must_use]
    pub fn ticket_capacity(&self, ticket: Ticket) -> Capacity {
        (ticket.normalize(self.cost_capacity) * FIXED_POINT_FACTOR).round() as Capacity
    }

    /// Largest capacity the group can hold between replenishments.
    #[must_use]
    pub const fn maximum_capacity(&self) -> Capacity {
        self.replenish_limit
    }

    /// Per-dispatch capacity quota for one shard's queue.
    #[must_use]
    pub const fn per_shard_capacity(&self) -> Capacity {
        self.replenish_limit / self.shard_count as Capacity
    }

    /// Reference budget for rating in-flight tickets.
    #[must_use]
    pub const fn shares_capacity(&self) -> Ticket {
        self.shares_capacity
    }

    /// Per-tick cost budget for rating request tickets.
    #[must_use]
    pub const fn cost_capacity(&self) -> Ticket {
        self.cost_capacity
    }

    /// Snapshots the rovers. Relaxed loads; components may be mutually
    /// slightly stale under concurrent traffic.
    #[must_use]
    pub fn stats(&self) -> FairGroupStats {
        let tail = self.capacity_tail.load(Ordering::Relaxed);
        let head = self.capacity_head.load(Ordering::Relaxed);
        let ceil = self.capacity_ceil.load(Ordering::Relaxed);
        FairGroupStats {
            capacity_tail: tail,
            capacity_head: head,
            capacity_ceil: ceil,
            outstanding: wrapping_difference(tail, head),
            headroom: wrapping_difference(ceil, head),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_cost_config() -> FairGroupConfig {
        // Cost budget of one full fixed-point unit per tick in each
        // dimension, so a (1, 0) ticket costs exactly one capacity unit.
        FairGroupConfig::new(
            1_000,
            1 << 20,
            (1 << 24) * TICKS_PER_SECOND,
            (1 << 24) * TICKS_PER_SECOND,
        )
    }

    #[test]
    fn test_grab_returns_prior_tail() {
        let group = FairGroup::new(&FairGroupConfig::for_testing(), 0);
        assert_eq!(group.grab_capacity(10), 0);
        assert_eq!(group.grab_capacity(5), 10);
        assert_eq!(group.stats().capacity_tail, 15);
    }

    #[test]
    fn test_nothing_granted_before_first_replenish() {
        let group = FairGroup::new(&FairGroupConfig::for_testing(), 0);
        let want_head = group.grab_capacity(100) + 100;
        assert_eq!(group.capacity_deficiency(want_head), 100);
    }

    #[test]
    fn test_replenish_grants_at_rate() {
        let config = unit_cost_config()
            .with_rate_factor(10.0 / FIXED_POINT_FACTOR)
            .with_rate_limit_duration_us(10 * RATE_RESOLUTION_US);
        let group = FairGroup::new(&config, 0);
        assert_eq!(group.maximum_capacity(), 100);

        // One tick earns ten capacity units.
        group.replenish_capacity(RATE_RESOLUTION_US);
        assert_eq!(group.stats().capacity_head, 10);

        // A stale timestamp is a no-op.
        group.replenish_capacity(RATE_RESOLUTION_US);
        assert_eq!(group.stats().capacity_head, 10);

        group.replenish_capacity(2 * RATE_RESOLUTION_US);
        assert_eq!(group.stats().capacity_head, 20);
    }

    #[test]
    fn test_replenish_clamped_by_ceiling() {
        let config = unit_cost_config()
            .with_rate_factor(10.0 / FIXED_POINT_FACTOR)
            .with_rate_limit_duration_us(10 * RATE_RESOLUTION_US);
        let group = FairGroup::new(&config, 0);

        // A long idle gap earns far more than the ceiling allows; the
        // grant is capped at the burst limit.
        group.replenish_capacity(1_000 * RATE_RESOLUTION_US);
        assert_eq!(group.stats().capacity_head, 100);
        assert_eq!(group.stats().headroom, 0);
    }

    #[test]
    fn test_release_raises_ceiling() {
        let config = unit_cost_config()
            .with_rate_factor(10.0 / FIXED_POINT_FACTOR)
            .with_rate_limit_duration_us(10 * RATE_RESOLUTION_US);
        let group = FairGroup::new(&config, 0);

        group.replenish_capacity(1_000 * RATE_RESOLUTION_US);
        assert_eq!(group.stats().headroom, 0);

        group.release_capacity(40);
        assert_eq!(group.stats().headroom, 40);

        group.replenish_capacity(2_000 * RATE_RESOLUTION_US);
        assert_eq!(group.stats().capacity_head, 140);
    }

    #[test]
    fn test_time_going_backwards_is_noop() {
        let group = FairGroup::new(&FairGroupConfig::for_testing(), 1_000_000);
        group.replenish_capacity(500_000);
        assert_eq!(group.stats().capacity_head, 0);
    }

    #[test]
    fn test_below_threshold_skip() {
        // A rate so low that one microsecond earns less than one unit.
        let config = unit_cost_config()
            .with_rate_factor(100.0 / FIXED_POINT_FACTOR)
            .with_rate_limit_duration_us(10 * RATE_RESOLUTION_US);
        let group = FairGroup::new(&config, 0);

        group.replenish_capacity(1);
        assert_eq!(group.stats().capacity_head, 0);
        // The skipped interval is not lost; it is granted once it matures.
        group.replenish_capacity(RATE_RESOLUTION_US);
        assert_eq!(group.stats().capacity_head, 100);
    }

    #[test]
    fn test_ticket_capacity_fixed_point() {
        let group = FairGroup::new(&unit_cost_config(), 0);
        assert_eq!(group.ticket_capacity(Ticket::new(1, 0)), 1);
        assert_eq!(group.ticket_capacity(Ticket::new(0, 1)), 1);
        assert_eq!(group.ticket_capacity(Ticket::default()), 0);
        assert_eq!(group.ticket_capacity(Ticket::new(1 << 24, 0)), 1 << 24);
    }

    #[test]
    fn test_per_shard_capacity() {
        let config = FairGroupConfig::for_testing().with_shard_count(4);
        let group = FairGroup::new(&config, 0);
        assert_eq!(group.per_shard_capacity(), group.maximum_capacity() / 4);
    }

    #[test]
    fn test_concurrent_grabs_are_exact() {
        let group = FairGroup::new(&FairGroupConfig::for_testing(), 0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10_000 {
                        group.grab_capacity(3);
                    }
                });
            }
        });
        assert_eq!(group.stats().capacity_tail, 4 * 10_000 * 3);
    }

    #[test]
    fn test_concurrent_replenish_single_winner() {
        let config = unit_cost_config()
            .with_rate_factor(10.0 / FIXED_POINT_FACTOR)
            .with_rate_limit_duration_us(1_000 * RATE_RESOLUTION_US);
        let group = FairGroup::new(&config, 0);

        // Many shards racing on the same interval must grant it once.
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| group.replenish_capacity(RATE_RESOLUTION_US));
            }
        });
        assert_eq!(group.stats().capacity_head, 10);
    }
}
