//! Quota Windows
//!
//! A quota holds up to `capacity` tokens and is topped up once per elapsed
//! window. The gate owns its quotas behind a single lock, so the types here
//! are plain values with no interior mutability.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::config::QuotaConfig;

/// A named token ceiling over a fixed window
#[derive(Debug, Clone)]
pub struct Quota {
    /// Quota name (e.g. "per-minute")
    name: String,

    /// Maximum tokens
    capacity: u32,

    /// Tokens currently available
    available: u32,

    /// Refill window
    window: Duration,

    /// Last time tokens were added
    last_refill: Instant,
}

impl Quota {
    /// Create a full quota whose first window starts at `now`
    pub fn new(name: impl Into<String>, capacity: u32, window: Duration, now: Instant) -> Self {
        Self {
            name: name.into(),
            capacity,
            available: capacity,
            window,
            last_refill: now,
        }
    }

    /// Create a quota from validated configuration
    pub fn from_config(config: &QuotaConfig, now: Instant) -> Self {
        Self::new(config.name.clone(), config.capacity, config.window(), now)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Whether at least one token is available
    pub fn has_token(&self) -> bool {
        self.available > 0
    }

    /// Add `capacity` tokens per whole window elapsed since the last refill
    ///
    /// Returns the number of tokens added. Calling this again before another
    /// full window has passed adds nothing.
    pub fn refill(&mut self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let elapsed_windows = elapsed.as_nanos() / self.window.as_nanos().max(1);
        if elapsed_windows == 0 {
            return 0;
        }

        let credit = elapsed_windows.saturating_mul(self.capacity as u128);
        let refilled = (self.available as u128)
            .saturating_add(credit)
            .min(self.capacity as u128) as u32;
        let added = refilled - self.available;

        self.available = refilled;
        self.last_refill = now;
        added
    }

    /// Take one token, returning false if none are available
    pub fn try_take(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Time until the next window boundary, measured from `now`
    pub fn time_until_refill(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.window.saturating_sub(elapsed)
    }

    /// Point-in-time view for status output
    pub fn status(&self) -> QuotaStatus {
        QuotaStatus {
            available: self.available,
            capacity: self.capacity,
        }
    }
}

/// Available tokens versus capacity for one quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub available: u32,
    pub capacity: u32,
}

impl QuotaStatus {
    /// Percentage of capacity still available
    pub fn available_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.available as f64 / self.capacity as f64) * 100.0
    }
}

/// Refill every quota against the same instant
pub(crate) fn refill_all(quotas: &mut [Quota], now: Instant) -> u32 {
    quotas.iter_mut().map(|q| q.refill(now)).sum()
}

/// Earliest time from `now` at which every empty quota has refilled
///
/// Zero when no quota is empty.
pub(crate) fn time_until_admissible(quotas: &[Quota], now: Instant) -> Duration {
    quotas
        .iter()
        .filter(|q| !q.has_token())
        .map(|q| q.time_until_refill(now))
        .max()
        .unwrap_or(Duration::ZERO)
}

/// Take one token from every quota, or from none of them
pub(crate) fn try_take_all(quotas: &mut [Quota]) -> bool {
    if !quotas.iter().all(Quota::has_token) {
        return false;
    }
    for quota in quotas.iter_mut() {
        quota.try_take();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_quota_starts_full() {
        let quota = Quota::new("per-minute", 15, MINUTE, Instant::now());
        assert_eq!(quota.available(), 15);
        assert_eq!(quota.capacity(), 15);
        assert!(quota.has_token());
    }

    #[test]
    fn test_try_take_until_empty() {
        let mut quota = Quota::new("per-minute", 2, MINUTE, Instant::now());
        assert!(quota.try_take());
        assert!(quota.try_take());
        assert!(!quota.try_take());
        assert_eq!(quota.available(), 0);
    }

    #[test]
    fn test_refill_within_window_is_noop() {
        let start = Instant::now();
        let mut quota = Quota::new("per-minute", 5, MINUTE, start);
        quota.try_take();
        quota.try_take();

        assert_eq!(quota.refill(start + Duration::from_secs(10)), 0);
        assert_eq!(quota.refill(start + Duration::from_secs(59)), 0);
        assert_eq!(quota.available(), 3);
        assert_eq!(quota.last_refill(), start);
    }

    #[test]
    fn test_refill_after_one_window_adds_capacity_clamped() {
        let start = Instant::now();
        let mut quota = Quota::new("per-minute", 5, MINUTE, start);
        for _ in 0..5 {
            quota.try_take();
        }

        assert_eq!(quota.refill(start + MINUTE), 5);
        assert_eq!(quota.available(), 5);

        // Partially used quota is clamped to capacity, not exceeded
        quota.try_take();
        assert_eq!(quota.refill(start + MINUTE * 2), 1);
        assert_eq!(quota.available(), 5);
    }

    #[test]
    fn test_refill_resets_window_start() {
        let start = Instant::now();
        let mut quota = Quota::new("per-minute", 3, MINUTE, start);
        quota.try_take();

        let refill_at = start + Duration::from_secs(90);
        quota.refill(refill_at);
        assert_eq!(quota.last_refill(), refill_at);

        // Next window is measured from the refill, not from the old boundary
        quota.try_take();
        assert_eq!(quota.refill(start + Duration::from_secs(120)), 0);
        assert_eq!(quota.refill(refill_at + MINUTE), 1);
    }

    #[test]
    fn test_long_idle_refills_to_capacity_only() {
        let start = Instant::now();
        let mut quota = Quota::new("per-hour", 10, Duration::from_secs(3600), start);
        quota.try_take();

        quota.refill(start + Duration::from_secs(3600 * 1000));
        assert_eq!(quota.available(), 10);
    }

    #[test]
    fn test_time_until_admissible_waits_for_slowest_empty_quota() {
        let start = Instant::now();
        let mut quotas = vec![
            Quota::new("per-minute", 1, MINUTE, start),
            Quota::new("per-hour", 1, Duration::from_secs(3600), start),
        ];
        let now = start + Duration::from_secs(10);
        assert_eq!(time_until_admissible(&quotas, now), Duration::ZERO);

        assert!(try_take_all(&mut quotas));
        assert_eq!(time_until_admissible(&quotas, now), Duration::from_secs(3590));

        quotas[1] = Quota::new("per-hour", 5, Duration::from_secs(3600), start);
        assert_eq!(time_until_admissible(&quotas, now), Duration::from_secs(50));
    }

    #[test]
    fn test_time_until_refill() {
        let start = Instant::now();
        let quota = Quota::new("per-minute", 1, MINUTE, start);
        assert_eq!(quota.time_until_refill(start + Duration::from_secs(45)), Duration::from_secs(15));
        assert_eq!(quota.time_until_refill(start + Duration::from_secs(75)), Duration::ZERO);
    }

    #[test]
    fn test_take_all_is_all_or_nothing() {
        let start = Instant::now();
        let mut quotas = vec![
            Quota::new("per-minute", 15, MINUTE, start),
            Quota::new("per-hour", 1, Duration::from_secs(3600), start),
        ];

        assert!(try_take_all(&mut quotas));
        assert!(!try_take_all(&mut quotas));

        // The minute quota keeps its tokens when the hour quota is empty
        assert_eq!(quotas[0].available(), 14);
        assert_eq!(quotas[1].available(), 0);
    }

    #[test]
    fn test_refill_all_uses_each_window() {
        let start = Instant::now();
        let mut quotas = vec![
            Quota::new("per-minute", 2, MINUTE, start),
            Quota::new("per-hour", 2, Duration::from_secs(3600), start),
        ];
        assert!(try_take_all(&mut quotas));
        assert!(try_take_all(&mut quotas));

        assert_eq!(refill_all(&mut quotas, start + MINUTE), 2);
        assert_eq!(quotas[0].available(), 2);
        assert_eq!(quotas[1].available(), 0);
    }

    #[test]
    fn test_quota_status() {
        let mut quota = Quota::new("per-minute", 20, MINUTE, Instant::now());
        for _ in 0..15 {
            quota.try_take();
        }
        let status = quota.status();
        assert_eq!(status, QuotaStatus { available: 5, capacity: 20 });
        assert_eq!(status.available_percent(), 25.0);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Take,
        Advance(u64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => Just(Step::Take),
            1 => (0u64..200_000).prop_map(Step::Advance),
        ]
    }

    proptest! {
        #[test]
        fn prop_available_stays_within_bounds(
            capacity in 1u32..50,
            window_ms in 1u64..120_000,
            steps in proptest::collection::vec(step(), 0..200),
        ) {
            let start = Instant::now();
            let mut quota = Quota::new("prop", capacity, Duration::from_millis(window_ms), start);
            let mut now = start;

            for step in steps {
                match step {
                    Step::Take => {
                        let before = quota.available();
                        let taken = quota.try_take();
                        prop_assert_eq!(taken, before > 0);
                    }
                    Step::Advance(ms) => {
                        now += Duration::from_millis(ms);
                        quota.refill(now);
                        // A second refill at the same instant never adds tokens
                        prop_assert_eq!(quota.refill(now), 0);
                    }
                }
                prop_assert!(quota.available() <= quota.capacity());
            }
        }
    }
}
