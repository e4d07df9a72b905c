//! The per-node monotonic clock.
//!
//! Readings combine the system monotonic source with a simulated drift
//! factor, and are re-anchored (`rebase`) whenever a follower syncs with the
//! oracle. Reported time never goes backward: any regression (drift
//! reconfiguration, backward rebase, suspended VM) is clamped to the last
//! reported value plus one nanosecond.

use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{KronosError, Result};
use crate::types::DriftTimeConfig;

pub struct MonotonicClock {
    created: Instant,
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    anchor: Instant,
    anchor_reported: i64,
    drift: DriftTimeConfig,
    last_reported: i64,
}

impl MonotonicClock {
    /// A clock initially anchored to wall time, so cluster time starts out
    /// looking like nanoseconds since the unix epoch.
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self::with_initial_time(wall)
    }

    pub fn with_initial_time(initial: i64) -> Self {
        Self {
            created: Instant::now(),
            inner: Mutex::new(ClockInner {
                anchor: Instant::now(),
                anchor_reported: initial,
                drift: DriftTimeConfig::default(),
                last_reported: 0,
            }),
        }
    }

    /// Current cluster time in nanoseconds on this node.
    pub fn now_nanos(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let mut reported = Self::project(&inner, Instant::now());
        if reported <= inner.last_reported {
            if reported < inner.last_reported {
                warn!(
                    reported,
                    last = inner.last_reported,
                    "monotonic clock regressed; clamping"
                );
            }
            reported = inner.last_reported + 1;
        }
        inner.last_reported = reported;
        reported
    }

    /// Raw (undrifted) nanoseconds since this clock was created; used to
    /// derive the replicated uptime deltas.
    pub fn uptime_nanos(&self) -> i64 {
        self.created.elapsed().as_nanos() as i64
    }

    /// Re-anchor so readings at the current instant project `new_reported`.
    /// Anchoring behind `last_reported` is allowed: readings then plateau at
    /// `last_reported + 1` until the new anchor catches up, which is what
    /// bounds a fast follower's lead over the oracle.
    pub fn rebase(&self, new_reported: i64) {
        let mut inner = self.inner.lock().unwrap();
        if new_reported <= inner.last_reported {
            debug!(
                new_reported,
                last = inner.last_reported,
                "rebase anchor is behind the last reported time"
            );
        }
        inner.anchor = Instant::now();
        inner.anchor_reported = new_reported;
    }

    pub fn set_drift_config(&self, cfg: DriftTimeConfig) -> Result<()> {
        if !(0.0..=2.0).contains(&cfg.drift_factor) {
            return Err(KronosError::Config(format!(
                "drift factor {} outside [0, 2]",
                cfg.drift_factor
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        // Re-anchor first so past ticks keep the old factor; the offset is
        // folded into the anchor as a one-time jump.
        let now = Instant::now();
        let reported = Self::project(&inner, now);
        inner.anchor = now;
        inner.anchor_reported = reported.max(inner.last_reported) + cfg.offset_ns;
        inner.drift = cfg;
        Ok(())
    }

    pub fn drift_config(&self) -> DriftTimeConfig {
        self.inner.lock().unwrap().drift
    }

    fn project(inner: &ClockInner, at: Instant) -> i64 {
        let elapsed = at.duration_since(inner.anchor).as_nanos() as i64;
        let scaled = (elapsed as f64 * inner.drift.drift_factor) as i64;
        inner.anchor_reported + scaled
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_is_monotonic() {
        let clock = MonotonicClock::with_initial_time(1_000);
        let mut last = 0;
        for _ in 0..10_000 {
            let now = clock.now_nanos();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_advances_at_roughly_real_rate() {
        let clock = MonotonicClock::with_initial_time(0);
        let start = clock.now_nanos();
        std::thread::sleep(Duration::from_millis(50));
        let elapsed = clock.now_nanos() - start;
        assert!(elapsed >= 45_000_000, "elapsed {}", elapsed);
        assert!(elapsed <= 500_000_000, "elapsed {}", elapsed);
    }

    #[test]
    fn test_drift_factor_scales_rate() {
        let clock = MonotonicClock::with_initial_time(0);
        clock
            .set_drift_config(DriftTimeConfig {
                drift_factor: 2.0,
                offset_ns: 0,
            })
            .unwrap();
        let start = clock.now_nanos();
        std::thread::sleep(Duration::from_millis(50));
        let elapsed = clock.now_nanos() - start;
        // Doubled rate; generous upper bound for scheduler noise.
        assert!(elapsed >= 90_000_000, "elapsed {}", elapsed);
    }

    #[test]
    fn test_zero_drift_factor_still_monotonic() {
        let clock = MonotonicClock::with_initial_time(5_000);
        clock
            .set_drift_config(DriftTimeConfig {
                drift_factor: 0.0,
                offset_ns: 0,
            })
            .unwrap();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b > a);
    }

    #[test]
    fn test_invalid_drift_factor_rejected() {
        let clock = MonotonicClock::new();
        let cfg = DriftTimeConfig {
            drift_factor: 2.5,
            offset_ns: 0,
        };
        assert!(clock.set_drift_config(cfg).is_err());
    }

    #[test]
    fn test_rebase_forward() {
        let clock = MonotonicClock::with_initial_time(0);
        clock.now_nanos();
        clock.rebase(1_000_000_000_000);
        let now = clock.now_nanos();
        assert!(now >= 1_000_000_000_000);
        assert!(now < 1_001_000_000_000);
    }

    #[test]
    fn test_rebase_backward_is_clamped() {
        let clock = MonotonicClock::with_initial_time(1_000_000_000_000);
        let before = clock.now_nanos();
        clock.rebase(1);
        let after = clock.now_nanos();
        assert!(after > before);
    }

    #[test]
    fn test_backward_rebase_plateaus_until_caught_up() {
        let clock = MonotonicClock::with_initial_time(1_000_000_000);
        let before = clock.now_nanos();

        // Anchor 5ms behind: readings sit just past `before`...
        clock.rebase(before - 5_000_000);
        let clamped = clock.now_nanos();
        assert_eq!(clamped, before + 1);

        // ...until the new anchor overtakes, after which they track it.
        std::thread::sleep(Duration::from_millis(20));
        let caught_up = clock.now_nanos();
        assert!(caught_up > before + 10_000_000, "caught_up {}", caught_up);
    }

    #[test]
    fn test_negative_offset_is_clamped() {
        let clock = MonotonicClock::with_initial_time(1_000_000);
        let before = clock.now_nanos();
        clock
            .set_drift_config(DriftTimeConfig {
                drift_factor: 1.0,
                offset_ns: -1_000_000_000,
            })
            .unwrap();
        let after = clock.now_nanos();
        assert!(after > before);
    }
}
