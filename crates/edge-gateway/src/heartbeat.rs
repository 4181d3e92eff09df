//! Adaptive heartbeat interval.
//!
//! The interval widens logarithmically with observed round-trip latency:
//!
//! ```text
//! interval = clamp(base * (1 + 0.1 * ln(latency_ms)), min, max)
//! ```
//!
//! Latency samples are smoothed with an exponentially weighted moving
//! average before they are applied.

use std::time::Duration;

use parking_lot::Mutex;

/// Weight of `ln(latency_ms)` in the interval formula.
const LATENCY_WEIGHT: f64 = 0.1;

/// Heartbeat interval bounds and smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatPolicy {
    /// Interval used when latency is negligible.
    pub base: Duration,
    /// Lower bound.
    pub min: Duration,
    /// Upper bound.
    pub max: Duration,
    /// EWMA weight of a new latency sample, in `(0, 1]`.
    pub smoothing: f64,
}

impl HeartbeatPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(base: Duration, min: Duration, max: Duration, smoothing: f64) -> Self {
        Self {
            base,
            min,
            max,
            smoothing,
        }
    }

    /// Compute the interval for a given latency.
    #[must_use]
    pub fn interval_for(&self, latency: Duration) -> Duration {
        let millis = latency.as_secs_f64() * 1000.0;
        // ln is negative below 1ms; treat that as no latency.
        let factor = if millis > 1.0 {
            1.0 + LATENCY_WEIGHT * millis.ln()
        } else {
            1.0
        };
        let interval = Duration::from_secs_f64(self.base.as_secs_f64() * factor);
        let (lo, hi) = self.bounds();
        interval.clamp(lo, hi)
    }

    /// Get `(min, max)` in ascending order.
    fn bounds(&self) -> (Duration, Duration) {
        if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        }
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(15),
            Duration::from_secs(5),
            Duration::from_secs(30),
            0.2,
        )
    }
}

/// Heartbeat interval that tracks smoothed latency.
#[derive(Debug)]
pub struct AdaptiveHeartbeat {
    policy: HeartbeatPolicy,
    latency_ms: Mutex<Option<f64>>,
}

impl AdaptiveHeartbeat {
    /// Create a tracker with no latency observed yet.
    #[must_use]
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self {
            policy,
            latency_ms: Mutex::new(None),
        }
    }

    /// Get the policy.
    #[must_use]
    pub const fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    /// Feed a latency sample.
    pub fn record(&self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let mut latency = self.latency_ms.lock();
        *latency = Some(match *latency {
            Some(current) => current + self.policy.smoothing * (sample_ms - current),
            None => sample_ms,
        });
    }

    /// Get the smoothed latency, if any sample has been recorded.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        let latency_ms = *self.latency_ms.lock();
        latency_ms.map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }

    /// Get the interval currently in force.
    #[must_use]
    pub fn current_interval(&self) -> Duration {
        let (lo, hi) = self.policy.bounds();
        self.latency()
            .map_or(self.policy.base.clamp(lo, hi), |latency| {
                self.policy.interval_for(latency)
            })
    }
}

impl Default for AdaptiveHeartbeat {
    fn default() -> Self {
        Self::new(HeartbeatPolicy::default())
    }
}
