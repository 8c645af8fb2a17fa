//! Reconnect delay policy for event channels.
//!
//! Exponential growth from `initial` capped at `max`, with a symmetric random deviation of up to
//! `randomization * delay` so a fleet of clients does not reconnect in lockstep after the device
//! restarts.

use std::time::Duration;

use rand::Rng;

/// Reconnection tuning for [`SocketIoChannel`](crate::socketio::SocketIoChannel).
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Whether the channel reconnects on its own after losing the transport.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Jitter factor in `[0, 1]`.
    pub randomization: f64,
    /// Attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
            randomization: 0.3,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based), using `rng` for jitter.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.delay_with_sample(attempt, rng.random::<f64>())
    }

    /// Deterministic core of [`delay`](Self::delay): `sample` is a uniform draw in `[0, 1)`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let mut ms = initial_ms * 2f64.powi(attempt.min(32) as i32);
        let jitter = self.randomization.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let deviation = (sample * jitter * ms).floor();
            // The same draw picks the direction, so one sample fully determines the delay.
            if ((sample * 10.0).floor() as u64) & 1 == 0 {
                ms -= deviation;
            } else {
                ms += deviation;
            }
        }
        Duration::from_millis(ms.min(max_ms).max(0.0) as u64)
    }

    /// `true` once `attempt` (1-based) exceeds the configured attempt limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        !self.enabled || self.max_attempts.is_some_and(|max| attempt > max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped_without_jitter() {
        let policy = ReconnectPolicy {
            randomization: 0.0,
            ..ReconnectPolicy::default()
        };
        let delays: Vec<u64> = (0..7)
            .map(|n| policy.delay_with_sample(n, 0.5).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn jitter_stays_within_randomization_band() {
        let policy = ReconnectPolicy::default();
        for i in 0..100 {
            let sample = i as f64 / 100.0;
            let ms = policy.delay_with_sample(2, sample).as_millis() as f64;
            assert!((2_800.0..=5_200.0).contains(&ms), "delay {ms} out of band");
        }
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_with_sample(10, 0.99) <= policy.max);
        assert!(policy.delay_with_sample(u32::MAX, 0.15) <= policy.max);
    }

    #[test]
    fn attempts_are_unbounded_by_default() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(10_000));

        let limited = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert!(!limited.exhausted(3));
        assert!(limited.exhausted(4));

        let disabled = ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        };
        assert!(disabled.exhausted(1));
    }
}
