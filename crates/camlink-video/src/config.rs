use std::time::Duration;

/// Retry and fallback tuning for [`VideoTransport`](crate::VideoTransport).
#[derive(Clone, Debug)]
pub struct VideoConfig {
    /// Backoff retries before demoting to the fallback stream.
    pub max_retries: u32,
    /// First backoff delay; doubles with every retry.
    pub retry_base: Duration,
    /// Flat delay used when the peer reports "disconnected".
    pub disconnect_delay: Duration,
    /// Period of the peer-to-peer probe while in fallback.
    pub fallback_probe: Duration,
    /// Upper bound on waiting for ICE gathering before sending the offer.
    pub gather_timeout: Duration,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base: Duration::from_secs(2),
            disconnect_delay: Duration::from_secs(5),
            fallback_probe: Duration::from_secs(60),
            gather_timeout: Duration::from_secs(5),
        }
    }
}

impl VideoConfig {
    /// Delay before backoff retry number `retry` (1-based): `base * 2^(retry - 1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(1u32 << exp)
    }
}

/// Still-frame polling used while peer-to-peer video is unavailable.
#[derive(Clone, Debug)]
pub struct FallbackConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let cfg = VideoConfig::default();
        let delays: Vec<u64> = (1..=5).map(|n| cfg.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn backoff_saturates() {
        let cfg = VideoConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_secs(2));
        assert!(cfg.backoff(u32::MAX) >= cfg.backoff(17));
    }
}
