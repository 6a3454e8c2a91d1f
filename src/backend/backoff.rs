//! Transport-level retry delays.
//!
//! A transport retry repeats the same request against the same backend and
//! is invisible to the generation loop apart from the
//! [`TransportRetry`](crate::events::Event::TransportRetry) event and the
//! attempt's `transport_retries` count. Once retries run out the failure is
//! classified and the fallback chain moves on. A retry whose delay would
//! reach the request deadline is not taken.

use std::time::Duration;

use super::BackendError;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Retries after the first call. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
    /// Failure kinds worth repeating against the same backend.
    pub retry_on: Vec<BackendError>,
    /// Wait for the provider's `Retry-After` hint instead of the computed
    /// delay, still capped at `max_delay`.
    pub respect_retry_after: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

impl BackoffConfig {
    /// No transport retry; every failure goes straight to the fallback chain.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Hosted APIs: 3 retries from 1s doubling up to 30s, full jitter.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: JitterStrategy::Full,
            retry_on: vec![BackendError::RateLimited, BackendError::Unavailable],
            respect_retry_after: true,
        }
    }

    /// A caller is waiting: 2 quick retries capped at 5s.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::Equal,
            ..Self::standard()
        }
    }

    pub fn retries(&self, kind: BackendError) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Delay before retry number `retry` (0-indexed):
    /// `initial_delay * multiplier^retry`, clamped to `[0, max_delay]`, then
    /// jittered. A non-finite product counts as `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = if base.is_finite() { base.clamp(0.0, max) } else { max };

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };
        Duration::from_secs_f64(jittered)
    }

    /// Delay before retry number `retry`, preferring the provider's hint.
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if self.respect_retry_after => hint.min(self.max_delay),
            _ => self.delay_for_attempt(retry),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> BackoffConfig {
        BackoffConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::None,
            retry_on: vec![BackendError::RateLimited],
            respect_retry_after: true,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = exact();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_degenerate_multiplier_never_panics() {
        let negative = BackoffConfig {
            multiplier: -2.0,
            ..exact()
        };
        assert_eq!(negative.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(negative.delay_for_attempt(1), Duration::ZERO);

        let nan = BackoffConfig {
            multiplier: f64::NAN,
            ..exact()
        };
        assert_eq!(nan.delay_for_attempt(1), Duration::from_secs(5));

        let huge = BackoffConfig {
            multiplier: f64::MAX,
            jitter: JitterStrategy::Full,
            ..exact()
        };
        assert!(huge.delay_for_attempt(4) <= Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let full = BackoffConfig {
            jitter: JitterStrategy::Full,
            ..exact()
        };
        let equal = BackoffConfig {
            jitter: JitterStrategy::Equal,
            ..exact()
        };
        for _ in 0..100 {
            assert!(full.delay_for_attempt(1) <= Duration::from_secs(2));
            let d = equal.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2), "{d:?}");
        }
    }

    #[test]
    fn test_retry_after_hint() {
        let config = exact();
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(90))),
            Duration::from_secs(5)
        );
        let ignoring = BackoffConfig {
            respect_retry_after: false,
            ..exact()
        };
        assert_eq!(
            ignoring.delay_with_hint(0, Some(Duration::from_secs(3))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_presets() {
        assert_eq!(BackoffConfig::default().max_retries, 0);
        let standard = BackoffConfig::standard();
        assert_eq!(standard.max_retries, 3);
        assert!(standard.retries(BackendError::RateLimited));
        assert!(!standard.retries(BackendError::Malformed));
        assert!(!standard.retries(BackendError::Timeout));
        assert!(BackoffConfig::interactive().max_delay <= Duration::from_secs(5));
    }
}
