//! Generic async retry-with-backoff helper.
//!
//! Adapted from `clawd::scheduler::backoff`: exponential backoff with jitter,
//! used by code that is not itself the task engine's classified retry path
//! (the broker's initial connection, via [`crate::broker::redis_backed`]).
//! The task engine's own retry scheduling lives in
//! [`crate::engine::retry_policy`] because it needs to interleave with
//! dependency/metrics state and the specification pins exact (unjittered)
//! delay values for it; this helper is for simpler call-and-retry cases
//! where spreading out simultaneous retries matters more than an exact
//! delay. Jitter is a deterministic pseudo-random spread derived from the
//! attempt number, the same trick the teacher's backoff module uses to
//! avoid pulling in a `rand` dependency for it.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter as a fraction of the computed (pre-jitter) delay (0.0-1.0).
    pub jitter_fraction: f64,
}

impl RetryConfig {
    pub fn capped(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter_fraction;
        let jittered = (capped + pseudo_rand(attempt) * jitter_range).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

/// A float in `[-0.5, 0.5)` from a simple LCG seeded by `attempt`, spreading
/// out retries from many processes started at once without needing a `rand`
/// dependency for it.
fn pseudo_rand(attempt: u32) -> f64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(attempt as u64).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}

/// Run `f` up to `config.max_attempts` times, sleeping with exponential
/// backoff between attempts. Returns the last error if every attempt fails.
pub async fn retry_with_backoff<F, Fut, T, E>(config: RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(config.delay_for(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::capped(3, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<u32, &str> = retry_with_backoff(cfg, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::capped(5, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<u32, &str> = retry_with_backoff(cfg, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("not yet")
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_after_all_attempts() {
        let cfg = RetryConfig::capped(3, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<u32, &str> =
            retry_with_backoff(cfg, || async { Err("still failing") }).await;
        assert_eq!(result, Err("still failing"));
    }

    #[tokio::test]
    async fn delay_is_capped_at_max_plus_jitter() {
        let cfg = RetryConfig::capped(10, Duration::from_millis(100), Duration::from_millis(150));
        let delay = cfg.delay_for(5);
        let max_with_jitter = Duration::from_millis(150 + (150.0 * cfg.jitter_fraction) as u64);
        assert!(delay <= max_with_jitter, "{delay:?} should not exceed {max_with_jitter:?}");
    }

    #[test]
    fn jitter_is_deterministic_for_a_given_attempt() {
        let cfg = RetryConfig::capped(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for(2), cfg.delay_for(2));
    }
}
