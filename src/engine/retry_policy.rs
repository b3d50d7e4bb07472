//! Retry & failure classification (§4.C).
//!
//! The keyword tables are from the spec; the backoff math is grounded on
//! `clawd::scheduler::backoff::next_backoff` (exponential with a
//! multiplier, here left un-jittered since the spec pins an exact
//! `delay = initialDelay * backoffMultiplier^retryCount` for scenario
//! reproducibility — see §8 scenario 5).

use std::time::Duration;

use once_cell::sync::Lazy;

use super::model::RetryPolicy;

const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "temporary",
    "rate limit",
    "service unavailable",
    "internal server error",
    "502",
    "503",
    "504",
];

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "authentication",
    "authorization",
    "forbidden",
    "not found",
    "bad request",
    "invalid",
    "malformed",
];

static RETRYABLE_LOWER: Lazy<Vec<String>> =
    Lazy::new(|| RETRYABLE_PATTERNS.iter().map(|p| p.to_lowercase()).collect());
static NON_RETRYABLE_LOWER: Lazy<Vec<String>> =
    Lazy::new(|| NON_RETRYABLE_PATTERNS.iter().map(|p| p.to_lowercase()).collect());

/// Non-retryable predicates take precedence over retryable ones (§4.C,
/// confirmed by §8's "invalid connection" tie-break example).
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    if NON_RETRYABLE_LOWER.iter().any(|p| lower.contains(p.as_str())) {
        return false;
    }
    RETRYABLE_LOWER.iter().any(|p| lower.contains(p.as_str()))
}

/// `delay = initialDelay * backoffMultiplier ^ retryCount`.
pub fn backoff_delay(retry_count: u32, policy: &RetryPolicy) -> Duration {
    let ms = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(retry_count as i32);
    Duration::from_millis(ms.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_is_retryable() {
        assert!(is_retryable("Connection reset"));
    }

    #[test]
    fn forbidden_invalid_token_is_not_retryable() {
        assert!(!is_retryable("Forbidden: invalid token"));
    }

    #[test]
    fn non_retryable_wins_on_tie() {
        assert!(!is_retryable("invalid connection"));
    }

    #[test]
    fn backoff_matches_scenario_five() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
        };
        assert_eq!(backoff_delay(0, &policy), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1, &policy), Duration::from_millis(2000));
    }
}
