//! Full-jitter bounded exponential backoff, shared by the connection-level
//! reconnect loop and the per-channel watchdog (see `SPEC_FULL.md` §9).

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Computes the delay for attempt `n` (0-indexed): a uniformly random value
/// in `[0, min(max_delay_ms, initial_delay_ms * multiplier^n)]`.
pub fn full_jitter_delay(attempt: u32, policy: &ReconnectPolicy) -> Duration {
    let exp = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped = exp.min(policy.max_delay_ms as f64).max(0.0);
    let capped_ms = capped as u64;

    if capped_ms == 0 {
        return Duration::from_millis(0);
    }

    let jittered = rand::thread_rng().gen_range(0..=capped_ms);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn delay_never_exceeds_the_computed_cap() {
        let policy = policy();
        for attempt in 0..10 {
            let cap = (policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(attempt))
                .min(policy.max_delay_ms as f64) as u64;
            for _ in 0..50 {
                let delay = full_jitter_delay(attempt as u32, &policy);
                assert!(delay.as_millis() as u64 <= cap);
            }
        }
    }

    #[test]
    fn delay_saturates_at_max_delay_for_large_attempts() {
        let policy = policy();
        let delay = full_jitter_delay(64, &policy);
        assert!(delay.as_millis() as u64 <= policy.max_delay_ms);
    }

    #[test]
    fn zero_initial_delay_yields_zero_delay() {
        let mut policy = policy();
        policy.initial_delay_ms = 0;
        assert_eq!(full_jitter_delay(0, &policy), Duration::from_millis(0));
    }
}
