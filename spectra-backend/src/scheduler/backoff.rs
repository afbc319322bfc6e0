//! Per-key exponential backoff for retried tasks
//!
//! Each key (a task subject) doubles its delay on every consecutive error,
//! from `min` up to `max`. A key that stays quiet for `reset_after` starts
//! over at `min`.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default minimum backoff
pub const MIN_BACKOFF: Duration = Duration::from_secs(5);
/// Default maximum backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Quiet period after which a key's backoff resets
pub const RESET_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: MIN_BACKOFF,
            max: MAX_BACKOFF,
            reset_after: RESET_AFTER,
        }
    }
}

#[derive(Debug, Clone)]
struct BackoffState {
    current_delay: Duration,
    last_error_at: Instant,
    error_count: u32,
}

pub struct RetryBackoff {
    policy: BackoffPolicy,
    states: Mutex<HashMap<String, BackoffState>>,
}

impl RetryBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn record_success(&self, key: &str) {
        if self.states.lock().remove(key).is_some() {
            log::debug!("[SCHEDULER] backoff reset for '{}'", key);
        }
    }

    /// Record an error for `key` and return how long to wait
    pub fn record_error(&self, key: &str) -> Duration {
        let mut states = self.states.lock();
        let now = Instant::now();
        let policy = self.policy;

        let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
            current_delay: policy.min,
            last_error_at: now,
            error_count: 0,
        });

        if state.error_count > 0 && now.duration_since(state.last_error_at) > policy.reset_after {
            state.current_delay = policy.min;
            state.error_count = 1;
        } else {
            state.error_count += 1;
            if state.error_count > 1 {
                state.current_delay = (state.current_delay * 2).min(policy.max);
            }
        }
        state.last_error_at = now;

        log::debug!(
            "[SCHEDULER] error #{} for '{}', backoff {}ms",
            state.error_count,
            key,
            state.current_delay.as_millis()
        );
        state.current_delay
    }

    #[cfg(test)]
    pub fn current_delay(&self, key: &str) -> Option<Duration> {
        self.states.lock().get(key).map(|s| s.current_delay)
    }
}

/// Spread `base` by +/-20% so waiting workers do not wake in lockstep
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            min: Duration::from_secs(5),
            max: Duration::from_secs(60),
            reset_after: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = RetryBackoff::new(policy());
        let delays: Vec<u64> = (0..6).map(|_| backoff.record_error("t").as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_success_resets() {
        let backoff = RetryBackoff::new(policy());
        backoff.record_error("t");
        backoff.record_error("t");
        assert_eq!(backoff.current_delay("t"), Some(Duration::from_secs(10)));

        backoff.record_success("t");
        assert_eq!(backoff.current_delay("t"), None);
        assert_eq!(backoff.record_error("t"), Duration::from_secs(5));
    }

    #[test]
    fn test_keys_are_independent() {
        let backoff = RetryBackoff::new(policy());
        backoff.record_error("a");
        backoff.record_error("a");
        assert_eq!(backoff.record_error("b"), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        for _ in 0..50 {
            let d = jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
