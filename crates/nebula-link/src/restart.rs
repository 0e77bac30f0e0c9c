//! Backoff policy for restarting an exhausted failover sequence.
//!
//! The orchestrator never leaves `Exhausted` on its own. A caller that wants
//! to keep trying uses [`RestartState`] (or `Client::restart_with_backoff`)
//! to space out fresh sequences with exponential delays and jitter.

use std::time::Duration;

use rand::Rng;

/// Configuration for restarting after all transports are exhausted.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the first restart. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed sequence. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Maximum delay between restarts. Default: 30 s.
    pub max_delay: Duration,
    /// Maximum number of restarts before giving up. Default: 20.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0), applied as ±jitter to the delay. Default: 0.25.
    pub jitter: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

/// Tracks restart count and computes the next backoff delay.
pub struct RestartState {
    policy: RestartPolicy,
    attempts: u32,
    current_delay: Duration,
}

impl RestartState {
    /// Create a new state from the given policy.
    pub fn new(policy: RestartPolicy) -> Self {
        let initial = policy.initial_delay;
        Self {
            policy,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` once `max_attempts` restarts have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts += 1;

        let jittered = if self.policy.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor =
                rng.random_range((1.0 - self.policy.jitter)..=(1.0 + self.policy.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.policy.backoff_multiplier);
        self.current_delay = next.min(self.policy.max_delay);

        Some(jittered.min(self.policy.max_delay))
    }

    /// Reset after a sequence reached `Connected`.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.policy.initial_delay;
    }

    /// Number of restarts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_no_jitter() -> RestartPolicy {
        RestartPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_intervals_increase() {
        let mut state = RestartState::new(policy_no_jitter());
        let delays: Vec<Duration> = (0..4).filter_map(|_| state.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_delay_capped_at_max() {
        let mut state = RestartState::new(RestartPolicy {
            max_delay: Duration::from_secs(5),
            ..policy_no_jitter()
        });
        let last = (0..10).filter_map(|_| state.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_secs(5));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut state = RestartState::new(RestartPolicy {
            max_attempts: 2,
            ..policy_no_jitter()
        });
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_none());
        assert_eq!(state.attempts(), 2);
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut state = RestartState::new(policy_no_jitter());
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut state = RestartState::new(RestartPolicy {
            jitter: 0.5,
            ..Default::default()
        });
        for _ in 0..10 {
            state.reset();
            let delay = state.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1500));
        }
    }
}
