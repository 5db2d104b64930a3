//! Fail-fast gate for the upload path.
//!
//! Per-replica, not shared: the point is to stop a broken storage backend
//! from consuming render-pool capacity, not to coordinate across workers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::StorageError;

pub const BREAKER_THRESHOLD: u32 = 3;
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_since: Option<Instant>,
    probing: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Gate an upload attempt. While open, fails immediately without
    /// touching the store; after the cooldown exactly one probe request is
    /// let through.
    pub fn check(&self) -> Result<(), StorageError> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match state.open_since {
            None => Ok(()),
            Some(opened) => {
                if !state.probing && now.duration_since(opened) >= self.cooldown {
                    state.probing = true;
                    Ok(())
                } else {
                    Err(StorageError::Unavailable)
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        *state = BreakerState::default();
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    fn on_failure_at(&self, now: Instant) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        state.consecutive_failures += 1;
        if state.probing {
            // Failed probe: reopen for a full cooldown.
            state.probing = false;
            state.open_since = Some(now);
        } else if state.open_since.is_none() && state.consecutive_failures >= self.threshold {
            state.open_since = Some(now);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .expect("breaker mutex poisoned")
            .open_since
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::default();
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.check().is_ok());
        assert!(!breaker.is_open());
    }

    #[test]
    fn opens_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::default();
        for _ in 0..3 {
            breaker.on_failure();
        }
        assert!(breaker.is_open());
        assert!(matches!(breaker.check(), Err(StorageError::Unavailable)));
    }

    #[test]
    fn success_resets_the_counter() {
        let breaker = CircuitBreaker::default();
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn allows_one_probe_after_cooldown() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let opened_at = Instant::now();
        for _ in 0..3 {
            breaker.on_failure_at(opened_at);
        }

        // Still open inside the cooldown window.
        assert!(breaker
            .check_at(opened_at + Duration::from_secs(30))
            .is_err());

        // One probe allowed through after the cooldown...
        let probe_time = opened_at + Duration::from_secs(61);
        assert!(breaker.check_at(probe_time).is_ok());
        // ...but only one.
        assert!(breaker.check_at(probe_time).is_err());
    }

    #[test]
    fn failed_probe_reopens_for_a_full_cooldown() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let opened_at = Instant::now();
        for _ in 0..3 {
            breaker.on_failure_at(opened_at);
        }

        let probe_time = opened_at + Duration::from_secs(61);
        assert!(breaker.check_at(probe_time).is_ok());
        breaker.on_failure_at(probe_time);

        assert!(breaker
            .check_at(probe_time + Duration::from_secs(59))
            .is_err());
        assert!(breaker
            .check_at(probe_time + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn successful_probe_closes_the_breaker() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let opened_at = Instant::now();
        for _ in 0..3 {
            breaker.on_failure_at(opened_at);
        }

        assert!(breaker.check_at(opened_at + Duration::from_secs(61)).is_ok());
        breaker.on_success();
        assert!(!breaker.is_open());
        assert!(breaker.check().is_ok());
    }
}
