use crate::clock::Clock;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
struct BreakerState {
    consecutive_failures: u32,
    cooldown_until: Option<u64>,
}

/// Circuit breaker для загрузки скриншотов.
/// After `threshold` consecutive upload failures every capture goes to the queue until the
/// cooldown elapses. After that one attempt is allowed; another failure re-opens it.
pub struct UploadBreaker {
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    threshold: u32,
    cooldown_secs: u64,
}

impl UploadBreaker {
    pub fn new(clock: Arc<dyn Clock>, threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            clock,
            threshold,
            cooldown_secs,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// True while uploads must not be attempted.
    pub fn in_cooldown(&self) -> bool {
        let now = self.clock.now_secs();
        matches!(self.lock().cooldown_until, Some(until) if until > now)
    }

    pub fn cooldown_until(&self) -> Option<u64> {
        self.lock().cooldown_until
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.cooldown_until.is_some() {
            info!("[BREAKER] Upload succeeded, breaker closed");
        }
        *state = BreakerState::default();
    }

    /// Returns `Some(until)` when this failure opened the cooldown window.
    pub fn record_failure(&self) -> Option<u64> {
        let now = self.clock.now_secs();
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures < self.threshold {
            return None;
        }
        if matches!(state.cooldown_until, Some(until) if until > now) {
            return None;
        }
        let until = now + self.cooldown_secs;
        state.cooldown_until = Some(until);
        warn!(
            "[BREAKER] {} consecutive upload failures, uploads paused until {}",
            state.consecutive_failures, until
        );
        Some(until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_opens_on_third_failure() {
        let clock = Arc::new(ManualClock::new(1_000));
        let b = UploadBreaker::new(clock, 3, 600);
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.record_failure(), Some(1_600));
        assert!(b.in_cooldown());
    }

    #[test]
    fn test_cooldown_elapses_then_single_failure_reopens() {
        let clock = Arc::new(ManualClock::new(1_000));
        let b = UploadBreaker::new(clock.clone(), 3, 600);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(599);
        assert!(b.in_cooldown());
        clock.advance(1);
        assert!(!b.in_cooldown());
        assert_eq!(b.record_failure(), Some(2_200));
    }

    #[test]
    fn test_success_closes() {
        let clock = Arc::new(ManualClock::new(1_000));
        let b = UploadBreaker::new(clock, 3, 600);
        for _ in 0..3 {
            b.record_failure();
        }
        b.record_success();
        assert!(!b.in_cooldown());
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.cooldown_until(), None);
    }
}
