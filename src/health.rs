//! API Health Monitor and its recovery probe.

use crate::api::RemoteApi;
use crate::clock::Clock;
use crate::ipc::{EngineEvent, EventBus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct HealthState {
    consecutive_failures: u32,
    last_success_at: u64,
}

/// Rolling judgment of whether the remote endpoint works.
/// `healthy = consecutive_failures < threshold && now - last_success_at < stale_after`.
pub struct ApiHealth {
    state: Mutex<HealthState>,
    clock: Arc<dyn Clock>,
    failure_threshold: u32,
    stale_after_secs: u64,
    events: EventBus,
    probe_running: AtomicBool,
    // Bumped whenever a probe is started or cancelled; a probe exits once its generation is stale
    probe_generation: AtomicU64,
    on_unhealthy: Mutex<Option<UnhealthyHook>>,
}

/// Called on every healthy → unhealthy transition (the owner starts the probe from it).
pub type UnhealthyHook = Arc<dyn Fn() + Send + Sync>;

impl ApiHealth {
    pub fn new(
        clock: Arc<dyn Clock>,
        failure_threshold: u32,
        stale_after_secs: u64,
        events: EventBus,
    ) -> Self {
        let now = clock.now_secs();
        Self {
            state: Mutex::new(HealthState {
                consecutive_failures: 0,
                last_success_at: now,
            }),
            clock,
            failure_threshold,
            stale_after_secs,
            events,
            probe_running: AtomicBool::new(false),
            probe_generation: AtomicU64::new(0),
            on_unhealthy: Mutex::new(None),
        }
    }

    pub fn set_on_unhealthy(&self, hook: UnhealthyHook) {
        if let Ok(mut slot) = self.on_unhealthy.lock() {
            *slot = Some(hook);
        }
    }

    /// Fire the unhealthy hook if the monitor is unhealthy and no probe runs.
    /// Covers the stale case, where no failure was ever recorded.
    pub fn ensure_probe(&self) {
        if !self.healthy() && !self.probe_running() {
            self.fire_unhealthy();
        }
    }

    fn fire_unhealthy(&self) {
        let hook = self.on_unhealthy.lock().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook();
        }
    }

    fn snapshot(&self) -> HealthState {
        // If mutex is poisoned, the data is still a pair of integers; keep going
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn is_healthy(&self, state: &HealthState) -> bool {
        state.consecutive_failures < self.failure_threshold
            && self.clock.now_secs().saturating_sub(state.last_success_at) < self.stale_after_secs
    }

    pub fn healthy(&self) -> bool {
        let state = self.snapshot();
        self.is_healthy(&state)
    }

    /// Failure threshold reached. Unlike `healthy()`, staleness alone does not count.
    pub fn failing(&self) -> bool {
        self.snapshot().consecutive_failures >= self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.snapshot().consecutive_failures
    }

    /// Any successful remote call. Also cancels a running probe.
    pub fn record_success(&self) {
        let was_healthy = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let was = self.is_healthy(&state);
            state.consecutive_failures = 0;
            state.last_success_at = self.clock.now_secs();
            was
        };
        if self.probe_running.swap(false, Ordering::AcqRel) {
            self.probe_generation.fetch_add(1, Ordering::AcqRel);
            debug!("[HEALTH] Probe cancelled by successful call");
        }
        if !was_healthy {
            info!("[HEALTH] API healthy again");
            self.events.emit(EngineEvent::HealthChanged { healthy: true });
        }
    }

    /// Returns true when this failure flipped healthy → unhealthy.
    pub fn record_failure(&self) -> bool {
        let (was_healthy, now_healthy, failures) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let was = self.is_healthy(&state);
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            (was, self.is_healthy(&state), state.consecutive_failures)
        };
        if was_healthy && !now_healthy {
            warn!(
                "[HEALTH] API unhealthy after {} consecutive failures",
                failures
            );
            self.events.emit(EngineEvent::HealthChanged { healthy: false });
            self.fire_unhealthy();
            return true;
        }
        false
    }

    pub fn probe_running(&self) -> bool {
        self.probe_running.load(Ordering::Acquire)
    }

    /// Start the recovery probe unless one is already running.
    /// The probe pings every `interval` (fixed cadence, no backoff); on the first success it
    /// records health success, stops, and calls `on_recovered`.
    pub fn spawn_probe<F>(
        self: &Arc<Self>,
        api: Arc<dyn RemoteApi>,
        interval: Duration,
        on_recovered: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .probe_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let generation = self.probe_generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("[HEALTH] Starting recovery probe every {:?}", interval);

        let health = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if health.probe_generation.load(Ordering::Acquire) != generation {
                    return;
                }
                match api.ping().await {
                    Ok(()) => {
                        if health.probe_generation.load(Ordering::Acquire) != generation {
                            return;
                        }
                        info!("[HEALTH] Probe succeeded");
                        health.record_success();
                        on_recovered();
                        return;
                    }
                    Err(e) => debug!("[HEALTH] Probe failed: {}", e),
                }
            }
        }))
    }
}
