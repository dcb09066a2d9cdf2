//! Engine notifications and their wire names.
//! Subscribers (UI, tray, logs) get every state change through one broadcast channel;
//! the core never assumes a renderer exists.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Event names used when forwarding engine events to a host UI.
pub mod events {
    pub const TIMER_STARTED: &str = "timer-started";
    pub const TIMER_PAUSED: &str = "timer-paused";
    pub const TIMER_RESUMED: &str = "timer-resumed";
    pub const TIMER_STOPPED: &str = "timer-stopped";
    pub const TIMERS_UPDATED: &str = "timers-updated";
    pub const TRACKING_STOPPED: &str = "tracking-stopped";
    pub const INACTIVITY_WARNING: &str = "inactivity-warning";
    pub const UPLOADS_PAUSED: &str = "uploads-paused";
    pub const QUOTA_EXCEEDED: &str = "storage-quota-exceeded";
    pub const DATA_CHANGED: &str = "data-changed";
    pub const ITEM_DISCARDED: &str = "queue-item-discarded";
    pub const HEALTH_CHANGED: &str = "api-health-changed";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    TimerStarted { sub_task_id: String },
    TimerPaused { sub_task_id: String, elapsed_seconds: u64 },
    TimerResumed { sub_task_id: String },
    TimerStopped { sub_task_id: String, elapsed_seconds: u64 },
    /// Emitted by the tick only when at least one elapsed value changed
    TimersUpdated { total_seconds: u64 },
    /// Last active timer stopped
    TrackingStopped,
    /// Capture saw zero keyboard and pointer activity (transparent mode only)
    InactivityWarning { sub_task_id: String },
    /// Upload breaker opened; captures go to the local queue until `until`
    UploadsPaused { until: u64 },
    QuotaExceeded { message: String },
    /// Dependent views (history, task list) should re-read the cache
    DataChanged { scope: String },
    ItemDiscarded { id: i64, kind: String },
    HealthChanged { healthy: bool },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TimerStarted { .. } => events::TIMER_STARTED,
            EngineEvent::TimerPaused { .. } => events::TIMER_PAUSED,
            EngineEvent::TimerResumed { .. } => events::TIMER_RESUMED,
            EngineEvent::TimerStopped { .. } => events::TIMER_STOPPED,
            EngineEvent::TimersUpdated { .. } => events::TIMERS_UPDATED,
            EngineEvent::TrackingStopped => events::TRACKING_STOPPED,
            EngineEvent::InactivityWarning { .. } => events::INACTIVITY_WARNING,
            EngineEvent::UploadsPaused { .. } => events::UPLOADS_PAUSED,
            EngineEvent::QuotaExceeded { .. } => events::QUOTA_EXCEEDED,
            EngineEvent::DataChanged { .. } => events::DATA_CHANGED,
            EngineEvent::ItemDiscarded { .. } => events::ITEM_DISCARDED,
            EngineEvent::HealthChanged { .. } => events::HEALTH_CHANGED,
        }
    }
}

/// Cloneable publisher. Publishing with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!("[IPC] {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
