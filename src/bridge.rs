use crate::error::BridgeError;
use crate::models::{ActivityCounters, MonitoringMode};
use serde::Serialize;

/// Context passed to the host when tracking starts (tray, overlay, OS integrations).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingContext {
    pub task_id: String,
    pub sub_task_id: String,
    pub task_title: String,
    pub sub_task_title: String,
    pub monitoring_mode: MonitoringMode,
}

/// Возможности хоста, которые движок использует как чёрный ящик.
/// Implementations must be cheap to call from the tick except `capture_frame`,
/// which the evidence pipeline runs on a blocking thread.
pub trait HostBridge: Send + Sync {
    /// Encoded frame bytes (codec is the host's choice).
    fn capture_frame(&self) -> Result<Vec<u8>, BridgeError>;

    fn activity_counters(&self) -> ActivityCounters;

    fn reset_activity_counters(&self);

    /// Stable per-machine id; `None` lets the engine generate and persist one.
    fn stable_device_id(&self) -> Option<String>;

    fn notify_tracking_started(&self, context: &TrackingContext);

    fn notify_tracking_stopped(&self);

    /// Aggregate elapsed seconds across all timers, once per tick.
    fn notify_tick(&self, total_seconds: u64);

    /// Frontmost application, sent with heartbeats when known.
    fn active_app_name(&self) -> Option<String> {
        None
    }
}
