use crate::bridge::{HostBridge, TrackingContext};
use crate::error::BridgeError;
use crate::models::ActivityCounters;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// Счётчики активности ввода. Хост (hook клавиатуры/мыши) вызывает record_*,
/// движок читает и сбрасывает их на границах окон.
pub struct ActivityMonitor {
    pub is_monitoring: Arc<AtomicBool>,
    pub last_activity: Arc<Mutex<Instant>>,
    key_count: AtomicU64,
    pointer_count: AtomicU64,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            is_monitoring: Arc::new(AtomicBool::new(false)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            key_count: AtomicU64::new(0),
            pointer_count: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        self.is_monitoring.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.is_monitoring.store(false, Ordering::Release);
    }

    pub fn record_key(&self) {
        if self.is_monitoring.load(Ordering::Acquire) {
            self.key_count.fetch_add(1, Ordering::Relaxed);
            self.touch();
        }
    }

    pub fn record_pointer(&self) {
        if self.is_monitoring.load(Ordering::Acquire) {
            self.pointer_count.fetch_add(1, Ordering::Relaxed);
            self.touch();
        }
    }

    fn touch(&self) {
        // If mutex is poisoned, continue anyway
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn counters(&self) -> ActivityCounters {
        ActivityCounters {
            key_count: self.key_count.load(Ordering::Relaxed),
            pointer_count: self.pointer_count.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.key_count.store(0, Ordering::Relaxed);
        self.pointer_count.store(0, Ordering::Relaxed);
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge for hosts without screen capture (servers, CI, the headless binary without
/// the `desktop` feature). Activity comes from the shared `ActivityMonitor`.
pub struct HeadlessBridge {
    monitor: Arc<ActivityMonitor>,
    device_id: Option<String>,
}

impl HeadlessBridge {
    pub fn new(monitor: Arc<ActivityMonitor>, device_id: Option<String>) -> Self {
        Self { monitor, device_id }
    }
}

impl HostBridge for HeadlessBridge {
    fn capture_frame(&self) -> Result<Vec<u8>, BridgeError> {
        Err(BridgeError::CaptureUnavailable)
    }

    fn activity_counters(&self) -> ActivityCounters {
        self.monitor.counters()
    }

    fn reset_activity_counters(&self) {
        self.monitor.reset();
    }

    fn stable_device_id(&self) -> Option<String> {
        self.device_id.clone()
    }

    fn notify_tracking_started(&self, context: &TrackingContext) {
        self.monitor.start();
        info!(
            "[HOST] Tracking started: {} / {}",
            context.task_title, context.sub_task_title
        );
    }

    fn notify_tracking_stopped(&self) {
        self.monitor.stop();
        info!("[HOST] Tracking stopped");
    }

    fn notify_tick(&self, total_seconds: u64) {
        debug!("[HOST] Total tracked: {}s", total_seconds);
    }
}
