use crate::bridge::HostBridge;
use crate::clock::Clock;
use crate::ipc::EventBus;
use crate::models::{MonitoringMode, TimerRecord};
use crate::store::TaskTimeStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
mod core;
mod db;

/// Timer Engine - FSM на каждый sub-task
/// Одна запись на sub-task, любое количество одновременно работающих таймеров.
/// Все переходы атомарны через один Mutex; store пишется до коммита в память.
pub struct TimerEngine {
    /// Активные таймеры - единственный источник истины (ключ: sub_task_id)
    pub(crate) timers: Arc<Mutex<BTreeMap<String, TimerRecord>>>,
    /// Накопленное время по sub-task (переживает перезапуск)
    pub(crate) store: Arc<dyn TaskTimeStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bridge: Arc<dyn HostBridge>,
    pub(crate) events: EventBus,
    pub(crate) default_screenshot_interval: u64,
}

/// What `start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A paused record existed and was resumed
    Resumed,
    /// Already running; nothing changed
    AlreadyRunning,
}

/// Ответ для UI: состояние одного таймера
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    pub sub_task_id: String,
    pub task_id: String,
    pub task_title: String,
    pub sub_task_title: String,
    pub is_paused: bool,
    pub elapsed_seconds: u64,
    pub earnings: Option<f64>,
    pub monitoring_mode: MonitoringMode,
}

/// Result of one elapsed refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedUpdate {
    pub changed: bool,
    /// Sum of elapsed over every record, paused ones included
    pub total_seconds: u64,
}

impl TimerEngine {
    pub fn new(
        store: Arc<dyn TaskTimeStore>,
        clock: Arc<dyn Clock>,
        bridge: Arc<dyn HostBridge>,
        events: EventBus,
        default_screenshot_interval: u64,
    ) -> Self {
        Self {
            timers: Arc::new(Mutex::new(BTreeMap::new())),
            store,
            clock,
            bridge,
            events,
            default_screenshot_interval: default_screenshot_interval.max(1),
        }
    }
}
