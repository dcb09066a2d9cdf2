use crate::schedule::SubTaskSchedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Режим мониторинга: transparent показывает предупреждения пользователю, stealth нет
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringMode {
    #[default]
    Transparent,
    Stealth,
}

/// Raw input activity counters read from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCounters {
    pub key_count: u64,
    pub pointer_count: u64,
}

impl ActivityCounters {
    pub fn is_idle(&self) -> bool {
        self.key_count == 0 && self.pointer_count == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub title: String,
    /// Administratively deactivated tasks cannot be tracked
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskInfo {
    pub id: String,
    pub title: String,
    /// Time already tracked on the server for this sub-task
    #[serde(default)]
    pub tracked_seconds: u64,
    #[serde(default)]
    pub hourly_rate: Option<f64>,
    #[serde(default)]
    pub screenshot_interval_secs: Option<u64>,
    #[serde(default)]
    pub monitoring_mode: MonitoringMode,
    #[serde(default = "default_true")]
    pub screenshot_enabled: bool,
    #[serde(default = "default_true")]
    pub activity_enabled: bool,
    #[serde(default)]
    pub schedule: Option<SubTaskSchedule>,
}

fn default_true() -> bool {
    true
}

/// Task list entry as served by the remote and kept in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    #[serde(flatten)]
    pub task: TaskInfo,
    #[serde(default)]
    pub sub_tasks: Vec<SubTaskInfo>,
}

/// Состояние одного активного таймера (одна запись на sub-task)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerRecord {
    pub sub_task_id: String,
    pub task_id: String,
    pub task_title: String,
    pub sub_task_title: String,
    /// Unix timestamp начала текущего сегмента
    pub started_at: u64,
    /// Время, накопленное до текущего сегмента
    pub accumulated_seconds: u64,
    pub is_paused: bool,
    pub hourly_rate: Option<f64>,
    pub screenshot_interval_seconds: u64,
    pub monitoring_mode: MonitoringMode,
    pub last_screenshot_elapsed: u64,
    pub screenshot_enabled: bool,
    pub activity_enabled: bool,
    /// Last value published by the tick; never decreases
    pub elapsed_seconds: u64,
}

impl TimerRecord {
    /// `accumulated + (paused ? 0 : now - started_at)`; clock going backwards adds nothing.
    pub fn elapsed_at(&self, now: u64) -> u64 {
        if self.is_paused {
            self.accumulated_seconds
        } else {
            self.accumulated_seconds
                .saturating_add(now.saturating_sub(self.started_at))
        }
    }

    pub fn earnings_at(&self, now: u64) -> Option<f64> {
        self.hourly_rate
            .map(|rate| earnings(self.elapsed_at(now), rate))
    }
}

/// Заработок за `elapsed_seconds` при почасовой ставке `hourly_rate`
pub fn earnings(elapsed_seconds: u64, hourly_rate: f64) -> f64 {
    elapsed_seconds as f64 / 3600.0 * hourly_rate
}

/// One closed run segment of a timer, produced by pause and stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSegment {
    pub task_id: String,
    pub sub_task_id: String,
    pub started_at: u64,
    pub ended_at: u64,
    pub duration_seconds: u64,
    /// Running total for the sub-task after this segment
    pub total_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earnings: Option<f64>,
}

/// Five-minute activity summary for one running timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub task_id: String,
    pub sub_task_id: String,
    pub window_start: u64,
    pub window_end: u64,
    #[serde(flatten)]
    pub counters: ActivityCounters,
}

/// Result of stopping a timer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedTimer {
    pub sub_task_id: String,
    pub task_id: String,
    pub elapsed_seconds: u64,
    pub earnings: Option<f64>,
    /// Last running segment, absent if the timer was paused when stopped
    pub segment: Option<WorkSegment>,
}

/// Тип элемента очереди; порядок = приоритет при синхронизации
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    TimeLog = 0,
    Activity = 1,
    Evidence = 2,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::TimeLog => "time_log",
            QueueKind::Activity => "activity",
            QueueKind::Evidence => "evidence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time_log" => Some(QueueKind::TimeLog),
            "activity" => Some(QueueKind::Activity),
            "evidence" => Some(QueueKind::Evidence),
            _ => None,
        }
    }

    pub fn namespace(&self) -> QueueNamespace {
        match self {
            QueueKind::TimeLog | QueueKind::Activity => QueueNamespace::Records,
            QueueKind::Evidence => QueueNamespace::Evidence,
        }
    }
}

/// Records and evidence blobs are capped and drained independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueNamespace {
    Records,
    Evidence,
}

impl QueueNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueNamespace::Records => "records",
            QueueNamespace::Evidence => "evidence",
        }
    }
}

/// Элемент локальной очереди (payload уже расшифрован)
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub kind: QueueKind,
    pub payload: String,
    pub retries: u32,
    pub created_at: u64,
    pub idempotency_key: String,
}

/// Статистика очереди синхронизации
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub records_pending: usize,
    pub evidence_pending: usize,
    pub parked_count: usize,
    pub pending_by_kind: HashMap<String, usize>,
}

/// Информация о припаркованном (failed) элементе
#[derive(Debug, Clone, Serialize)]
pub struct FailedItemInfo {
    pub id: i64,
    pub kind: String,
    pub retries: u32,
    pub created_at: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    TimeLog,
    Evidence,
    Activity,
}

/// История для UI: серверные записи плюс локальные, ещё не синхронизированные
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: u64,
    pub kind: HistoryKind,
    pub task_id: String,
    pub sub_task_id: String,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub synced: bool,
}
