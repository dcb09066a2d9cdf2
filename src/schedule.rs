//! Schedule-based start permission for sub-tasks.

use crate::error::StartRejection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Окно расписания sub-task. Все границы в Unix секундах.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskSchedule {
    #[serde(default)]
    pub starts_at: Option<u64>,
    #[serde(default)]
    pub ends_at: Option<u64>,
    /// Locked by a manager regardless of the window
    #[serde(default)]
    pub locked: bool,
    /// Whether tracking may continue to start after `ends_at`
    #[serde(default)]
    pub allow_overtime: bool,
}

impl SubTaskSchedule {
    /// Может ли sub-task стартовать в момент `now`.
    /// Order of checks: lock, not yet open, closed without overtime.
    pub fn check_start(&self, now: u64) -> Result<(), StartRejection> {
        if self.locked {
            return Err(StartRejection::Locked);
        }
        if let Some(starts_at) = self.starts_at {
            if now < starts_at {
                return Err(StartRejection::StartingSoon(starts_at - now));
            }
        }
        if let Some(ends_at) = self.ends_at {
            if now >= ends_at && !self.allow_overtime {
                return Err(StartRejection::EndedWithoutOvertime);
            }
        }
        Ok(())
    }

    /// Human-readable window for log lines.
    pub fn describe(&self) -> String {
        let fmt = |ts: Option<u64>| {
            ts.and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
                .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        format!(
            "{} .. {}{}{}",
            fmt(self.starts_at),
            fmt(self.ends_at),
            if self.allow_overtime { " (overtime)" } else { "" },
            if self.locked { " [locked]" } else { "" }
        )
    }
}
