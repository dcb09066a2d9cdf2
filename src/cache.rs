//! Read-through cache for the task list and per-date history.
//! Callers get whatever is cached right away; refreshes run in the background and
//! announce themselves with `EngineEvent::DataChanged`.

use crate::api::RemoteApi;
use crate::error::{ApiError, StoreResult};
use crate::health::ApiHealth;
use crate::ipc::{EngineEvent, EventBus};
use crate::models::{HistoryEntry, TaskSummary};
use crate::clock::Clock;
use crate::store::CacheStore;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const TASKS_SCOPE: &str = "tasks";

pub fn history_scope(date: NaiveDate) -> String {
    format!("history:{}", date.format("%Y-%m-%d"))
}

fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// UTC calendar day of a Unix timestamp.
pub fn date_of(timestamp: u64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
        .unwrap_or_default()
        .date_naive()
}

/// Объединить серверные записи с локальными несинхронизированными.
/// Local entries colliding with an incoming one on (id, timestamp) are dropped; the result is
/// sorted newest first.
pub fn merge_history(incoming: Vec<HistoryEntry>, local: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let seen: HashSet<(String, u64)> = incoming
        .iter()
        .map(|e| (e.id.clone(), e.timestamp))
        .collect();
    let mut merged = incoming;
    merged.extend(
        local
            .into_iter()
            .filter(|e| !seen.contains(&(e.id.clone(), e.timestamp))),
    );
    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    merged
}

pub struct Cache {
    store: Arc<dyn CacheStore>,
    api: Arc<dyn RemoteApi>,
    health: Arc<ApiHealth>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Cache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        api: Arc<dyn RemoteApi>,
        health: Arc<ApiHealth>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            api,
            health,
            clock,
            events,
        }
    }

    pub fn tasks_snapshot(&self) -> StoreResult<Option<Vec<TaskSummary>>> {
        match self.store.get_snapshot(TASKS_SCOPE)? {
            Some(snapshot) => Ok(Some(serde_json::from_str(&snapshot.payload)?)),
            None => Ok(None),
        }
    }

    /// Cached list immediately plus a handle to the background refresh.
    pub fn fetch_tasks(self: &Arc<Self>) -> (Option<Vec<TaskSummary>>, JoinHandle<()>) {
        let cached = self.tasks_snapshot().unwrap_or_else(|e| {
            error!("[CACHE] Failed to read task snapshot: {}", e);
            None
        });
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = cache.refresh_tasks().await {
                debug!("[CACHE] Task refresh failed: {}", e);
            }
        });
        (cached, handle)
    }

    /// Fetch from the remote and overwrite the snapshot wholesale.
    pub async fn refresh_tasks(&self) -> Result<Vec<TaskSummary>, ApiError> {
        let tasks = match self.api.fetch_tasks().await {
            Ok(tasks) => {
                self.health.record_success();
                tasks
            }
            Err(e) => {
                self.health.record_failure();
                return Err(e);
            }
        };
        match serde_json::to_string(&tasks) {
            Ok(payload) => {
                if let Err(e) = self
                    .store
                    .put_snapshot(TASKS_SCOPE, &payload, self.clock.now_secs())
                {
                    error!("[CACHE] Failed to store task snapshot: {}", e);
                }
            }
            Err(e) => error!("[CACHE] Failed to serialize tasks: {}", e),
        }
        self.events.emit(EngineEvent::DataChanged {
            scope: TASKS_SCOPE.to_string(),
        });
        Ok(tasks)
    }

    /// Server snapshot for `date` merged with locally recorded entries.
    pub fn history(&self, date: NaiveDate) -> StoreResult<Vec<HistoryEntry>> {
        let server: Vec<HistoryEntry> = match self.store.get_snapshot(&history_scope(date))? {
            Some(snapshot) => serde_json::from_str(&snapshot.payload)?,
            None => Vec::new(),
        };
        let local = self.store.local_entries(&day_key(date))?;
        Ok(merge_history(server, local))
    }

    pub fn fetch_history(self: &Arc<Self>, date: NaiveDate) -> (Vec<HistoryEntry>, JoinHandle<()>) {
        let cached = self.history(date).unwrap_or_else(|e| {
            error!("[CACHE] Failed to read history for {}: {}", date, e);
            Vec::new()
        });
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = cache.refresh_history(date).await {
                debug!("[CACHE] History refresh for {} failed: {}", date, e);
            }
        });
        (cached, handle)
    }

    /// Replace the server snapshot for `date`; local unsynced entries survive the refresh.
    pub async fn refresh_history(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, ApiError> {
        let incoming = match self.api.fetch_history(date).await {
            Ok(entries) => {
                self.health.record_success();
                entries
            }
            Err(e) => {
                self.health.record_failure();
                return Err(e);
            }
        };

        let day = day_key(date);
        if let Err(e) = self.store.remove_local_synced(&day) {
            warn!("[CACHE] Failed to prune synced local entries: {}", e);
        }
        match serde_json::to_string(&incoming) {
            Ok(payload) => {
                if let Err(e) =
                    self.store
                        .put_snapshot(&history_scope(date), &payload, self.clock.now_secs())
                {
                    error!("[CACHE] Failed to store history snapshot: {}", e);
                }
            }
            Err(e) => error!("[CACHE] Failed to serialize history: {}", e),
        }

        let local = self.store.local_entries(&day).unwrap_or_else(|e| {
            error!("[CACHE] Failed to read local history: {}", e);
            Vec::new()
        });
        self.events.emit(EngineEvent::DataChanged {
            scope: history_scope(date),
        });
        Ok(merge_history(incoming, local))
    }

    /// Record an entry produced on this machine (synced or not).
    pub fn record_local(&self, entry: &HistoryEntry) -> StoreResult<()> {
        self.store
            .upsert_local_entry(&day_key(date_of(entry.timestamp)), entry)
    }

    pub fn mark_synced(&self, id: &str) -> StoreResult<bool> {
        self.store.mark_local_synced(id)
    }

    pub fn clear(&self) -> StoreResult<()> {
        self.store.clear_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryKind;

    fn entry(id: &str, ts: u64, synced: bool) -> HistoryEntry {
        HistoryEntry {
            id: id.into(),
            timestamp: ts,
            kind: HistoryKind::TimeLog,
            task_id: "t".into(),
            sub_task_id: "s".into(),
            duration_seconds: Some(60),
            synced,
        }
    }

    #[test]
    fn test_merge_keeps_non_colliding_local_and_sorts_newest_first() {
        let incoming = vec![entry("a", 100, true), entry("b", 300, true)];
        let local = vec![entry("a", 100, false), entry("c", 200, false)];
        let merged = merge_history(incoming, local);
        let ids: Vec<_> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(merged[2].synced);
    }

    #[test]
    fn test_same_id_different_timestamp_is_not_a_collision() {
        let merged = merge_history(vec![entry("a", 100, true)], vec![entry("a", 101, false)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_date_of_and_scope() {
        let d = date_of(86_400 * 2 + 5);
        assert_eq!(history_scope(d), "history:1970-01-03");
    }
}
