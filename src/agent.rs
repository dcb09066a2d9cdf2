//! SyncEngine: owns every component and the background loops that drive them.
//! Нет глобальных синглтонов: health, breaker и очередь живут здесь и передаются по Arc.

use crate::api::RemoteApi;
use crate::auth::AuthManager;
use crate::breaker::UploadBreaker;
use crate::bridge::HostBridge;
use crate::cache::Cache;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::database::Database;
use crate::engine::{StartOutcome, TimerEngine, TimerView};
use crate::error::{EngineError, EngineResult, StoreError, StoreResult};
use crate::evidence::EvidencePipeline;
use crate::health::ApiHealth;
use crate::ipc::{EngineEvent, EventBus};
use crate::models::{
    FailedItemInfo, HistoryEntry, HistoryKind, QueueKind, QueueStats, StoppedTimer, SubTaskInfo,
    TaskInfo, TaskSummary, WorkSegment,
};
use crate::network::{check_online_status, Connectivity};
use crate::queue::{new_idempotency_key, LocalQueue};
use crate::scheduler::{Scheduler, TickReport};
use crate::store::{CacheStore, QueueStore, TaskTimeStore};
use crate::sync::{DrainReport, SyncError, SyncOrchestrator};
use chrono::NaiveDate;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DB_FILE_NAME: &str = "hubnity.db";

/// Everything the engine needs from outside. Tests pass fakes; `SyncEngine::open` wires the
/// SQLite store and the real clock.
pub struct EngineParts {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub api: Arc<dyn RemoteApi>,
    pub bridge: Arc<dyn HostBridge>,
    pub queue_store: Arc<dyn QueueStore>,
    pub cache_store: Arc<dyn CacheStore>,
    pub time_store: Arc<dyn TaskTimeStore>,
    pub device_id: String,
    pub auth: Option<AuthManager>,
    pub initially_online: bool,
}

#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timers: Arc<TimerEngine>,
    pub(crate) queue: Arc<LocalQueue>,
    pub(crate) cache: Arc<Cache>,
    pub(crate) health: Arc<ApiHealth>,
    pub(crate) breaker: Arc<UploadBreaker>,
    pub(crate) events: EventBus,
    pub(crate) connectivity: Connectivity,
    pub(crate) orchestrator: Arc<SyncOrchestrator>,
    pub(crate) evidence: Arc<EvidencePipeline>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) auth: Option<AuthManager>,
    pub(crate) device_id: String,
}

/// Open the database; a corrupted file is moved aside once and a fresh one created.
fn open_database(data_dir: &Path) -> StoreResult<Database> {
    let db_path = data_dir.join(DB_FILE_NAME);
    match Database::new(&db_path) {
        Ok(db) => Ok(db),
        Err(StoreError::Corrupted(detail)) if db_path.exists() => {
            let backup_path = data_dir.join(format!(
                "{}.corrupted.{}",
                DB_FILE_NAME,
                chrono::Utc::now().timestamp()
            ));
            std::fs::rename(&db_path, &backup_path).map_err(|e| {
                StoreError::Corrupted(format!("{} (backup to {:?} failed: {})", detail, backup_path, e))
            })?;
            warn!(
                "[DB] Corrupted DB backed up to {:?}, starting fresh",
                backup_path
            );
            Database::new(&db_path)
        }
        Err(e) => Err(e),
    }
}

/// Start the recovery probe on every healthy → unhealthy transition.
/// Weak refs: health owns the hook, the hook must not own health.
fn install_probe_hook(
    health: &Arc<ApiHealth>,
    orchestrator: &Arc<SyncOrchestrator>,
    api: Arc<dyn RemoteApi>,
    interval: Duration,
) {
    let weak_health = Arc::downgrade(health);
    let weak_orchestrator = Arc::downgrade(orchestrator);
    health.set_on_unhealthy(Arc::new(move || {
        let Some(health) = weak_health.upgrade() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("[HEALTH] No async runtime, recovery probe not started");
            return;
        }
        let orchestrator = weak_orchestrator.clone();
        health.spawn_probe(Arc::clone(&api), interval, move || {
            let Some(orchestrator) = orchestrator.upgrade() else {
                return;
            };
            info!("[SYNC] Recovery probe succeeded, draining queue now");
            tokio::spawn(async move {
                if let Err(e) = orchestrator.drain().await {
                    error!("[SYNC] Drain after recovery failed: {}", e);
                }
            });
        });
    }));
}

impl SyncEngine {
    pub fn new(parts: EngineParts) -> Self {
        let config = Arc::new(parts.config);
        let clock = parts.clock;
        let api = parts.api;
        let bridge = parts.bridge;
        let events = EventBus::default();
        let connectivity = Connectivity::new(parts.initially_online);

        let health = Arc::new(ApiHealth::new(
            Arc::clone(&clock),
            config.health_failure_threshold,
            config.health_stale_after_secs,
            events.clone(),
        ));
        let breaker = Arc::new(UploadBreaker::new(
            Arc::clone(&clock),
            config.breaker_failure_threshold,
            config.breaker_cooldown_secs,
        ));
        let queue = Arc::new(LocalQueue::new(
            parts.queue_store,
            Arc::clone(&clock),
            events.clone(),
            &config,
        ));
        let cache = Arc::new(Cache::new(
            parts.cache_store,
            Arc::clone(&api),
            Arc::clone(&health),
            Arc::clone(&clock),
            events.clone(),
        ));
        let timers = Arc::new(TimerEngine::new(
            parts.time_store,
            Arc::clone(&clock),
            Arc::clone(&bridge),
            events.clone(),
            config.default_screenshot_interval_secs,
        ));
        let evidence = Arc::new(EvidencePipeline::new(
            Arc::clone(&bridge),
            Arc::clone(&api),
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&health),
            Arc::clone(&breaker),
            connectivity.clone(),
            events.clone(),
            Arc::clone(&clock),
            parts.device_id.clone(),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&queue),
            Arc::clone(&api),
            Arc::clone(&health),
            Arc::clone(&breaker),
            Arc::clone(&cache),
            connectivity.clone(),
            events.clone(),
            config.sync_batch_size,
        ));
        let scheduler = Arc::new(Scheduler::new(
            &config,
            Arc::clone(&timers),
            Arc::clone(&evidence),
            Arc::clone(&orchestrator),
            Arc::clone(&queue),
            Arc::clone(&api),
            Arc::clone(&health),
            bridge,
            connectivity.clone(),
            Arc::clone(&clock),
            events.clone(),
        ));

        install_probe_hook(
            &health,
            &orchestrator,
            api,
            Duration::from_secs(config.probe_interval_secs),
        );

        Self {
            config,
            clock,
            timers,
            queue,
            cache,
            health,
            breaker,
            events,
            connectivity,
            orchestrator,
            evidence,
            scheduler,
            auth: parts.auth,
            device_id: parts.device_id,
        }
    }

    /// Production wiring: SQLite store under the data dir, system clock.
    pub fn open(
        config: EngineConfig,
        api: Arc<dyn RemoteApi>,
        bridge: Arc<dyn HostBridge>,
        auth: Option<AuthManager>,
    ) -> EngineResult<Self> {
        let data_dir = config.resolve_data_dir();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            let msg = match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    "Permission denied. Check data directory is writable."
                }
                _ => "Failed to create data directory.",
            };
            EngineError::Internal(format!("{} Path: {} ({})", msg, data_dir.display(), e))
        })?;

        let db = Arc::new(open_database(&data_dir)?);
        let device_id = db.device_id(bridge.stable_device_id())?;
        info!(
            "[SYNC] Engine opened: data dir {}, device {}",
            data_dir.display(),
            device_id
        );

        Ok(Self::new(EngineParts {
            config,
            clock: Arc::new(SystemClock),
            api,
            bridge,
            queue_store: db.clone(),
            cache_store: db.clone(),
            time_store: db,
            device_id,
            auth,
            initially_online: true,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.healthy()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Uploads are routed to the queue until this time, if the breaker is open.
    pub fn uploads_paused_until(&self) -> Option<u64> {
        self.breaker
            .cooldown_until()
            .filter(|_| self.breaker.in_cooldown())
    }

    pub fn is_capturing(&self) -> bool {
        self.evidence.is_busy()
    }

    // ---- timers ----

    pub fn start_timer(&self, task: &TaskInfo, sub_task: &SubTaskInfo) -> EngineResult<StartOutcome> {
        self.timers.start(task, sub_task)
    }

    /// Pause and queue the closed segment. `false` if absent or already paused.
    pub fn pause_timer(&self, sub_task_id: &str) -> EngineResult<bool> {
        match self.timers.pause(sub_task_id)? {
            Some(segment) => {
                if self.record_segment(&segment) {
                    self.request_drain();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn resume_timer(&self, sub_task_id: &str) -> EngineResult<bool> {
        self.timers.resume(sub_task_id)
    }

    pub fn stop_timer(&self, sub_task_id: &str) -> EngineResult<Option<StoppedTimer>> {
        let stopped = self.timers.stop(sub_task_id)?;
        if let Some(segment) = stopped.as_ref().and_then(|s| s.segment.as_ref()) {
            if self.record_segment(segment) {
                self.request_drain();
            }
        }
        Ok(stopped)
    }

    pub fn stop_all(&self) -> EngineResult<Vec<StoppedTimer>> {
        let stopped = self.timers.stop_all()?;
        let mut queued = false;
        for segment in stopped.iter().filter_map(|s| s.segment.as_ref()) {
            queued |= self.record_segment(segment);
        }
        if queued {
            self.request_drain();
        }
        Ok(stopped)
    }

    pub fn snapshot(&self) -> EngineResult<Vec<TimerView>> {
        self.timers.snapshot()
    }

    pub fn elapsed(&self, sub_task_id: &str) -> Option<u64> {
        self.timers.elapsed(sub_task_id)
    }

    /// Queue a time-log for the segment and show it in history as unsynced.
    /// The timer transition is already committed, so failures here are logged, not returned.
    fn record_segment(&self, segment: &WorkSegment) -> bool {
        if segment.duration_seconds == 0 {
            return false;
        }
        let payload = match serde_json::to_string(segment) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[TIMER] Failed to serialize segment: {}", e);
                return false;
            }
        };
        let key = new_idempotency_key(QueueKind::TimeLog);
        if let Err(e) = self.queue.enqueue_keyed(QueueKind::TimeLog, &payload, &key) {
            error!("[TIMER] Failed to queue time-log: {}", e.user_message());
            return false;
        }
        let entry = HistoryEntry {
            id: key,
            timestamp: segment.ended_at,
            kind: HistoryKind::TimeLog,
            task_id: segment.task_id.clone(),
            sub_task_id: segment.sub_task_id.clone(),
            duration_seconds: Some(segment.duration_seconds),
            synced: false,
        };
        if let Err(e) = self.cache.record_local(&entry) {
            error!("[TIMER] Failed to record history entry: {}", e);
        }
        true
    }

    // ---- scheduler ----

    /// One scheduler step. `run` calls this every `tick_interval_ms`; tests call it directly.
    pub fn tick(&self) -> TickReport {
        self.scheduler.tick()
    }

    // ---- sync ----

    /// Background drain if online. `None` when offline or outside a runtime.
    pub fn request_drain(&self) -> Option<JoinHandle<Result<DrainReport, SyncError>>> {
        if !self.connectivity.is_online() {
            debug!("[SYNC] Offline, drain deferred");
            return None;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return None;
        }
        let orchestrator = Arc::clone(&self.orchestrator);
        Some(tokio::spawn(async move {
            let result = orchestrator.drain().await;
            if let Err(e) = &result {
                error!("[SYNC] Drain failed: {}", e);
            }
            result
        }))
    }

    pub async fn drain_now(&self) -> Result<DrainReport, SyncError> {
        self.orchestrator.drain().await
    }

    /// Host or background check reports connectivity. Restoring it starts a drain.
    pub fn set_online(&self, online: bool) -> Option<JoinHandle<Result<DrainReport, SyncError>>> {
        if self.connectivity.set_online(online) {
            info!("[SYNC] Connection restored, draining queue");
            return self.request_drain();
        }
        if !online {
            debug!("[SYNC] Connection reported offline");
        }
        None
    }

    pub fn queue_stats(&self) -> StoreResult<QueueStats> {
        self.queue.stats()
    }

    pub fn parked_items(&self, limit: usize) -> StoreResult<Vec<FailedItemInfo>> {
        self.queue.parked(limit)
    }

    /// Return parked items to the queue and try them again.
    pub fn retry_parked(&self) -> StoreResult<usize> {
        let count = self.queue.retry_parked()?;
        if count > 0 {
            self.request_drain();
        }
        Ok(count)
    }

    // ---- cache ----

    pub fn fetch_tasks(&self) -> (Option<Vec<TaskSummary>>, JoinHandle<()>) {
        self.cache.fetch_tasks()
    }

    /// Fresh task list, or the cached one when the remote cannot be reached.
    pub async fn load_tasks(&self) -> Vec<TaskSummary> {
        match self.cache.refresh_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("[CACHE] Task refresh failed ({}), using cached list", e);
                self.cache.tasks_snapshot().ok().flatten().unwrap_or_default()
            }
        }
    }

    pub fn fetch_history(&self, date: NaiveDate) -> (Vec<HistoryEntry>, JoinHandle<()>) {
        self.cache.fetch_history(date)
    }

    // ---- session ----

    /// Stop everything, forget cached server data and tokens. The queue is kept: it belongs to
    /// the device, not the session.
    pub async fn logout(&self) -> EngineResult<Vec<StoppedTimer>> {
        let stopped = self.stop_all()?;
        self.cache.clear()?;
        if let Some(auth) = &self.auth {
            auth.clear().await;
        }
        info!("[SYNC] Logged out, {} timer(s) stopped", stopped.len());
        Ok(stopped)
    }

    // ---- loops ----

    /// Drive the tick, the periodic drain and the online check until `shutdown` resolves.
    /// The tick never waits on network work: everything slow is spawned.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        // First tick on a wall-clock second boundary
        if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
            let delay_ms = 1000 - (now.as_millis() % 1000) as u64;
            if delay_ms < 1000 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // 1-3s jitter before the first periodic drain
        let jitter_ms = rand::random::<u64>() % 2000 + 1000;
        let sync_period = Duration::from_secs(self.config.sync_interval_secs);
        let mut sync = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_millis(jitter_ms),
            sync_period,
        );
        sync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut online_check =
            tokio::time::interval(Duration::from_secs(self.config.online_check_interval_secs.max(1)));
        online_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let probe_url = format!("{}/health", self.config.api_base_url.trim_end_matches('/'));
        info!("[SYNC] Engine loops started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    self.scheduler.tick();
                }
                _ = sync.tick() => {
                    debug!("[SYNC] Periodic drain");
                    self.request_drain();
                }
                _ = online_check.tick() => {
                    let engine = self.clone();
                    let url = probe_url.clone();
                    tokio::spawn(async move {
                        let online = check_online_status(Some(&url)).await;
                        engine.set_online(online);
                    });
                }
            }
        }
        info!("[SYNC] Engine loops stopped");
    }

    /// Current time on the engine clock.
    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }
}
