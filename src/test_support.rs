//! Scripted doubles for the remote API and the host bridge.

use crate::agent::{EngineParts, SyncEngine};
use crate::api::{EvidenceOutcome, EvidencePayload, Heartbeat, HeartbeatReply, RemoteApi, SyncRecord};
use crate::bridge::{HostBridge, TrackingContext};
use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::database::Database;
use crate::error::{ApiError, BridgeError};
use crate::evidence::CaptureReport;
use crate::ipc::EngineEvent;
use crate::models::{ActivityCounters, HistoryEntry, SubTaskInfo, TaskInfo, TaskSummary};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const T0: u64 = 1_700_000_000;

pub fn transport_error() -> ApiError {
    ApiError::Transport("connection refused".to_string())
}

/// Remote API double. Scripted replies are consumed in order; once a script runs dry the call
/// succeeds. `down` fails every call at transport level.
#[derive(Default)]
pub struct FakeApi {
    pub down: AtomicBool,
    pub heartbeat_replies: Mutex<VecDeque<Result<HeartbeatReply, ApiError>>>,
    pub evidence_replies: Mutex<VecDeque<Result<EvidenceOutcome, ApiError>>>,
    pub batch_replies: Mutex<VecDeque<Result<Vec<bool>, ApiError>>>,
    pub ping_replies: Mutex<VecDeque<Result<(), ApiError>>>,
    pub tasks: Mutex<Vec<TaskSummary>>,
    pub history: Mutex<Vec<HistoryEntry>>,

    pub heartbeats: Mutex<Vec<Heartbeat>>,
    pub uploads: Mutex<Vec<EvidencePayload>>,
    pub batches: Mutex<Vec<Vec<SyncRecord>>>,
    pub upload_attempts: AtomicUsize,
    pub pings: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    pub fn script_batch(&self, reply: Result<Vec<bool>, ApiError>) {
        self.batch_replies.lock().unwrap().push_back(reply);
    }

    pub fn script_evidence(&self, reply: Result<EvidenceOutcome, ApiError>) {
        self.evidence_replies.lock().unwrap().push_back(reply);
    }

    pub fn script_heartbeat(&self, reply: Result<HeartbeatReply, ApiError>) {
        self.heartbeat_replies.lock().unwrap().push_back(reply);
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReply, ApiError> {
        self.heartbeats.lock().unwrap().push(heartbeat.clone());
        if self.is_down() {
            return Err(transport_error());
        }
        self.heartbeat_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HeartbeatReply::default()))
    }

    async fn upload_evidence(&self, evidence: &EvidencePayload) -> Result<EvidenceOutcome, ApiError> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        if self.is_down() {
            return Err(transport_error());
        }
        let reply = self
            .evidence_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(EvidenceOutcome::Success));
        if matches!(reply, Ok(EvidenceOutcome::Success)) {
            self.uploads.lock().unwrap().push(evidence.clone());
        }
        reply
    }

    async fn sync_batch(&self, items: &[SyncRecord]) -> Result<Vec<bool>, ApiError> {
        if self.is_down() {
            return Err(transport_error());
        }
        self.batches.lock().unwrap().push(items.to_vec());
        self.batch_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![true; items.len()]))
    }

    async fn ping(&self) -> Result<(), ApiError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.is_down() {
            return Err(transport_error());
        }
        self.ping_replies.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn fetch_tasks(&self) -> Result<Vec<TaskSummary>, ApiError> {
        if self.is_down() {
            return Err(transport_error());
        }
        Ok(self.tasks.lock().unwrap().clone())
    }

    async fn fetch_history(&self, _date: NaiveDate) -> Result<Vec<HistoryEntry>, ApiError> {
        if self.is_down() {
            return Err(transport_error());
        }
        Ok(self.history.lock().unwrap().clone())
    }
}

/// Host bridge double with a fixed frame and settable counters.
pub struct FakeBridge {
    pub counters: Mutex<ActivityCounters>,
    /// `None` makes capture fail as unavailable
    pub frame: Mutex<Option<Vec<u8>>>,
    pub capture_delay: Mutex<Option<Duration>>,
    pub app_name: Mutex<Option<String>>,
    pub captures: AtomicUsize,
    pub resets: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub last_tick_total: AtomicU64,
    pub ticks: AtomicUsize,
}

impl FakeBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(ActivityCounters {
                key_count: 10,
                pointer_count: 20,
            }),
            frame: Mutex::new(Some(vec![0xFF, 0xD8, 0xFF])),
            capture_delay: Mutex::new(None),
            app_name: Mutex::new(Some("Editor".to_string())),
            captures: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            last_tick_total: AtomicU64::new(0),
            ticks: AtomicUsize::new(0),
        })
    }

    pub fn set_idle(&self) {
        *self.counters.lock().unwrap() = ActivityCounters::default();
    }
}

impl HostBridge for FakeBridge {
    fn capture_frame(&self) -> Result<Vec<u8>, BridgeError> {
        if let Some(delay) = *self.capture_delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.frame
            .lock()
            .unwrap()
            .clone()
            .ok_or(BridgeError::CaptureUnavailable)
    }

    fn activity_counters(&self) -> ActivityCounters {
        *self.counters.lock().unwrap()
    }

    fn reset_activity_counters(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        *self.counters.lock().unwrap() = ActivityCounters::default();
    }

    fn stable_device_id(&self) -> Option<String> {
        Some("dev-test".to_string())
    }

    fn notify_tracking_started(&self, _context: &TrackingContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_tracking_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_tick(&self, total_seconds: u64) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.last_tick_total.store(total_seconds, Ordering::SeqCst);
    }

    fn active_app_name(&self) -> Option<String> {
        self.app_name.lock().unwrap().clone()
    }
}

pub fn create_test_db() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Arc::new(Database::new(&db_path).unwrap());
    (db, temp_dir)
}

/// Defaults, except health never goes stale on its own while tests move the clock by hours.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        health_stale_after_secs: 10_000_000,
        probe_interval_secs: 1,
        ..Default::default()
    }
}

pub fn task(id: &str) -> TaskInfo {
    TaskInfo {
        id: id.to_string(),
        title: format!("Task {}", id),
        is_active: true,
    }
}

pub fn sub_task(id: &str) -> SubTaskInfo {
    SubTaskInfo {
        id: id.to_string(),
        title: format!("Sub-task {}", id),
        tracked_seconds: 0,
        hourly_rate: None,
        screenshot_interval_secs: None,
        monitoring_mode: Default::default(),
        screenshot_enabled: true,
        activity_enabled: true,
        schedule: None,
    }
}

/// A full engine over a temp SQLite store, the fakes and a manual clock.
pub struct Harness {
    pub engine: SyncEngine,
    pub api: Arc<FakeApi>,
    pub bridge: Arc<FakeBridge>,
    pub clock: Arc<ManualClock>,
    pub db: Arc<Database>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(config: EngineConfig, online: bool) -> Self {
        let (db, dir) = create_test_db();
        let api = FakeApi::new();
        let bridge = FakeBridge::new();
        let clock = Arc::new(ManualClock::new(T0));
        let engine = SyncEngine::new(EngineParts {
            config,
            clock: clock.clone(),
            api: api.clone(),
            bridge: bridge.clone(),
            queue_store: db.clone(),
            cache_store: db.clone(),
            time_store: db.clone(),
            device_id: "dev-test".to_string(),
            auth: None,
            initially_online: online,
        });
        Self {
            engine,
            api,
            bridge,
            clock,
            db,
            _dir: dir,
        }
    }

    /// Advance the clock one second and tick, `n` times, awaiting whatever each tick spawned.
    pub async fn tick_and_settle(&self, n: u64) -> Vec<CaptureReport> {
        let mut captures = Vec::new();
        for _ in 0..n {
            self.clock.advance(1);
            let report = self.engine.tick();
            if let Some(heartbeat) = report.heartbeat {
                heartbeat.await.unwrap();
            }
            if let Some(drain) = report.drain {
                drain.await.unwrap().unwrap();
            }
            if let Some(capture) = report.capture {
                captures.push(capture.await.unwrap());
            }
        }
        captures
    }
}

/// Everything currently buffered on the receiver; lag is skipped.
pub fn collect_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
