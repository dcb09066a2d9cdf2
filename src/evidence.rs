//! Evidence capture pipeline: capture, decide destination, upload or queue.

use crate::api::{EvidenceOutcome, EvidencePayload, RemoteApi};
use crate::bridge::HostBridge;
use crate::breaker::UploadBreaker;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::error::BridgeError;
use crate::health::ApiHealth;
use crate::ipc::{EngineEvent, EventBus};
use crate::models::{HistoryEntry, HistoryKind, MonitoringMode, QueueKind, TimerRecord};
use crate::network::Connectivity;
use crate::queue::LocalQueue;
use scopeguard::guard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one capture batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub uploaded: usize,
    pub queued: usize,
    /// Frames the host could not produce
    pub capture_failures: usize,
    pub quota_exceeded: bool,
}

pub struct EvidencePipeline {
    pub(crate) bridge: Arc<dyn HostBridge>,
    pub(crate) api: Arc<dyn RemoteApi>,
    pub(crate) queue: Arc<LocalQueue>,
    pub(crate) cache: Arc<Cache>,
    pub(crate) health: Arc<ApiHealth>,
    pub(crate) breaker: Arc<UploadBreaker>,
    pub(crate) connectivity: Connectivity,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) device_id: String,
    /// Одна съёмка за раз: тик, заставший флаг занятым, просто пропускает
    busy: Arc<AtomicBool>,
}

impl EvidencePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<dyn HostBridge>,
        api: Arc<dyn RemoteApi>,
        queue: Arc<LocalQueue>,
        cache: Arc<Cache>,
        health: Arc<ApiHealth>,
        breaker: Arc<UploadBreaker>,
        connectivity: Connectivity,
        events: EventBus,
        clock: Arc<dyn Clock>,
        device_id: String,
    ) -> Self {
        Self {
            bridge,
            api,
            queue,
            cache,
            health,
            breaker,
            connectivity,
            events,
            clock,
            device_id,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run captures for `due` in the background. `None` when there is nothing to do or a
    /// batch is already in flight; the skipped timers are not re-queued.
    pub fn dispatch(self: &Arc<Self>, due: Vec<TimerRecord>) -> Option<JoinHandle<CaptureReport>> {
        if due.is_empty() {
            return None;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!(
                "[EVIDENCE] Capture already in progress, skipping {} due timer(s)",
                due.len()
            );
            return None;
        }

        let pipeline = Arc::clone(self);
        let busy = Arc::clone(&self.busy);
        Some(tokio::spawn(async move {
            // Panic guard: busy is always reset
            let _guard = guard((), move |_| {
                busy.store(false, Ordering::Release);
            });
            pipeline.run(due).await
        }))
    }

    /// Captures for the due timers, strictly one after another.
    pub(crate) async fn run(&self, due: Vec<TimerRecord>) -> CaptureReport {
        let mut report = CaptureReport::default();
        // Set once the breaker opens: the rest of this batch goes straight to the queue
        let mut force_queue = false;

        for record in due {
            let bridge = Arc::clone(&self.bridge);
            let frame = match tokio::task::spawn_blocking(move || bridge.capture_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(BridgeError::CaptureUnavailable)) => {
                    debug!("[EVIDENCE] Capture unavailable on this host, skipping {}", record.sub_task_id);
                    report.capture_failures += 1;
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("[EVIDENCE] Capture failed for {}: {}", record.sub_task_id, e);
                    report.capture_failures += 1;
                    continue;
                }
                Err(e) => {
                    error!("[EVIDENCE] Capture task panicked: {}", e);
                    report.capture_failures += 1;
                    continue;
                }
            };

            let counters = self.bridge.activity_counters();
            if counters.is_idle() && record.monitoring_mode == MonitoringMode::Transparent {
                info!("[EVIDENCE] No input activity for {}", record.sub_task_id);
                self.events.emit(EngineEvent::InactivityWarning {
                    sub_task_id: record.sub_task_id.clone(),
                });
            }

            let captured_at = self.clock.now_secs();
            let payload = EvidencePayload {
                capture_id: format!(
                    "ev-{}-{}-{}",
                    record.sub_task_id,
                    captured_at,
                    hex::encode(rand::random::<[u8; 4]>())
                ),
                task_id: record.task_id.clone(),
                sub_task_id: record.sub_task_id.clone(),
                frame,
                counters,
                captured_at,
                device_id: self.device_id.clone(),
            };

            let go_offline = force_queue
                || !self.connectivity.is_online()
                || self.breaker.in_cooldown()
                || !self.health.healthy();
            if go_offline {
                self.queue_locally(&payload);
                report.queued += 1;
                continue;
            }

            match self.api.upload_evidence(&payload).await {
                Ok(EvidenceOutcome::Success) => {
                    self.breaker.record_success();
                    self.health.record_success();
                    self.record_history(&payload, true);
                    self.events.emit(EngineEvent::DataChanged {
                        scope: "history".to_string(),
                    });
                    report.uploaded += 1;
                }
                Ok(EvidenceOutcome::QuotaExceeded(message)) => {
                    warn!("[EVIDENCE] Storage quota exceeded, stopping capture batch");
                    self.events.emit(EngineEvent::QuotaExceeded { message });
                    report.quota_exceeded = true;
                    break;
                }
                Ok(EvidenceOutcome::Rejected { status, message }) => {
                    warn!("[EVIDENCE] Upload rejected ({}): {}", status, message);
                    force_queue |= self.upload_failed();
                    self.queue_locally(&payload);
                    report.queued += 1;
                }
                Err(e) => {
                    warn!("[EVIDENCE] Upload failed: {}", e);
                    force_queue |= self.upload_failed();
                    self.queue_locally(&payload);
                    report.queued += 1;
                }
            }
        }

        debug!("[EVIDENCE] Batch done: {:?}", report);
        report
    }

    /// Count a failed upload on both trackers. True when the breaker just opened.
    fn upload_failed(&self) -> bool {
        self.health.record_failure();
        match self.breaker.record_failure() {
            Some(until) => {
                self.events.emit(EngineEvent::UploadsPaused { until });
                true
            }
            None => false,
        }
    }

    /// Never drop a capture here: it goes to the queue and shows up as unsynced.
    fn queue_locally(&self, payload: &EvidencePayload) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                if let Err(e) =
                    self.queue
                        .enqueue_keyed(QueueKind::Evidence, &json, &payload.capture_id)
                {
                    error!("[EVIDENCE] Failed to queue capture: {}", e.user_message());
                    return;
                }
            }
            Err(e) => {
                error!("[EVIDENCE] Failed to serialize capture: {}", e);
                return;
            }
        }
        self.record_history(payload, false);
    }

    fn record_history(&self, payload: &EvidencePayload, synced: bool) {
        let entry = HistoryEntry {
            id: payload.capture_id.clone(),
            timestamp: payload.captured_at,
            kind: HistoryKind::Evidence,
            task_id: payload.task_id.clone(),
            sub_task_id: payload.sub_task_id.clone(),
            duration_seconds: None,
            synced,
        };
        if let Err(e) = self.cache.record_local(&entry) {
            error!("[EVIDENCE] Failed to record history entry: {}", e);
        }
    }
}
