//! Sync Orchestrator: drains the local queue to the remote endpoint.

use crate::api::{EvidenceOutcome, EvidencePayload, RemoteApi, SyncRecord};
use crate::breaker::UploadBreaker;
use crate::cache::Cache;
pub use crate::error::SyncError;
use crate::health::ApiHealth;
use crate::ipc::{EngineEvent, EventBus};
use crate::models::{QueueItem, QueueNamespace};
use crate::network::Connectivity;
use crate::queue::LocalQueue;
use scopeguard::guard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a drain did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
    Unhealthy,
}

/// Итог одного прохода синхронизации
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub skipped: Option<SkipReason>,
    pub records_synced: usize,
    pub records_failed: usize,
    pub evidence_synced: usize,
    pub evidence_failed: usize,
    /// A transport failure ended the run early; remaining items stay queued
    pub stopped_on_transport: bool,
    pub quota_exceeded: bool,
}

impl DrainReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

pub struct SyncOrchestrator {
    queue: Arc<LocalQueue>,
    api: Arc<dyn RemoteApi>,
    health: Arc<ApiHealth>,
    breaker: Arc<UploadBreaker>,
    cache: Arc<Cache>,
    connectivity: Connectivity,
    events: EventBus,
    batch_size: usize,
    is_syncing: AtomicBool,
}

/// Time-logs before activity; enqueue order kept within each kind.
fn prioritize(mut items: Vec<QueueItem>) -> Vec<QueueItem> {
    items.sort_by_key(|item| item.kind);
    items
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<LocalQueue>,
        api: Arc<dyn RemoteApi>,
        health: Arc<ApiHealth>,
        breaker: Arc<UploadBreaker>,
        cache: Arc<Cache>,
        connectivity: Connectivity,
        events: EventBus,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            api,
            health,
            breaker,
            cache,
            connectivity,
            events,
            batch_size: batch_size.max(1),
            is_syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    /// Синхронизировать очередь
    /// Single-flight via AtomicBool; a second caller returns immediately.
    /// Panic guard: is_syncing is always reset via scopeguard, even on panic
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[SYNC] Another drain already in progress, skipping");
            return Ok(DrainReport::skipped(SkipReason::AlreadyRunning));
        }

        let _guard = guard((), |_| {
            self.is_syncing.store(false, Ordering::Release);
        });

        self.run_drain_internal().await
    }

    async fn run_drain_internal(&self) -> Result<DrainReport, SyncError> {
        if !self.connectivity.is_online() {
            debug!("[SYNC] Offline, skipping drain");
            return Ok(DrainReport::skipped(SkipReason::Offline));
        }
        if self.health.failing() {
            debug!("[SYNC] API unhealthy, skipping drain until probe recovers");
            self.health.ensure_probe();
            return Ok(DrainReport::skipped(SkipReason::Unhealthy));
        }
        if !self.health.healthy() {
            // Stale only: the drain's own calls refresh health
            debug!("[SYNC] No recent successful call, draining anyway");
        }

        let mut report = DrainReport::default();
        self.drain_records(&mut report).await?;
        if !report.stopped_on_transport {
            self.drain_evidence(&mut report).await?;
        }

        if report.records_synced + report.evidence_synced > 0 {
            self.events.emit(EngineEvent::DataChanged {
                scope: "history".to_string(),
            });
        }
        info!(
            "[SYNC] Drain completed: records {} ok / {} failed, evidence {} ok / {} failed{}",
            report.records_synced,
            report.records_failed,
            report.evidence_synced,
            report.evidence_failed,
            if report.stopped_on_transport {
                " (stopped on transport failure)"
            } else {
                ""
            }
        );
        // Still stale when the queue was empty
        self.health.ensure_probe();
        Ok(report)
    }

    /// Time-log/activity records in batches; results are read by position.
    async fn drain_records(&self, report: &mut DrainReport) -> Result<(), SyncError> {
        let items = prioritize(self.queue.pending(QueueNamespace::Records, None)?);
        if items.is_empty() {
            return Ok(());
        }
        info!(
            "[SYNC] {} pending record(s), batch size {}",
            items.len(),
            self.batch_size
        );

        for chunk in items.chunks(self.batch_size) {
            let mut batch: Vec<&QueueItem> = Vec::with_capacity(chunk.len());
            let mut records: Vec<SyncRecord> = Vec::with_capacity(chunk.len());
            for item in chunk {
                match serde_json::from_str::<serde_json::Value>(&item.payload) {
                    Ok(data) => {
                        batch.push(item);
                        records.push(SyncRecord {
                            kind: item.kind,
                            idempotency_key: item.idempotency_key.clone(),
                            data,
                        });
                    }
                    Err(e) => {
                        warn!("[SYNC] Item {} has unparseable payload: {}", item.id, e);
                        self.queue.record_failure(item, "unparseable payload")?;
                        report.records_failed += 1;
                    }
                }
            }
            if records.is_empty() {
                continue;
            }

            let results = match self.api.sync_batch(&records).await {
                Ok(results) => {
                    self.health.record_success();
                    results
                }
                Err(e) => {
                    warn!("[SYNC] Batch failed at transport level: {}. Stopping drain.", e);
                    self.health.record_failure();
                    report.stopped_on_transport = true;
                    return Ok(());
                }
            };
            if results.len() != batch.len() {
                warn!(
                    "[SYNC] Server answered {} results for {} items; missing ones count as failed",
                    results.len(),
                    batch.len()
                );
            }

            for (index, item) in batch.into_iter().enumerate() {
                if results.get(index).copied().unwrap_or(false) {
                    self.queue.acknowledge(item.id)?;
                    self.mark_history_synced(&item.idempotency_key);
                    report.records_synced += 1;
                } else {
                    self.queue.record_failure(item, "rejected by server")?;
                    report.records_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Evidence one by one, oldest first, paged so frames are not all loaded at once.
    async fn drain_evidence(&self, report: &mut DrainReport) -> Result<(), SyncError> {
        let mut cursor = 0;
        loop {
            let page = self
                .queue
                .pending_after(QueueNamespace::Evidence, cursor, self.batch_size)?;
            if page.is_empty() {
                return Ok(());
            }
            for item in page {
                cursor = item.id;
                if self.breaker.in_cooldown() {
                    debug!("[SYNC] Upload breaker open, leaving evidence queued");
                    return Ok(());
                }

                let payload: EvidencePayload = match serde_json::from_str(&item.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("[SYNC] Evidence {} has unparseable payload: {}", item.id, e);
                        self.queue.record_failure(&item, "unparseable payload")?;
                        report.evidence_failed += 1;
                        continue;
                    }
                };

                match self.api.upload_evidence(&payload).await {
                    Ok(EvidenceOutcome::Success) => {
                        self.breaker.record_success();
                        self.health.record_success();
                        self.queue.acknowledge(item.id)?;
                        self.mark_history_synced(&payload.capture_id);
                        report.evidence_synced += 1;
                    }
                    Ok(EvidenceOutcome::QuotaExceeded(message)) => {
                        warn!("[SYNC] Storage quota exceeded, stopping evidence drain");
                        self.events.emit(EngineEvent::QuotaExceeded { message });
                        report.quota_exceeded = true;
                        return Ok(());
                    }
                    Ok(EvidenceOutcome::Rejected { status, message }) => {
                        warn!("[SYNC] Evidence {} rejected ({}): {}", item.id, status, message);
                        self.queue.record_failure(&item, &message)?;
                        report.evidence_failed += 1;
                        self.breaker_failure();
                    }
                    Err(e) => {
                        warn!("[SYNC] Evidence upload failed: {}. Stopping drain.", e);
                        self.health.record_failure();
                        self.breaker_failure();
                        report.stopped_on_transport = true;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn breaker_failure(&self) {
        if let Some(until) = self.breaker.record_failure() {
            self.events.emit(EngineEvent::UploadsPaused { until });
        }
    }

    fn mark_history_synced(&self, id: &str) {
        if let Err(e) = self.cache.mark_synced(id) {
            error!("[SYNC] Failed to mark history entry {} synced: {}", id, e);
        }
    }
}
