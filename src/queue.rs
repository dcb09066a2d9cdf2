//! Local Durable Queue: capped FIFO with retry accounting.

use crate::clock::Clock;
use crate::config::{EngineConfig, ExhaustedPolicy};
use crate::error::StoreResult;
use crate::ipc::{EngineEvent, EventBus};
use crate::models::{FailedItemInfo, QueueItem, QueueKind, QueueNamespace, QueueStats};
use crate::store::QueueStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What `record_failure` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still pending, with the new retry count
    Retry(u32),
    Discarded,
    Parked,
}

pub struct LocalQueue {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    record_capacity: usize,
    evidence_capacity: usize,
    max_retries: u32,
    policy: ExhaustedPolicy,
}

/// Ключ идемпотентности: генерируется один раз при постановке в очередь и хранится с записью,
/// повторные отправки того же элемента несут тот же ключ.
pub fn new_idempotency_key(kind: QueueKind) -> String {
    format!("{}-{}", kind.as_str(), hex::encode(rand::random::<[u8; 12]>()))
}

impl LocalQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            record_capacity: config.record_queue_capacity,
            evidence_capacity: config.evidence_queue_capacity,
            max_retries: config.max_retries,
            policy: config.exhausted_policy,
        }
    }

    fn capacity(&self, namespace: QueueNamespace) -> usize {
        match namespace {
            QueueNamespace::Records => self.record_capacity,
            QueueNamespace::Evidence => self.evidence_capacity,
        }
    }

    /// Serialize and enqueue. Returns the new item id.
    pub fn enqueue<T: Serialize>(&self, kind: QueueKind, payload: &T) -> StoreResult<i64> {
        let payload = serde_json::to_string(payload)?;
        self.enqueue_raw(kind, &payload)
    }

    pub fn enqueue_raw(&self, kind: QueueKind, payload: &str) -> StoreResult<i64> {
        let key = new_idempotency_key(kind);
        self.enqueue_keyed(kind, payload, &key)
    }

    /// Enqueue with a caller-chosen idempotency key (also used as the history entry id).
    pub fn enqueue_keyed(&self, kind: QueueKind, payload: &str, key: &str) -> StoreResult<i64> {
        let namespace = kind.namespace();
        let inserted = self.store.insert_capped(
            kind,
            payload,
            key,
            self.clock.now_secs(),
            self.capacity(namespace),
        )?;
        if !inserted.evicted.is_empty() {
            warn!(
                "[QUEUE] {} queue full (cap {}), evicted {} oldest item(s): {:?}",
                namespace.as_str(),
                self.capacity(namespace),
                inserted.evicted.len(),
                inserted.evicted
            );
        }
        debug!("[QUEUE] Enqueued {} #{}", kind.as_str(), inserted.id);
        Ok(inserted.id)
    }

    /// Pending items, oldest first.
    pub fn pending(
        &self,
        namespace: QueueNamespace,
        limit: Option<usize>,
    ) -> StoreResult<Vec<QueueItem>> {
        self.store.pending(namespace, limit)
    }

    pub fn pending_after(
        &self,
        namespace: QueueNamespace,
        after_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<QueueItem>> {
        self.store.pending_after(namespace, after_id, Some(limit))
    }

    pub fn pending_count(&self, namespace: QueueNamespace) -> StoreResult<usize> {
        self.store.count_pending(namespace)
    }

    /// Remote confirmed the item.
    pub fn acknowledge(&self, id: i64) -> StoreResult<()> {
        self.store.delete(id)
    }

    /// Count one failed delivery attempt. At `max_retries` the exhausted policy applies.
    pub fn record_failure(&self, item: &QueueItem, error: &str) -> StoreResult<FailureOutcome> {
        let retries = item.retries.saturating_add(1);
        if retries < self.max_retries {
            self.store.set_retries(item.id, retries, Some(error))?;
            return Ok(FailureOutcome::Retry(retries));
        }

        match self.policy {
            ExhaustedPolicy::Discard | ExhaustedPolicy::Notify => {
                warn!(
                    "[QUEUE] Discarding {} #{} after {} failed attempts (last error: {})",
                    item.kind.as_str(),
                    item.id,
                    retries,
                    error
                );
                self.store.delete(item.id)?;
                if self.policy == ExhaustedPolicy::Notify {
                    self.events.emit(EngineEvent::ItemDiscarded {
                        id: item.id,
                        kind: item.kind.as_str().to_string(),
                    });
                }
                Ok(FailureOutcome::Discarded)
            }
            ExhaustedPolicy::Park => {
                warn!(
                    "[QUEUE] Parking {} #{} after {} failed attempts (last error: {})",
                    item.kind.as_str(),
                    item.id,
                    retries,
                    error
                );
                self.store.park(item.id, retries, Some(error))?;
                Ok(FailureOutcome::Parked)
            }
        }
    }

    pub fn parked(&self, limit: usize) -> StoreResult<Vec<FailedItemInfo>> {
        self.store.parked(limit)
    }

    /// Вернуть припаркованные элементы в очередь с нулевым счётчиком попыток
    pub fn retry_parked(&self) -> StoreResult<usize> {
        let count = self.store.unpark_all()?;
        if count > 0 {
            debug!("[QUEUE] {} parked item(s) returned to pending", count);
        }
        Ok(count)
    }

    pub fn stats(&self) -> StoreResult<QueueStats> {
        self.store.stats()
    }

    /// Safety valve for users; `None` clears both namespaces.
    pub fn clear(&self, namespace: Option<QueueNamespace>) -> StoreResult<()> {
        self.store.clear(namespace)
    }
}
