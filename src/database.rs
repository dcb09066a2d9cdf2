use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::crypto::PayloadCipher;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    FailedItemInfo, HistoryEntry, QueueItem, QueueKind, QueueNamespace, QueueStats,
};
use crate::store::{CacheStore, CachedSnapshot, Inserted, QueueStore, TaskTimeStore};

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation; caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check app data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check app data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

const DEVICE_ID_KEY: &str = "device_id";

/// id, kind, encrypted payload, retries, created_at, idempotency key
type RawQueueRow = (i64, String, String, u32, i64, String);

/// Менеджер базы данных: очередь синхронизации, кэш, накопленное время по sub-task
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) cipher: Arc<PayloadCipher>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            StoreError::Poisoned(format!(
                "{}. A panic occurred while holding the lock. Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: Integrity check on startup, detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
                    StoreError::Corrupted(e.to_string())
                }
                _ => StoreError::Sqlite(e),
            })?;
        if integrity.to_lowercase() != "ok" {
            return Err(StoreError::Corrupted(integrity));
        }

        // WAL обеспечивает лучшую защиту от corruption
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                    e
                );
            })
            .ok();
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        let data_dir = db_path.parent().filter(|p| !p.as_os_str().is_empty());
        let cipher = PayloadCipher::new(data_dir).map_err(StoreError::Crypto)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher: Arc::new(cipher),
        };
        db.run_migrations()?;
        info!("[DB] Opened {}", db_path.display());
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    namespace TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    retries INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    error_message TEXT,
                    idempotency_key TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_sync_queue_ns_status
                    ON sync_queue(namespace, status, id);
                CREATE TABLE IF NOT EXISTS task_time (
                    sub_task_id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    tracked_seconds INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT);",
            )?;
        }

        // Migration 2: read-through cache + local history
        if current < 2 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cache (
                    scope TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    cached_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS local_history (
                    id TEXT PRIMARY KEY,
                    day TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_local_history_day ON local_history(day);",
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Получить значение из app_meta
    pub fn get_app_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Записать значение в app_meta
    pub fn set_app_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    /// Device id: host-provided if any, otherwise a random id generated once and kept in app_meta.
    pub fn device_id(&self, host_provided: Option<String>) -> StoreResult<String> {
        if let Some(id) = host_provided.filter(|id| !id.is_empty()) {
            self.set_app_meta(DEVICE_ID_KEY, &id)?;
            return Ok(id);
        }
        if let Some(id) = self.get_app_meta(DEVICE_ID_KEY)?.filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        let id = format!("dev-{}", hex::encode(rand::random::<[u8; 8]>()));
        self.set_app_meta(DEVICE_ID_KEY, &id)?;
        info!("[DB] Generated device id {}", id);
        Ok(id)
    }

    /// Raw pending rows after `after_id`, oldest first; `None` means no limit.
    fn pending_rows(
        &self,
        namespace: QueueNamespace,
        after_id: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<RawQueueRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, retries, created_at, idempotency_key FROM sync_queue
             WHERE namespace = ?1 AND status = 'pending' AND id > ?2
             ORDER BY id ASC LIMIT ?3",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![namespace.as_str(), after_id, limit], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?;
        let raw: Vec<RawQueueRow> = rows.collect::<Result<_, _>>()?;
        Ok(raw)
    }

    fn decrypt_row(&self, id: i64, encrypted: &str) -> Option<String> {
        match self.cipher.decrypt(encrypted) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(
                    "[DB] Parking item {}: decryption failed ({}). One broken item won't block the queue.",
                    id, e
                );
                None
            }
        }
    }
}

impl QueueStore for Database {
    /// CRITICAL: вытеснение и вставка в одной транзакции, лимит не превышается даже при гонке
    fn insert_capped(
        &self,
        kind: QueueKind,
        payload: &str,
        idempotency_key: &str,
        created_at: u64,
        capacity: usize,
    ) -> StoreResult<Inserted> {
        let encrypted = self.cipher.encrypt(payload).map_err(|e| {
            error!("[DB] Encryption failed for payload: {}", e);
            StoreError::Crypto(e)
        })?;
        let namespace = kind.namespace().as_str();

        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| {
                log_io_error_if_any("insert_capped begin", &e);
                e
            })?;

        let pending: usize = tx.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE namespace = ?1 AND status = 'pending'",
            params![namespace],
            |row| row.get::<_, i64>(0),
        )? as usize;

        let mut evicted = Vec::new();
        if pending >= capacity {
            let overflow = pending + 1 - capacity;
            {
                let mut stmt = tx.prepare(
                    "SELECT id FROM sync_queue WHERE namespace = ?1 AND status = 'pending'
                     ORDER BY id ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![namespace, overflow as i64], |row| row.get(0))?;
                for row in rows {
                    evicted.push(row?);
                }
            }
            for id in &evicted {
                tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
            }
        }

        tx.execute(
            "INSERT INTO sync_queue (namespace, kind, payload, status, retries, created_at, idempotency_key)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5)",
            params![namespace, kind.as_str(), encrypted, created_at as i64, idempotency_key],
        )
        .map_err(|e| {
            log_io_error_if_any("insert_capped", &e);
            e
        })?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(|e| {
            log_io_error_if_any("insert_capped commit", &e);
            e
        })?;
        Ok(Inserted { id, evicted })
    }

    /// Undecryptable rows and unknown kinds are parked as they are met, so they leave
    /// the pending set and never shorten a page.
    fn pending_after(
        &self,
        namespace: QueueNamespace,
        after_id: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<QueueItem>> {
        let mut items = Vec::new();
        let mut cursor = after_id;
        loop {
            let wanted = limit.map(|l| l.saturating_sub(items.len()));
            if wanted == Some(0) {
                break;
            }
            let raw_rows = self.pending_rows(namespace, cursor, wanted)?;
            let fetched = raw_rows.len();

            let mut broken = Vec::new();
            for (id, kind, encrypted, retries, created_at, idempotency_key) in raw_rows {
                cursor = id;
                let Some(kind) = QueueKind::parse(&kind) else {
                    warn!("[DB] Parking item {} with unknown kind {}", id, kind);
                    broken.push((id, retries, "unknown kind"));
                    continue;
                };
                match self.decrypt_row(id, &encrypted) {
                    Some(payload) => items.push(QueueItem {
                        id,
                        kind,
                        payload,
                        retries,
                        created_at: created_at.max(0) as u64,
                        idempotency_key,
                    }),
                    None => broken.push((id, retries, "undecryptable payload")),
                }
            }
            for (id, retries, reason) in broken {
                if let Err(e) = self.park(id, retries, Some(reason)) {
                    error!("[DB] Failed to park broken item {}: {}", id, e);
                }
            }

            // Short page: nothing left after the cursor
            match wanted {
                Some(wanted) if fetched == wanted => continue,
                _ => break,
            }
        }
        Ok(items)
    }

    fn count_pending(&self, namespace: QueueNamespace) -> StoreResult<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE namespace = ?1 AND status = 'pending'",
            params![namespace.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn delete(&self, id: i64) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn set_retries(&self, id: i64, retries: u32, error_message: Option<&str>) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_queue SET retries = ?1, error_message = COALESCE(?2, error_message) WHERE id = ?3",
            params![retries, error_message, id],
        )?;
        Ok(())
    }

    fn park(&self, id: i64, retries: u32, error_message: Option<&str>) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_queue SET status = 'failed', retries = ?1, error_message = ?2 WHERE id = ?3",
            params![retries, error_message, id],
        )?;
        Ok(())
    }

    fn parked(&self, limit: usize) -> StoreResult<Vec<FailedItemInfo>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, retries, created_at, error_message FROM sync_queue
             WHERE status = 'failed'
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FailedItemInfo {
                id: row.get(0)?,
                kind: row.get(1)?,
                retries: row.get(2)?,
                created_at: row.get::<_, i64>(3)?.max(0) as u64,
                error_message: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn unpark_all(&self) -> StoreResult<usize> {
        let conn = self.lock_conn()?;
        let count = conn.execute(
            "UPDATE sync_queue SET status = 'pending', retries = 0 WHERE status = 'failed'",
            [],
        )?;
        Ok(count)
    }

    fn stats(&self) -> StoreResult<QueueStats> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, kind, status, COUNT(*) FROM sync_queue GROUP BY namespace, kind, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? as usize,
            ))
        })?;

        let mut stats = QueueStats::default();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let (namespace, kind, status, count) = row?;
            if status == "failed" {
                stats.parked_count += count;
                continue;
            }
            if namespace == QueueNamespace::Evidence.as_str() {
                stats.evidence_pending += count;
            } else {
                stats.records_pending += count;
            }
            *by_kind.entry(kind).or_insert(0) += count;
        }
        stats.pending_by_kind = by_kind;
        Ok(stats)
    }

    fn clear(&self, namespace: Option<QueueNamespace>) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        match namespace {
            Some(ns) => conn.execute(
                "DELETE FROM sync_queue WHERE namespace = ?1",
                params![ns.as_str()],
            )?,
            None => conn.execute("DELETE FROM sync_queue", [])?,
        };
        Ok(())
    }
}

impl CacheStore for Database {
    fn get_snapshot(&self, scope: &str) -> StoreResult<Option<CachedSnapshot>> {
        let conn = self.lock_conn()?;
        let snapshot = conn
            .query_row(
                "SELECT payload, cached_at FROM cache WHERE scope = ?1",
                params![scope],
                |row| {
                    Ok(CachedSnapshot {
                        payload: row.get(0)?,
                        cached_at: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    fn put_snapshot(&self, scope: &str, payload: &str, cached_at: u64) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO cache (scope, payload, cached_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope) DO UPDATE SET payload = ?2, cached_at = ?3",
            params![scope, payload, cached_at as i64],
        )?;
        Ok(())
    }

    fn upsert_local_entry(&self, date: &str, entry: &HistoryEntry) -> StoreResult<()> {
        let payload = serde_json::to_string(entry)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO local_history (id, day, payload, synced) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET day = ?2, payload = ?3, synced = ?4",
            params![entry.id, date, payload, entry.synced],
        )?;
        Ok(())
    }

    fn local_entries(&self, date: &str) -> StoreResult<Vec<HistoryEntry>> {
        let rows: Vec<(String, bool)> = {
            let conn = self.lock_conn()?;
            let mut stmt =
                conn.prepare("SELECT payload, synced FROM local_history WHERE day = ?1")?;
            let rows = stmt.query_map(params![date], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut entries = Vec::with_capacity(rows.len());
        for (payload, synced) in rows {
            let mut entry: HistoryEntry = serde_json::from_str(&payload)?;
            entry.synced = synced;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn mark_local_synced(&self, id: &str) -> StoreResult<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE local_history SET synced = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    fn remove_local_synced(&self, date: &str) -> StoreResult<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM local_history WHERE day = ?1 AND synced = 1",
            params![date],
        )?;
        Ok(removed)
    }

    fn clear_cache(&self) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch("DELETE FROM cache; DELETE FROM local_history;")?;
        Ok(())
    }
}

impl TaskTimeStore for Database {
    fn load_tracked(&self, sub_task_id: &str) -> StoreResult<Option<u64>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT tracked_seconds FROM task_time WHERE sub_task_id = ?1",
                params![sub_task_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.map(|v| v.max(0) as u64))
    }

    /// GUARD: totals never go backwards in storage, even if a stale writer races a newer one
    fn save_tracked(
        &self,
        task_id: &str,
        sub_task_id: &str,
        tracked_seconds: u64,
        updated_at: u64,
    ) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO task_time (sub_task_id, task_id, tracked_seconds, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sub_task_id) DO UPDATE SET
                tracked_seconds = MAX(tracked_seconds, ?3),
                updated_at = ?4",
            params![sub_task_id, task_id, tracked_seconds as i64, updated_at as i64],
        )
        .map_err(|e| {
            log_io_error_if_any("save_tracked", &e);
            e
        })?;
        Ok(())
    }
}
