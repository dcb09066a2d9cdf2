//! Ошибки движка трекинга.
//! Validation rejections are separate from infrastructure failures so the host can show
//! the reason to the user without parsing strings.

use thiserror::Error;

/// Why a timer was not allowed to start. Each variant maps to its own user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("Task is deactivated")]
    Deactivated,

    #[error("Sub-task is locked by its schedule")]
    Locked,

    /// Schedule window has not opened yet; carries seconds until it does.
    #[error("Sub-task starts in {0} seconds")]
    StartingSoon(u64),

    #[error("Sub-task schedule has ended and overtime is not allowed")]
    EndedWithoutOvertime,
}

/// Errors of the local persistence layer (queue, cache, tracked totals).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Database corruption detected: {0}")]
    Corrupted(String),

    #[error("Store mutex poisoned: {0}")]
    Poisoned(String),
}

impl StoreError {
    /// Message safe to show in a toast. Disk-full and read-only get their own wording.
    pub fn user_message(&self) -> String {
        use rusqlite::ffi::ErrorCode;
        if let StoreError::Sqlite(rusqlite::Error::SqliteFailure(ffi_err, _)) = self {
            match ffi_err.code {
                ErrorCode::DiskFull => return "Data sync unavailable (Disk Full?)".to_string(),
                ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                    return "Data sync unavailable (Permission denied?)".to_string()
                }
                _ => {}
            }
        }
        format!("Failed to store data locally: {}", self)
    }
}

/// Ошибки синхронизации (для разбора и логирования)
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store: {0}")]
    Store(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e.user_message())
    }
}

/// Remote endpoint failures. `Transport` means the request never produced a usable response.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Network: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Decode: {0}")]
    Decode(String),

    #[error("Auth: {0}")]
    Auth(String),
}

/// Host capability failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Screen capture is not available on this host")]
    CaptureUnavailable,

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Image encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error of engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Rejected(#[from] StartRejection),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
pub type StoreResult<T> = Result<T, StoreError>;
