//! Offline-first time tracking: timers, evidence capture and a durable sync queue.

pub mod agent;
pub mod api;
pub mod auth;
pub mod breaker;
pub mod bridge;
pub mod cache;
#[cfg(feature = "desktop")]
pub mod capture;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod database;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod health;
pub mod ipc;
pub mod models;
pub mod monitor;
pub mod network;
pub mod queue;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use agent::{EngineParts, SyncEngine};
pub use api::{HttpApi, RemoteApi};
pub use bridge::HostBridge;
pub use config::EngineConfig;
pub use database::Database;
pub use engine::{StartOutcome, TimerEngine};
pub use error::{EngineError, StartRejection};
pub use ipc::EngineEvent;
pub use network::check_online_status;

/// Инициализация логирования: RUST_LOG, если задан, иначе уровень из конфига.
/// Call once from the binary; tests never install a global subscriber.
pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    // A second init (embedding host already set one) is not an error
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
