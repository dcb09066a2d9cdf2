use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// What happens to a queued item once it has failed `max_retries` drain attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Delete with a warning in the log.
    Discard,
    /// Delete and emit `EngineEvent::ItemDiscarded` so the host can tell the user.
    Notify,
    /// Keep as `failed` in the store until `retry_parked()` is called.
    Park,
}

/// Конфигурация движка (таймеры, каденции, очередь, HTTP)
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base_url: String,
    /// Timeout for evidence uploads and sync batches
    pub http_timeout_secs: u64,
    /// Heartbeats are non-critical, keep them short
    pub heartbeat_timeout_secs: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
    pub data_dir: Option<PathBuf>,
    pub log_level: String,

    pub tick_interval_ms: u64,
    pub heartbeat_every_ticks: u64,
    pub activity_flush_every_ticks: u64,
    pub tick_wrap: u64,

    pub health_failure_threshold: u32,
    pub health_stale_after_secs: u64,
    pub probe_interval_secs: u64,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,

    pub sync_interval_secs: u64,
    pub sync_batch_size: usize,
    pub max_retries: u32,
    pub record_queue_capacity: usize,
    pub evidence_queue_capacity: usize,
    pub exhausted_policy: ExhaustedPolicy,

    pub default_screenshot_interval_secs: u64,
    pub online_check_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://app.automatonsoft.de/api".to_string(),
            http_timeout_secs: 120,
            heartbeat_timeout_secs: 5,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: None,
            log_level: "info".to_string(),
            tick_interval_ms: 1000,
            heartbeat_every_ticks: 30,
            activity_flush_every_ticks: 300,
            tick_wrap: 1_000_000,
            health_failure_threshold: 5,
            health_stale_after_secs: 120,
            probe_interval_secs: 30,
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 600,
            sync_interval_secs: 300,
            sync_batch_size: 25,
            max_retries: 5,
            record_queue_capacity: 5000,
            evidence_queue_capacity: 200,
            exhausted_policy: ExhaustedPolicy::Discard,
            default_screenshot_interval_secs: 600,
            online_check_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Загрузить конфиг из TOML файла и применить переменные окружения.
    /// A missing file is not an error: defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                toml::from_str::<EngineConfig>(&content)?
            }
            _ => EngineConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HUBNITY_API_URL") {
            if !url.is_empty() {
                self.api_base_url = url;
            }
        }
        if let Ok(dir) = std::env::var("HUBNITY_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = Some(PathBuf::from(dir));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("heartbeat_every_ticks", self.heartbeat_every_ticks),
            ("activity_flush_every_ticks", self.activity_flush_every_ticks),
            ("tick_wrap", self.tick_wrap),
            ("probe_interval_secs", self.probe_interval_secs),
            ("sync_interval_secs", self.sync_interval_secs),
            ("sync_batch_size", self.sync_batch_size as u64),
            ("max_retries", self.max_retries as u64),
            ("record_queue_capacity", self.record_queue_capacity as u64),
            ("evidence_queue_capacity", self.evidence_queue_capacity as u64),
            ("breaker_failure_threshold", self.breaker_failure_threshold as u64),
            ("health_failure_threshold", self.health_failure_threshold as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api_base_url is empty".to_string()));
        }
        Ok(())
    }

    /// Data directory: explicit setting, else the platform local data dir.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        let base = if cfg!(target_os = "windows") {
            std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string())
        } else {
            std::env::var("HOME")
                .map(|h| format!("{}/.local/share", h))
                .unwrap_or_else(|_| ".".to_string())
        };
        PathBuf::from(base).join("hubnity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_cadences() {
        let c = EngineConfig::default();
        assert_eq!(c.heartbeat_every_ticks, 30);
        assert_eq!(c.activity_flush_every_ticks, 300);
        assert_eq!(c.sync_batch_size, 25);
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.breaker_cooldown_secs, 600);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c: EngineConfig = toml::from_str(
            r#"
            sync_batch_size = 10
            exhausted_policy = "park"
            "#,
        )
        .unwrap();
        assert_eq!(c.sync_batch_size, 10);
        assert_eq!(c.exhausted_policy, ExhaustedPolicy::Park);
        assert_eq!(c.max_retries, 5);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let c = EngineConfig {
            evidence_queue_capacity: 0,
            ..Default::default()
        };
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("evidence_queue_capacity"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let c = EngineConfig::load(Some(Path::new("/nonexistent/hubnity.toml"))).unwrap();
        assert_eq!(c.tick_interval_ms, 1000);
    }
}
