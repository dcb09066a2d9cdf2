//! Remote endpoint contract and its HTTP implementation.

use crate::auth::AuthManager;
use crate::config::EngineConfig;
use crate::error::ApiError;
use crate::models::{ActivityCounters, HistoryEntry, QueueKind, TaskSummary};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub task_id: String,
    pub sub_task_id: String,
    pub elapsed_seconds: u64,
    pub current_app: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    /// Server asks for an out-of-band capture right now
    #[serde(default)]
    pub capture_now: bool,
}

/// Скриншот + счётчики активности. Same shape is stored in the evidence queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidencePayload {
    /// Unique per capture; doubles as idempotency key and history id
    pub capture_id: String,
    pub task_id: String,
    pub sub_task_id: String,
    #[serde(with = "base64_bytes")]
    pub frame: Vec<u8>,
    pub counters: ActivityCounters,
    pub captured_at: u64,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceOutcome {
    Success,
    /// Storage quota on the server is exhausted; not retried automatically
    QuotaExceeded(String),
    /// Server refused this particular upload (4xx)
    Rejected { status: u16, message: String },
}

/// One queued record inside a sync batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub kind: QueueKind,
    pub idempotency_key: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchItemResult {
    success: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchResponse {
    results: Vec<BatchItemResult>,
}

/// Абстрактный контракт удалённого API.
/// `Err` always means the call as a whole failed (transport, auth, 5xx); per-item
/// outcomes travel inside `Ok`.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReply, ApiError>;

    async fn upload_evidence(&self, evidence: &EvidencePayload)
        -> Result<EvidenceOutcome, ApiError>;

    /// Results are positionally aligned with `items`.
    async fn sync_batch(&self, items: &[SyncRecord]) -> Result<Vec<bool>, ApiError>;

    /// Cheap unauthenticated liveness check for the recovery probe.
    async fn ping(&self) -> Result<(), ApiError>;

    async fn fetch_tasks(&self) -> Result<Vec<TaskSummary>, ApiError>;

    async fn fetch_history(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, ApiError>;
}

/// reqwest-based client for the hubnity API.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    api_base_url: String,
    app_version: String,
    heartbeat_timeout: Duration,
    pub(crate) auth_manager: AuthManager,
}

impl HttpApi {
    pub fn new(config: &EngineConfig, auth_manager: AuthManager) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            app_version: config.app_version.clone(),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            auth_manager,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    async fn authed(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self
            .auth_manager
            .get_access_token()
            .await
            .map_err(ApiError::Auth)?;
        Ok(builder
            .header("Authorization", format!("Bearer {}", token))
            .header("X-App-Version", &self.app_version))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    async fn error_from(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body
        };
        ApiError::Http {
            status: status.as_u16(),
            message,
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Квота хранилища: 413/507 или явное упоминание quota в теле ответа
fn is_quota_error(status: u16, body: &str) -> bool {
    status == 507 || status == 413 || body.to_lowercase().contains("quota")
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatReply, ApiError> {
        let builder = self
            .client
            .post(self.url("/heartbeat"))
            .timeout(self.heartbeat_timeout)
            .json(heartbeat);
        let response = self.send(self.authed(builder).await?).await?;
        if response.status().as_u16() == 204 {
            return Ok(HeartbeatReply::default());
        }
        Self::json(response).await
    }

    async fn upload_evidence(
        &self,
        evidence: &EvidencePayload,
    ) -> Result<EvidenceOutcome, ApiError> {
        let builder = self
            .client
            .post(self.url("/screenshots"))
            .header("X-Idempotency-Key", &evidence.capture_id)
            .json(evidence);
        let response = self.send(self.authed(builder).await?).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(EvidenceOutcome::Success);
        }
        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        if is_quota_error(code, &body) {
            warn!("[API] Storage quota exceeded: {}", body);
            return Ok(EvidenceOutcome::QuotaExceeded(body));
        }
        if status.is_client_error() {
            return Ok(EvidenceOutcome::Rejected {
                status: code,
                message: body,
            });
        }
        Err(ApiError::Http {
            status: code,
            message: body,
        })
    }

    async fn sync_batch(&self, items: &[SyncRecord]) -> Result<Vec<bool>, ApiError> {
        let builder = self
            .client
            .post(self.url("/sync/batch"))
            .json(&serde_json::json!({ "items": items }));
        let response = self.send(self.authed(builder).await?).await?;
        let parsed: BatchResponse = Self::json(response).await?;
        debug!(
            "[API] Batch of {} items answered with {} results",
            items.len(),
            parsed.results.len()
        );
        Ok(parsed.results.into_iter().map(|r| r.success).collect())
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let response = self
            .send(
                self.client
                    .get(self.url("/health"))
                    .timeout(self.heartbeat_timeout),
            )
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn fetch_tasks(&self) -> Result<Vec<TaskSummary>, ApiError> {
        let builder = self.client.get(self.url("/tasks"));
        let response = self.send(self.authed(builder).await?).await?;
        Self::json(response).await
    }

    async fn fetch_history(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, ApiError> {
        let builder = self
            .client
            .get(self.url("/time-logs"))
            .query(&[("date", date.format("%Y-%m-%d").to_string())]);
        let response = self.send(self.authed(builder).await?).await?;
        Self::json(response).await
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
