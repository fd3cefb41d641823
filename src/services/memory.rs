//! Remote long-term memory service client.
//!
//! Stores full conversation transcripts keyed by session id so the persona can
//! recall past content across devices. Failures here never block the local
//! chat flow; callers log and move on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plugins::history::StoreError;

use super::config::MemoryConfig;
use super::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryRole {
    User,
    Assistant,
}

impl MemoryRole {
    /// Wire value expected by the memory service ("user" / "ai").
    fn as_role_type(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "ai",
        }
    }

    fn from_role_type(value: &str) -> Self {
        match value {
            "ai" | "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub message_id: String,
    pub role: MemoryRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub message_id: String,
    pub role: MemoryRole,
    pub content: String,
    pub created_at: String,
}

/// Minimal contract the store needs from the long-term memory service.
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn append(&self, session_id: &str, message: &MemoryMessage) -> Result<(), StoreError>;
    async fn fetch_all(&self, session_id: &str) -> Result<Vec<MemoryEntry>, StoreError>;
}

#[derive(Serialize)]
struct WireMessage<'a> {
    message_id: &'a str,
    role_type: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AppendPayload<'a> {
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct WireTranscriptMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    role_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    created_at: String,
}

#[derive(Deserialize)]
struct TranscriptPayload {
    #[serde(default)]
    messages: Vec<WireTranscriptMessage>,
}

#[derive(Serialize)]
struct CreateSessionPayload<'a> {
    session_id: &'a str,
    metadata: SessionMetadata,
}

#[derive(Serialize)]
struct SessionMetadata {
    app: &'static str,
    creation_time: String,
}

pub struct RemoteMemoryClient {
    http: reqwest::Client,
    config: MemoryConfig,
    retry: RetryConfig,
}

impl RemoteMemoryClient {
    pub fn new(config: MemoryConfig, retry: RetryConfig) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            config,
            retry,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            super::config::load_memory_config(),
            RetryConfig::from_env(),
        )
    }

    fn memory_url(&self, session_id: &str) -> String {
        format!("{}/api/v1/sessions/{session_id}/memory", self.config.base_url)
    }

    fn sessions_url(&self) -> String {
        format!("{}/api/v1/sessions", self.config.base_url)
    }

    async fn create_session(&self, session_id: &str) -> Result<(), StoreError> {
        log::info!("memory: creating session {session_id}");
        let payload = CreateSessionPayload {
            session_id,
            metadata: SessionMetadata {
                app: "lenor",
                creation_time: chrono::Utc::now().to_rfc3339(),
            },
        };
        let response = self
            .http
            .post(self.sessions_url())
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::remote_status(
                format!("Session create failed with status {}", response.status()),
                response.status().as_u16(),
            ));
        }
        Ok(())
    }

    async fn append_once(&self, session_id: &str, message: &MemoryMessage) -> Result<(), StoreError> {
        let payload = AppendPayload {
            messages: vec![WireMessage {
                message_id: &message.message_id,
                role_type: message.role.as_role_type(),
                content: &message.content,
            }],
        };
        let response = self
            .http
            .post(self.memory_url(session_id))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // First write for a new session; create it and replay once.
            self.create_session(session_id).await?;
            let retry = self
                .http
                .post(self.memory_url(session_id))
                .bearer_auth(&self.config.api_key)
                .json(&payload)
                .send()
                .await?;
            if !retry.status().is_success() {
                return Err(StoreError::remote_status(
                    format!("Memory append failed with status {}", retry.status()),
                    retry.status().as_u16(),
                ));
            }
            return Ok(());
        }
        if !status.is_success() {
            return Err(StoreError::remote_status(
                format!("Memory append failed with status {status}"),
                status.as_u16(),
            ));
        }
        Ok(())
    }

    /// Transport failures and server-side errors are worth retrying; client
    /// errors (4xx) are not.
    fn is_retryable(err: &StoreError) -> bool {
        match err {
            StoreError::Remote { status, .. } => !matches!(*status, Some(400..=499)),
            _ => false,
        }
    }
}

#[async_trait]
impl LongTermMemory for RemoteMemoryClient {
    async fn append(&self, session_id: &str, message: &MemoryMessage) -> Result<(), StoreError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(StoreError::invalid_input("sessionId is required"));
        }
        if !self.config.has_api_key() {
            return Err(StoreError::invalid_input("Memory API key is not configured"));
        }

        let mut last_err = StoreError::internal("Memory append not attempted");
        for attempt in 1..=self.retry.max_attempts {
            match self.append_once(session_id, message).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= self.retry.max_attempts || !Self::is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.retry.backoff(attempt);
                    log::debug!(
                        "memory: append attempt {attempt} failed ({err}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_all(&self, session_id: &str) -> Result<Vec<MemoryEntry>, StoreError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(StoreError::invalid_input("sessionId is required"));
        }
        if !self.config.has_api_key() {
            return Err(StoreError::invalid_input("Memory API key is not configured"));
        }

        let response = self
            .http
            .get(self.memory_url(session_id))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Unknown session: create it so later appends land, report empty.
            self.create_session(session_id).await?;
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(StoreError::remote_status(
                format!("Memory fetch failed with status {}", response.status()),
                response.status().as_u16(),
            ));
        }

        let payload: TranscriptPayload = response.json().await?;
        Ok(payload
            .messages
            .into_iter()
            .map(|m| MemoryEntry {
                message_id: m.message_id,
                role: MemoryRole::from_role_type(&m.role_type),
                content: m.content,
                created_at: m.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_maps_to_service_role_type() {
        assert_eq!(MemoryRole::User.as_role_type(), "user");
        assert_eq!(MemoryRole::Assistant.as_role_type(), "ai");
        assert_eq!(MemoryRole::from_role_type("ai"), MemoryRole::Assistant);
        assert_eq!(MemoryRole::from_role_type("assistant"), MemoryRole::Assistant);
        assert_eq!(MemoryRole::from_role_type("user"), MemoryRole::User);
        assert_eq!(MemoryRole::from_role_type("unknown"), MemoryRole::User);
    }

    #[test]
    fn append_payload_uses_wire_field_names() {
        let payload = AppendPayload {
            messages: vec![WireMessage {
                message_id: "m1",
                role_type: "ai",
                content: "hola",
            }],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"message_id\":\"m1\""));
        assert!(json.contains("\"role_type\":\"ai\""));
    }

    #[test]
    fn transcript_tolerates_missing_fields() {
        let payload: TranscriptPayload =
            serde_json::from_str(r#"{"messages":[{"content":"hi"}]}"#).unwrap();
        assert_eq!(payload.messages.len(), 1);
        assert_eq!(payload.messages[0].content, "hi");
        assert!(payload.messages[0].message_id.is_empty());
    }

    #[test]
    fn retryable_classification() {
        // Server errors retry, client errors do not.
        assert!(RemoteMemoryClient::is_retryable(&StoreError::remote_status(
            "Memory append failed with status 503",
            503
        )));
        assert!(!RemoteMemoryClient::is_retryable(&StoreError::remote_status(
            "Memory append failed with status 401",
            401
        )));
        // Transport failures carry no status and are retryable.
        assert!(RemoteMemoryClient::is_retryable(&StoreError::remote(
            "connection reset by peer"
        )));
        assert!(!RemoteMemoryClient::is_retryable(&StoreError::invalid_input(
            "bad"
        )));
    }
}
