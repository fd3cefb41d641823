use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One chat message as the UI renders it.
///
/// `timestamp` is the display string ("14:32"); `created_at_ms` carries the
/// machine-readable creation time used for ordering and reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub is_user: bool,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_image_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animate_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_been_animated: Option<bool>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::build(text.into(), true, None)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::build(text.into(), false, Some(true))
    }

    fn build(text: String, is_user: bool, animate_typing: Option<bool>) -> Self {
        let sender = if is_user { "user" } else { "assistant" };
        Self {
            id: new_message_id(sender),
            text,
            is_user,
            timestamp: display_timestamp(),
            created_at_ms: Some(now_ms()),
            local_image_uri: None,
            animate_typing,
            has_been_animated: None,
        }
    }

    /// A message missing either `id` or `text` is invalid and must never reach
    /// the in-memory list.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.text.is_empty()
    }

    pub fn should_animate(&self) -> bool {
        !self.is_user
            && self.animate_typing.unwrap_or(false)
            && !self.has_been_animated.unwrap_or(false)
    }
}

/// Pagination over the active conversation's durable history.
///
/// Page 0 is the most recent slice; higher pages reach backwards into older
/// history. `has_more` holds only while the last loaded page came back full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub current_page: u32,
    pub page_size: u32,
    pub has_more: bool,
    pub total_loaded: u32,
}

impl PaginationInfo {
    pub fn new(page_size: u32) -> Self {
        Self {
            current_page: 0,
            page_size,
            has_more: false,
            total_loaded: 0,
        }
    }
}

/// Cached per-conversation metadata. Advisory only; the stored message list is
/// the source of truth and the directory corrects stale fields from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub last_message: String,
    pub message_count: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub timestamp: u64,
    pub last_message: String,
    pub message_count: u32,
    pub is_current: bool,
}

/// A message whose durable persistence failed while offline, held for replay.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub message: Message,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerCounts {
    pub update: usize,
    pub error: usize,
    pub pagination: usize,
}

/// Diagnostic snapshot exposed to the host for debug overlays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub message_count: usize,
    pub listener_counts: ListenerCounts,
    pub current_user_id: String,
    pub current_conversation_id: Option<String>,
    pub pagination: PaginationInfo,
    pub pending_write_count: usize,
    pub is_online: bool,
    pub last_update_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn display_timestamp() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

/// Zero-padded millisecond prefix keeps ids lexicographically sortable by
/// creation order within a sender.
pub(crate) fn new_message_id(sender: &str) -> String {
    format!("{:013}_{}_{}", now_ms(), sender, Uuid::new_v4().simple())
}

pub(crate) fn new_conversation_id() -> String {
    format!("conv_{}", Uuid::new_v4())
}
