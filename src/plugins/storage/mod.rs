//! Durable local cache: the key-value contract plus the conversation key
//! namespace and message (de)serialization shared by the store and directory.
//!
//! Keys:
//! - `user:{userId}:conversation:{conversationId}`            (root, creation time)
//! - `user:{userId}:conversation:{conversationId}:metadata`   (ConversationMetadata JSON)
//! - `user:{userId}:conversation:{conversationId}:messages`   (Message list JSON)
//! - `user:{userId}:current_conversation`                     (active conversation id)

mod memory;
mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use async_trait::async_trait;

use super::history::{ConversationMetadata, Message, StoreError};
use crate::plugins::history::types::now_ms;

/// On-device persistent key-value storage surviving process restarts.
#[async_trait]
pub trait DurableCache: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove_item(&self, key: &str) -> Result<(), StoreError>;
    /// All stored keys starting with `prefix`, in unspecified order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn conversation_prefix(user_id: &str) -> String {
    format!("user:{user_id}:conversation:")
}

pub(crate) fn conversation_root_key(user_id: &str, conversation_id: &str) -> String {
    format!("user:{user_id}:conversation:{conversation_id}")
}

pub(crate) fn metadata_key(user_id: &str, conversation_id: &str) -> String {
    format!("user:{user_id}:conversation:{conversation_id}:metadata")
}

pub(crate) fn messages_key(user_id: &str, conversation_id: &str) -> String {
    format!("user:{user_id}:conversation:{conversation_id}:messages")
}

pub(crate) fn current_conversation_key(user_id: &str) -> String {
    format!("user:{user_id}:current_conversation")
}

/// Root keys carry no sub-key suffix; metadata/messages entries are excluded
/// when scanning for conversations.
pub(crate) fn is_conversation_root_key(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains(':'))
}

pub(crate) async fn read_current_conversation(
    cache: &dyn DurableCache,
    user_id: &str,
) -> Result<Option<String>, StoreError> {
    let value = cache.get_item(&current_conversation_key(user_id)).await?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

pub(crate) async fn write_current_conversation(
    cache: &dyn DurableCache,
    user_id: &str,
    conversation_id: &str,
) -> Result<(), StoreError> {
    cache
        .set_item(&current_conversation_key(user_id), conversation_id)
        .await
}

pub(crate) async fn read_metadata(
    cache: &dyn DurableCache,
    user_id: &str,
    conversation_id: &str,
) -> Result<Option<ConversationMetadata>, StoreError> {
    let Some(json) = cache.get_item(&metadata_key(user_id, conversation_id)).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&json) {
        Ok(meta) => Ok(Some(meta)),
        Err(err) => {
            log::warn!(
                "storage: discarding unparseable metadata for {conversation_id}: {err}"
            );
            Ok(None)
        }
    }
}

/// Full stored message list for a conversation, invalid entries filtered.
pub(crate) async fn read_all_messages(
    cache: &dyn DurableCache,
    user_id: &str,
    conversation_id: &str,
) -> Result<Vec<Message>, StoreError> {
    let Some(json) = cache.get_item(&messages_key(user_id, conversation_id)).await? else {
        return Ok(Vec::new());
    };
    let messages: Vec<Message> = serde_json::from_str(&json)?;
    let total = messages.len();
    let valid: Vec<Message> = messages.into_iter().filter(Message::is_valid).collect();
    if valid.len() != total {
        log::warn!(
            "storage: dropped {} invalid stored messages for {conversation_id}",
            total - valid.len()
        );
    }
    Ok(valid)
}

/// One page of history, `offset` messages back from the newest end.
///
/// The stored list is chronological; page 0 (`offset` 0) returns the newest
/// `limit` messages, still in chronological order within the slice.
pub(crate) async fn load_messages(
    cache: &dyn DurableCache,
    user_id: &str,
    conversation_id: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<Message>, StoreError> {
    let all = read_all_messages(cache, user_id, conversation_id).await?;
    let end = all.len().saturating_sub(offset);
    let start = end.saturating_sub(limit);
    Ok(all[start..end].to_vec())
}

/// Persist the full message list plus refreshed metadata and the root key.
///
/// Messages are always written with `animate_typing` cleared so restored
/// history never re-animates. Invalid entries (live stream placeholders that
/// have no text yet) stay out of durable storage and out of the metadata.
pub(crate) async fn save_messages(
    cache: &dyn DurableCache,
    user_id: &str,
    conversation_id: &str,
    messages: &[Message],
) -> Result<(), StoreError> {
    let to_save: Vec<Message> = messages
        .iter()
        .filter(|m| m.is_valid())
        .cloned()
        .map(|mut m| {
            m.animate_typing = Some(false);
            m
        })
        .collect();

    let json = serde_json::to_string(&to_save)?;
    cache
        .set_item(&messages_key(user_id, conversation_id), &json)
        .await?;

    let last = to_save.last();
    let metadata = ConversationMetadata {
        last_message: last.map(|m| m.text.clone()).unwrap_or_default(),
        message_count: to_save.len() as u32,
        timestamp: last.and_then(|m| m.created_at_ms).unwrap_or_else(now_ms),
    };
    cache
        .set_item(
            &metadata_key(user_id, conversation_id),
            &serde_json::to_string(&metadata)?,
        )
        .await?;

    let root_key = conversation_root_key(user_id, conversation_id);
    if cache.get_item(&root_key).await?.is_none() {
        cache.set_item(&root_key, &now_ms().to_string()).await?;
    }
    Ok(())
}
