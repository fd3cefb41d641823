//! Conversation directory: list, create, switch, and delete conversations for
//! the active user, reconciling stored metadata against the real message
//! lists so the overview never shows stale counts.

use std::sync::Arc;

use crate::plugins::storage::{self, DurableCache};

use super::store::MessageStore;
use super::types::{ConversationMetadata, ConversationSummary, Message, new_conversation_id, now_ms};
use super::StoreError;

pub struct ConversationDirectory {
    cache: Arc<dyn DurableCache>,
    store: MessageStore,
}

impl ConversationDirectory {
    pub fn new(cache: Arc<dyn DurableCache>, store: MessageStore) -> Self {
        Self { cache, store }
    }

    /// All non-empty conversations for `user_id`, newest first.
    ///
    /// Summaries are reconciled against the stored message lists; empty
    /// conversations (a created-but-unused id, or one whose messages were
    /// wiped) never appear.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        if user_id.is_empty() {
            return Err(StoreError::invalid_input("user id must not be empty"));
        }

        let prefix = storage::conversation_prefix(user_id);
        let keys = self.cache.list_keys(&prefix).await?;
        let current = storage::read_current_conversation(&*self.cache, user_id).await?;

        let mut summaries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for key in keys {
            if !storage::is_conversation_root_key(&key, &prefix) {
                continue;
            }
            let Some(conversation_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if !seen.insert(conversation_id.to_string()) {
                continue;
            }

            let metadata = storage::read_metadata(&*self.cache, user_id, conversation_id).await?;
            let messages =
                storage::read_all_messages(&*self.cache, user_id, conversation_id).await?;
            let Some(summary) = reconcile(conversation_id, metadata, &messages) else {
                continue;
            };

            summaries.push(ConversationSummary {
                is_current: current.as_deref() == Some(conversation_id),
                ..summary
            });
        }

        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        log::debug!("directory: listed {} conversations for {user_id}", summaries.len());
        Ok(summaries)
    }

    /// Start a fresh conversation and make it current, in the durable cache
    /// and in the live store.
    pub async fn create(&self, user_id: &str) -> Result<String, StoreError> {
        if user_id.is_empty() {
            return Err(StoreError::invalid_input("user id must not be empty"));
        }

        let conversation_id = new_conversation_id();
        storage::write_current_conversation(&*self.cache, user_id, &conversation_id).await?;
        log::info!("directory: created conversation {conversation_id} for {user_id}");

        self.store.set_current_user(user_id).await;
        self.store
            .set_current_conversation(Some(conversation_id.clone()))
            .await;
        Ok(conversation_id)
    }

    /// Make an existing conversation current and load its history into the
    /// store.
    pub async fn switch_to(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        if user_id.is_empty() || conversation_id.is_empty() {
            return Err(StoreError::invalid_input(
                "user id and conversation id must not be empty",
            ));
        }

        storage::write_current_conversation(&*self.cache, user_id, conversation_id).await?;
        log::info!("directory: switched to conversation {conversation_id}");

        self.store.set_current_user(user_id).await;
        self.store
            .set_current_conversation(Some(conversation_id.to_string()))
            .await;
        Ok(())
    }

    /// Remove a conversation's stored keys. Deleting the current conversation
    /// immediately creates and switches to a replacement so the user is never
    /// left without one.
    pub async fn delete(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<String>, StoreError> {
        if user_id.is_empty() || conversation_id.is_empty() {
            return Err(StoreError::invalid_input(
                "user id and conversation id must not be empty",
            ));
        }

        let cache = &*self.cache;
        cache
            .remove_item(&storage::messages_key(user_id, conversation_id))
            .await?;
        cache
            .remove_item(&storage::metadata_key(user_id, conversation_id))
            .await?;
        cache
            .remove_item(&storage::conversation_root_key(user_id, conversation_id))
            .await?;
        log::info!("directory: deleted conversation {conversation_id}");

        let current = storage::read_current_conversation(cache, user_id).await?;
        if current.as_deref() == Some(conversation_id) {
            let replacement = self.create(user_id).await?;
            return Ok(Some(replacement));
        }
        Ok(None)
    }
}

/// Build a summary from what is actually stored, trusting the real message
/// list over possibly stale metadata:
/// - the count is the larger of the metadata count and the real list length
/// - a missing last-message preview falls back to the newest stored message
/// - the newer of the two timestamps wins
///
/// Returns `None` when the conversation holds no messages at all.
fn reconcile(
    conversation_id: &str,
    metadata: Option<ConversationMetadata>,
    messages: &[Message],
) -> Option<ConversationSummary> {
    let metadata = metadata.unwrap_or(ConversationMetadata {
        last_message: String::new(),
        message_count: 0,
        timestamp: 0,
    });

    let real_count = messages.len() as u32;
    let message_count = metadata.message_count.max(real_count);
    if message_count == 0 {
        return None;
    }

    let newest = messages.last();
    let last_message = if metadata.last_message.is_empty() {
        newest.map(|m| m.text.clone()).unwrap_or_default()
    } else {
        metadata.last_message
    };
    let newest_ms = newest.and_then(|m| m.created_at_ms).unwrap_or(0);
    let timestamp = metadata.timestamp.max(newest_ms);
    let timestamp = if timestamp == 0 { now_ms() } else { timestamp };

    Some(ConversationSummary {
        id: conversation_id.to_string(),
        timestamp,
        last_message,
        message_count,
        is_current: false,
    })
}
