//! In-memory conversation store: the single source of truth for the active
//! conversation's messages.
//!
//! Mutations apply synchronously under a short-lived lock and publish a fresh
//! newest-first snapshot before notifying subscribers; durable persistence
//! runs on detached tasks so the UI never blocks on storage. Writes that fail
//! while offline queue for replay once connectivity returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;

use crate::plugins::storage::{self, DurableCache};
use crate::services::config::StoreConfig;
use crate::services::connectivity::ConnectivityMonitor;
use crate::services::memory::{LongTermMemory, MemoryMessage, MemoryRole};

use super::types::{
    DebugInfo, ListenerCounts, Message, PaginationInfo, PendingWrite, display_timestamp,
    new_message_id, now_ms,
};
use super::StoreError;

/// Subscriber event categories. Closed set; unknown categories are
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Update,
    Error,
    Pagination,
}

type StoreCallback = Arc<dyn Fn(&[Message]) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    callback: StoreCallback,
}

#[derive(Default)]
struct ListenerRegistry {
    update: Vec<ListenerEntry>,
    error: Vec<ListenerEntry>,
    pagination: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    fn bucket(&self, event: StoreEvent) -> &Vec<ListenerEntry> {
        match event {
            StoreEvent::Update => &self.update,
            StoreEvent::Error => &self.error,
            StoreEvent::Pagination => &self.pagination,
        }
    }

    fn bucket_mut(&mut self, event: StoreEvent) -> &mut Vec<ListenerEntry> {
        match event {
            StoreEvent::Update => &mut self.update,
            StoreEvent::Error => &mut self.error,
            StoreEvent::Pagination => &mut self.pagination,
        }
    }
}

struct StoreState {
    user_id: String,
    conversation_id: Option<String>,
    /// Chronological (oldest first). Snapshots handed out are newest-first.
    messages: Vec<Message>,
    pagination: PaginationInfo,
    last_update_ms: u64,
}

struct StoreInner {
    cache: Arc<dyn DurableCache>,
    memory: Option<Arc<dyn LongTermMemory>>,
    // NOTE: std::sync::Mutex since the lock is never held across .await.
    state: Mutex<StoreState>,
    /// Published newest-first snapshot; refreshed on every mutation.
    snapshot: ArcSwap<Vec<Message>>,
    listeners: Mutex<ListenerRegistry>,
    pending: Mutex<Vec<PendingWrite>>,
    online: AtomicBool,
    next_listener_id: AtomicU64,
}

#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl MessageStore {
    pub fn new(
        cache: Arc<dyn DurableCache>,
        memory: Option<Arc<dyn LongTermMemory>>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                cache,
                memory,
                state: Mutex::new(StoreState {
                    user_id: String::new(),
                    conversation_id: None,
                    messages: Vec::new(),
                    pagination: PaginationInfo::new(config.page_size),
                    last_update_ms: 0,
                }),
                snapshot: ArcSwap::new(Arc::new(Vec::new())),
                listeners: Mutex::new(ListenerRegistry::default()),
                pending: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, ListenerRegistry> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rebuild and publish the newest-first snapshot from the locked state.
    fn publish(&self, state: &mut StoreState) {
        state.last_update_ms = now_ms();
        let snapshot: Vec<Message> = state.messages.iter().rev().cloned().collect();
        self.inner.snapshot.store(Arc::new(snapshot));
    }

    /// Deliver the current snapshot to every subscriber of `event`, in
    /// registration order. The registry lock is released before any callback
    /// runs, so callbacks are free to subscribe, unsubscribe, or read the
    /// store.
    fn notify(&self, event: StoreEvent) {
        let snapshot = self.inner.snapshot.load_full();
        let callbacks: Vec<StoreCallback> = self
            .listeners()
            .bucket(event)
            .iter()
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    /// Register a listener for one event category. The handle's `unsubscribe`
    /// is idempotent and never disturbs other subscribers.
    pub fn subscribe(
        &self,
        event: StoreEvent,
        callback: impl Fn(&[Message]) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().bucket_mut(event).push(ListenerEntry {
            id,
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            event,
            inner: Arc::downgrade(&self.inner),
            removed: AtomicBool::new(false),
        }
    }

    /// Owned snapshot, newest first. Later mutations never touch it.
    pub fn get_messages(&self) -> Vec<Message> {
        self.inner.snapshot.load_full().as_ref().clone()
    }

    pub fn get_pagination_info(&self) -> PaginationInfo {
        self.state().pagination
    }

    pub fn get_current_conversation(&self) -> Option<String> {
        self.state().conversation_id.clone()
    }

    pub fn get_debug_info(&self) -> DebugInfo {
        let (message_count, user_id, conversation_id, pagination, last_update_ms) = {
            let state = self.state();
            (
                state.messages.len(),
                state.user_id.clone(),
                state.conversation_id.clone(),
                state.pagination,
                state.last_update_ms,
            )
        };
        let listener_counts = {
            let listeners = self.listeners();
            ListenerCounts {
                update: listeners.update.len(),
                error: listeners.error.len(),
                pagination: listeners.pagination.len(),
            }
        };
        let pending_write_count = self.inner.pending.lock().map(|p| p.len()).unwrap_or(0);

        DebugInfo {
            message_count,
            listener_counts,
            current_user_id: user_id,
            current_conversation_id: conversation_id,
            pagination,
            pending_write_count,
            is_online: self.is_online(),
            last_update_ms,
        }
    }

    /// Switch the active user. Clears in-memory state and loads that user's
    /// current conversation from the durable cache. No-op when unchanged.
    pub async fn set_current_user(&self, user_id: &str) {
        {
            let mut state = self.state();
            if state.user_id == user_id {
                return;
            }
            log::info!("store: current user changed to {user_id}");
            state.user_id = user_id.to_string();
            state.conversation_id = None;
            state.messages.clear();
            state.pagination.current_page = 0;
            state.pagination.has_more = false;
            state.pagination.total_loaded = 0;
            self.publish(&mut state);
        }

        if user_id.is_empty() {
            self.notify(StoreEvent::Update);
            self.notify(StoreEvent::Pagination);
            return;
        }

        let current = match storage::read_current_conversation(&*self.inner.cache, user_id).await {
            Ok(current) => current,
            Err(err) => {
                log::error!("store: failed to read current conversation: {err}");
                self.notify(StoreEvent::Error);
                return;
            }
        };

        match current {
            Some(conversation_id) => {
                {
                    let mut state = self.state();
                    state.conversation_id = Some(conversation_id);
                }
                self.load_page(0).await;
            }
            None => {
                log::warn!("store: no current conversation for user {user_id}");
                self.notify(StoreEvent::Update);
                self.notify(StoreEvent::Pagination);
            }
        }
    }

    /// Switch the active conversation and reload page 0. No-op when unchanged.
    pub async fn set_current_conversation(&self, conversation_id: Option<String>) {
        {
            let mut state = self.state();
            if state.conversation_id == conversation_id {
                return;
            }
            log::info!(
                "store: current conversation changed to {}",
                conversation_id.as_deref().unwrap_or("<none>")
            );
            state.conversation_id = conversation_id.clone();
            state.pagination.current_page = 0;
            state.pagination.has_more = false;
        }

        if conversation_id.is_some() {
            self.load_page(0).await;
        } else {
            let mut state = self.state();
            state.messages.clear();
            state.pagination.total_loaded = 0;
            self.publish(&mut state);
            drop(state);
            self.notify(StoreEvent::Update);
            self.notify(StoreEvent::Pagination);
        }
    }

    /// Load one page from the durable cache. Page 0 replaces the in-memory
    /// list; older pages prepend. On storage failure the in-memory state is
    /// left untouched and only the `Error` event fires.
    pub async fn load_page(&self, page: u32) {
        let (user_id, conversation_id, page_size) = {
            let state = self.state();
            (
                state.user_id.clone(),
                state.conversation_id.clone(),
                state.pagination.page_size,
            )
        };
        if user_id.is_empty() {
            log::warn!("store: no current user set, skipping page load");
            return;
        }
        let Some(conversation_id) = conversation_id else {
            log::warn!("store: no current conversation, skipping page load");
            return;
        };

        let limit = page_size as usize;
        let offset = page as usize * limit;
        log::debug!("store: loading page {page} (limit {limit}, offset {offset})");

        let loaded = match storage::load_messages(
            &*self.inner.cache,
            &user_id,
            &conversation_id,
            limit,
            offset,
        )
        .await
        {
            Ok(loaded) => loaded,
            Err(err) => {
                log::error!("store: page load failed: {err}");
                self.notify(StoreEvent::Error);
                return;
            }
        };

        {
            let mut state = self.state();
            // The conversation may have switched while the read was in flight;
            // a stale page must not leak into the new conversation.
            if state.conversation_id.as_deref() != Some(conversation_id.as_str()) {
                log::debug!("store: discarding page for inactive conversation {conversation_id}");
                return;
            }
            let full_page = loaded.len() == limit && !loaded.is_empty();
            if page == 0 {
                state.messages = loaded;
            } else {
                let mut merged = loaded;
                merged.append(&mut state.messages);
                state.messages = merged;
            }
            state.pagination.current_page = page;
            state.pagination.has_more = full_page;
            state.pagination.total_loaded = state.messages.len() as u32;
            self.publish(&mut state);
        }

        self.notify(StoreEvent::Update);
        self.notify(StoreEvent::Pagination);
    }

    /// Advance to the next (older) page. Returns `false` without touching
    /// storage once `has_more` is exhausted.
    pub async fn load_next_page(&self) -> bool {
        let next_page = {
            let state = self.state();
            if !state.pagination.has_more {
                log::debug!("store: no more pages to load");
                return false;
            }
            state.pagination.current_page + 1
        };
        self.load_page(next_page).await;
        true
    }

    /// Append a message, notify subscribers immediately, and persist in the
    /// background (optimistic, non-blocking). Invalid messages never enter
    /// the list; they surface through the `Error` event only.
    pub fn add_message(&self, mut message: Message) {
        if message.text.is_empty() {
            log::error!("store: rejected message without text");
            self.notify(StoreEvent::Error);
            return;
        }

        {
            let mut state = self.state();
            if message.id.is_empty() {
                let sender = if message.is_user { "user" } else { "assistant" };
                message.id = new_message_id(sender);
            }
            state.messages.push(message.clone());
            self.publish(&mut state);
            log::debug!(
                "store: message {} appended (total {})",
                message.id,
                state.messages.len()
            );
        }
        self.notify(StoreEvent::Update);

        let store = self.clone();
        tokio::spawn(async move {
            store.persist_after_append(message).await;
        });
    }

    /// Bulk-replace the in-memory list (history restore). Invalid entries are
    /// filtered out before anything else happens.
    pub fn set_messages(&self, messages: Vec<Message>) {
        let total = messages.len();
        let valid: Vec<Message> = messages.into_iter().filter(Message::is_valid).collect();
        if valid.len() != total {
            log::warn!("store: filtered {} invalid messages", total - valid.len());
        }

        {
            let mut state = self.state();
            state.messages = valid;
            state.pagination.total_loaded = state.messages.len() as u32;
            self.publish(&mut state);
        }
        self.notify(StoreEvent::Update);

        let store = self.clone();
        tokio::spawn(async move {
            if let Err(err) = store.persist_current().await {
                log::error!("store: bulk persist failed: {err}");
                store.notify(StoreEvent::Error);
            }
        });
    }

    /// Empty the in-memory list. Durable state is untouched; conversation
    /// deletion goes through the directory.
    pub fn clear_messages(&self) {
        {
            let mut state = self.state();
            state.messages.clear();
            state.pagination.total_loaded = 0;
            self.publish(&mut state);
        }
        log::info!("store: in-memory messages cleared");
        self.notify(StoreEvent::Update);
    }

    /// Flip one message's animation flags once its reveal finished. Logged
    /// no-op when the id is unknown.
    pub fn mark_as_animated(&self, message_id: &str) {
        {
            let mut state = self.state();
            let Some(index) = state.messages.iter().position(|m| m.id == message_id) else {
                log::warn!("store: mark_as_animated: message {message_id} not found");
                return;
            };
            let mut updated = state.messages[index].clone();
            updated.animate_typing = Some(false);
            updated.has_been_animated = Some(true);
            state.messages[index] = updated;
            self.publish(&mut state);
        }
        self.notify(StoreEvent::Update);
    }

    /// Insert an empty assistant placeholder to receive streamed tokens.
    /// Idempotent per id.
    pub fn start_stream_message(&self, id: &str) {
        {
            let mut state = self.state();
            if state.messages.iter().any(|m| m.id == id) {
                return;
            }
            state.messages.push(Message {
                id: id.to_string(),
                text: String::new(),
                is_user: false,
                timestamp: display_timestamp(),
                created_at_ms: Some(now_ms()),
                local_image_uri: None,
                animate_typing: Some(true),
                has_been_animated: Some(false),
            });
            self.publish(&mut state);
        }
        self.notify(StoreEvent::Update);
    }

    /// Append a streamed token to the placeholder. Logged no-op for unknown ids.
    pub fn append_stream_token(&self, id: &str, token: &str) {
        {
            let mut state = self.state();
            let Some(index) = state.messages.iter().position(|m| m.id == id) else {
                log::warn!("store: append_stream_token: message {id} not found");
                return;
            };
            let mut updated = state.messages[index].clone();
            updated.text.push_str(token);
            state.messages[index] = updated;
            self.publish(&mut state);
        }
        self.notify(StoreEvent::Update);
    }

    /// Seal a streamed message: stop its animation, persist, and forward it to
    /// long-term memory. A placeholder that never received text is dropped.
    pub fn finalize_stream(&self, id: &str) {
        let finalized = {
            let mut state = self.state();
            let Some(index) = state.messages.iter().position(|m| m.id == id) else {
                log::warn!("store: finalize_stream: message {id} not found");
                return;
            };
            if state.messages[index].text.is_empty() {
                log::warn!("store: dropping empty streamed message {id}");
                state.messages.remove(index);
                self.publish(&mut state);
                None
            } else {
                let mut updated = state.messages[index].clone();
                updated.animate_typing = Some(false);
                updated.has_been_animated = Some(true);
                state.messages[index] = updated.clone();
                self.publish(&mut state);
                Some(updated)
            }
        };
        self.notify(StoreEvent::Update);

        let Some(message) = finalized else {
            return;
        };
        log::debug!("store: stream finalized for message {id}");
        let store = self.clone();
        tokio::spawn(async move {
            store.persist_after_append(message).await;
        });
    }

    /// Persist the whole conversation after an append; queue the message for
    /// replay when the write fails offline, then forward it to long-term
    /// memory best-effort.
    async fn persist_after_append(&self, message: Message) {
        let conversation_id = match self.persist_current().await {
            Ok(conversation_id) => conversation_id,
            Err(err) => {
                log::error!("store: persist failed for message {}: {err}", message.id);
                if !self.is_online() {
                    if let Ok(mut pending) = self.inner.pending.lock() {
                        pending.push(PendingWrite {
                            message,
                            retry_count: 0,
                        });
                        log::info!("store: message queued for replay ({} pending)", pending.len());
                    }
                } else {
                    self.notify(StoreEvent::Error);
                }
                return;
            }
        };

        let Some(memory) = self.inner.memory.clone() else {
            return;
        };
        let Some(session_id) = conversation_id else {
            return;
        };
        let role = if message.is_user {
            MemoryRole::User
        } else {
            MemoryRole::Assistant
        };
        let entry = MemoryMessage {
            message_id: message.id.clone(),
            role,
            content: message.text.clone(),
        };
        // Long-term memory is best-effort; the local conversation keeps
        // working when it is down.
        if let Err(err) = memory.append(&session_id, &entry).await {
            log::warn!("store: long-term memory append failed: {err}");
        }
    }

    /// Write the current in-memory conversation to the durable cache.
    /// Returns the conversation id used, for long-term memory forwarding.
    async fn persist_current(&self) -> Result<Option<String>, StoreError> {
        let (user_id, conversation_id, messages) = {
            let state = self.state();
            (
                state.user_id.clone(),
                state.conversation_id.clone(),
                state.messages.clone(),
            )
        };
        if user_id.is_empty() {
            return Ok(None);
        }
        let conversation_id = conversation_id.unwrap_or_else(|| "default".to_string());
        storage::save_messages(&*self.inner.cache, &user_id, &conversation_id, &messages).await?;
        Ok(Some(conversation_id))
    }

    /// Force a synchronous persistence pass (host shutdown, tests).
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.persist_current().await.map(|_| ())
    }

    /// Replay queued offline writes. The queue is copied then cleared before
    /// iterating so writes queued during the drain are not reprocessed; items
    /// that still fail are requeued with their retry count incremented.
    pub async fn drain_pending_writes(&self) {
        let pending: Vec<PendingWrite> = {
            let Ok(mut queue) = self.inner.pending.lock() else {
                return;
            };
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }
        log::info!("store: draining {} pending writes", pending.len());

        for item in pending {
            match self.persist_current().await {
                Ok(_) => {
                    log::debug!("store: pending message {} replayed", item.message.id);
                }
                Err(err) => {
                    log::warn!(
                        "store: replay failed for message {} (attempt {}): {err}",
                        item.message.id,
                        item.retry_count + 1
                    );
                    if let Ok(mut queue) = self.inner.pending.lock() {
                        queue.push(PendingWrite {
                            message: item.message,
                            retry_count: item.retry_count + 1,
                        });
                    }
                }
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Follow a connectivity monitor: track the online flag and drain the
    /// pending queue on every offline-to-online transition.
    pub fn attach_connectivity(&self, monitor: &ConnectivityMonitor) -> tokio::task::JoinHandle<()> {
        self.set_online(monitor.get_current_status());
        let mut rx = monitor.subscribe();
        let store = self.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                let was_online = store.inner.online.swap(online, Ordering::SeqCst);
                if online && !was_online {
                    store.drain_pending_writes().await;
                }
            }
        })
    }
}

/// Removal handle returned by [`MessageStore::subscribe`].
pub struct Subscription {
    id: u64,
    event: StoreEvent,
    inner: Weak<StoreInner>,
    removed: AtomicBool,
}

impl Subscription {
    /// Remove the listener. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .bucket_mut(self.event)
            .retain(|entry| entry.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::storage::MemoryCache;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Cache wrapper whose writes can be failed on demand.
    struct FlakyCache {
        inner: MemoryCache,
        fail_writes: AtomicBool,
    }

    impl FlakyCache {
        fn new() -> Self {
            Self {
                inner: MemoryCache::new(),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DurableCache for FlakyCache {
        async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_item(key).await
        }

        async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::storage("simulated write failure"));
            }
            self.inner.set_item(key, value).await
        }

        async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove_item(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_keys(prefix).await
        }
    }

    struct RecordingMemory {
        appended: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl LongTermMemory for RecordingMemory {
        async fn append(
            &self,
            session_id: &str,
            message: &MemoryMessage,
        ) -> Result<(), StoreError> {
            self.appended
                .lock()
                .unwrap()
                .push((session_id.to_string(), message.content.clone()));
            Ok(())
        }

        async fn fetch_all(
            &self,
            _session_id: &str,
        ) -> Result<Vec<crate::services::memory::MemoryEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn store_with_cache(cache: Arc<dyn DurableCache>) -> MessageStore {
        MessageStore::new(cache, None, &StoreConfig { page_size: 3 })
    }

    fn fresh_store() -> MessageStore {
        store_with_cache(Arc::new(MemoryCache::new()))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn messages_come_back_newest_first() {
        let store = fresh_store();
        for i in 1..=4 {
            store.add_message(Message::user(format!("m{i}")));
        }
        let texts: Vec<String> = store.get_messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["m4", "m3", "m2", "m1"]);
    }

    #[tokio::test]
    async fn snapshots_are_isolated_from_later_mutations() {
        let store = fresh_store();
        store.add_message(Message::user("first"));
        let snapshot = store.get_messages();
        assert_eq!(snapshot.len(), 1);

        store.add_message(Message::user("second"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.get_messages().len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_spares_others() {
        let store = fresh_store();
        let first = Arc::new(Mutex::new(0usize));
        let second = Arc::new(Mutex::new(0usize));

        let first_sink = first.clone();
        let a = store.subscribe(StoreEvent::Update, move |_| {
            *first_sink.lock().unwrap() += 1
        });
        let second_sink = second.clone();
        let _b = store.subscribe(StoreEvent::Update, move |_| {
            *second_sink.lock().unwrap() += 1
        });

        a.unsubscribe();
        a.unsubscribe();
        store.add_message(Message::user("hi"));

        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
        assert_eq!(store.get_debug_info().listener_counts.update, 1);
    }

    #[tokio::test]
    async fn listener_can_unsubscribe_itself_during_notification() {
        let store = fresh_store();
        let calls = Arc::new(Mutex::new(0usize));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let sink = calls.clone();
        let own_slot = slot.clone();
        let subscription = store.subscribe(StoreEvent::Update, move |_| {
            *sink.lock().unwrap() += 1;
            // One-shot: remove this listener from inside its own callback.
            if let Some(sub) = own_slot.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(subscription);

        store.add_message(Message::user("first"));
        store.add_message(Message::user("second"));

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(store.get_debug_info().listener_counts.update, 0);
    }

    #[tokio::test]
    async fn listener_can_read_the_store_during_notification() {
        let store = fresh_store();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let sink = observed.clone();
        let reader = store.clone();
        let _sub = store.subscribe(StoreEvent::Update, move |_| {
            sink.lock()
                .unwrap()
                .push(reader.get_debug_info().message_count);
        });
        let _late = store.subscribe(StoreEvent::Update, |_| {});

        store.add_message(Message::user("hi"));
        assert_eq!(*observed.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn update_subscribers_see_the_state_at_notification_time() {
        let store = fresh_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.subscribe(StoreEvent::Update, move |snapshot| {
            sink.lock()
                .unwrap()
                .push(snapshot.first().map(|m| m.text.clone()));
        });

        store.add_message(Message::user("a"));
        store.add_message(Message::user("b"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("a".to_string()), Some("b".to_string())]
        );
    }

    #[tokio::test]
    async fn invalid_messages_are_rejected() {
        let store = fresh_store();
        let errors = Arc::new(Mutex::new(0usize));
        let sink = errors.clone();
        let _sub = store.subscribe(StoreEvent::Error, move |_| {
            *sink.lock().unwrap() += 1
        });

        let mut no_text = Message::user("x");
        no_text.text.clear();
        store.add_message(no_text);
        assert!(store.get_messages().is_empty());
        assert_eq!(*errors.lock().unwrap(), 1);

        let mut no_id = Message::user("kept");
        no_id.id.clear();
        let mut invalid = Message::user("y");
        invalid.text.clear();
        store.set_messages(vec![invalid, no_id]);
        // set_messages filters; only the entry with both id and text survives.
        // (the id-less one is invalid too, per the stored-message invariant)
        assert_eq!(store.get_messages().len(), 0);

        let valid = Message::user("hi");
        let mut missing_text = Message::user("z");
        missing_text.text.clear();
        store.set_messages(vec![missing_text, valid]);
        assert_eq!(store.get_messages().len(), 1);
        assert_eq!(store.get_messages()[0].text, "hi");
    }

    #[tokio::test]
    async fn add_message_assigns_missing_ids() {
        let store = fresh_store();
        let mut message = Message::user("hello");
        message.id.clear();
        store.add_message(message);
        let stored = store.get_messages();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].id.is_empty());
    }

    #[tokio::test]
    async fn pagination_stops_once_exhausted() {
        let cache = Arc::new(MemoryCache::new());
        let all: Vec<Message> = (1..=7).map(|i| Message::user(format!("m{i}"))).collect();
        storage::save_messages(&*cache, "u1", "c1", &all).await.unwrap();
        storage::write_current_conversation(&*cache, "u1", "c1")
            .await
            .unwrap();

        let store = store_with_cache(cache);
        store.set_current_user("u1").await;

        // Page 0: newest 3 of 7.
        assert_eq!(store.get_messages().len(), 3);
        assert!(store.get_pagination_info().has_more);
        assert_eq!(store.get_messages()[0].text, "m7");

        assert!(store.load_next_page().await);
        assert_eq!(store.get_messages().len(), 6);

        // Final page is short, so has_more drops.
        assert!(store.load_next_page().await);
        assert_eq!(store.get_messages().len(), 7);
        assert!(!store.get_pagination_info().has_more);
        let page = store.get_pagination_info().current_page;

        assert!(!store.load_next_page().await);
        assert!(!store.load_next_page().await);
        assert_eq!(store.get_pagination_info().current_page, page);

        // Oldest message ended up at the chronological front (last in the
        // newest-first snapshot).
        assert_eq!(store.get_messages().last().unwrap().text, "m1");
    }

    #[tokio::test]
    async fn switching_conversations_resets_pagination() {
        let cache = Arc::new(MemoryCache::new());
        let many: Vec<Message> = (1..=5).map(|i| Message::user(format!("a{i}"))).collect();
        storage::save_messages(&*cache, "u1", "c1", &many).await.unwrap();
        let few = vec![Message::user("b1")];
        storage::save_messages(&*cache, "u1", "c2", &few).await.unwrap();
        storage::write_current_conversation(&*cache, "u1", "c1")
            .await
            .unwrap();

        let store = store_with_cache(cache);
        store.set_current_user("u1").await;
        assert!(store.get_pagination_info().has_more);

        store.set_current_conversation(Some("c2".to_string())).await;
        let info = store.get_pagination_info();
        assert_eq!(info.current_page, 0);
        assert!(!info.has_more);
        assert_eq!(store.get_messages().len(), 1);
        assert_eq!(store.get_messages()[0].text, "b1");
    }

    #[tokio::test]
    async fn failed_page_load_leaves_state_untouched() {
        struct FailingReads;
        #[async_trait]
        impl DurableCache for FailingReads {
            async fn get_item(&self, _key: &str) -> Result<Option<String>, StoreError> {
                Err(StoreError::storage("read failure"))
            }
            async fn set_item(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
                Ok(())
            }
            async fn remove_item(&self, _key: &str) -> Result<(), StoreError> {
                Ok(())
            }
            async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
                Ok(Vec::new())
            }
        }

        let store = store_with_cache(Arc::new(FailingReads));
        store.set_current_user("u1").await;
        {
            let mut state = store.state();
            state.conversation_id = Some("c1".to_string());
            state.messages.push(Message::user("kept"));
            store.publish(&mut state);
        }
        let errors = Arc::new(Mutex::new(0usize));
        let sink = errors.clone();
        let _sub = store.subscribe(StoreEvent::Error, move |_| {
            *sink.lock().unwrap() += 1
        });

        store.load_page(0).await;
        assert_eq!(store.get_messages().len(), 1);
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_messages_leaves_durable_state_alone() {
        let cache = Arc::new(MemoryCache::new());
        let all = vec![Message::user("m1")];
        storage::save_messages(&*cache, "u1", "c1", &all).await.unwrap();
        storage::write_current_conversation(&*cache, "u1", "c1")
            .await
            .unwrap();

        let store = store_with_cache(cache.clone());
        store.set_current_user("u1").await;
        assert_eq!(store.get_messages().len(), 1);

        store.clear_messages();
        assert!(store.get_messages().is_empty());
        let stored = storage::read_all_messages(&*cache, "u1", "c1").await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn mark_as_animated_replaces_one_message() {
        let store = fresh_store();
        let message = Message::assistant("hola");
        let id = message.id.clone();
        store.add_message(message);
        assert!(store.get_messages()[0].should_animate());

        store.mark_as_animated(&id);
        let updated = &store.get_messages()[0];
        assert_eq!(updated.animate_typing, Some(false));
        assert_eq!(updated.has_been_animated, Some(true));

        // Unknown id is a logged no-op.
        store.mark_as_animated("missing");
        assert_eq!(store.get_messages().len(), 1);
    }

    #[tokio::test]
    async fn streamed_message_accumulates_then_finalizes() {
        let store = fresh_store();
        store.start_stream_message("s1");
        store.start_stream_message("s1"); // idempotent
        assert_eq!(store.get_messages().len(), 1);

        store.append_stream_token("s1", "Hel");
        store.append_stream_token("s1", "lo");
        assert_eq!(store.get_messages()[0].text, "Hello");

        store.finalize_stream("s1");
        let sealed = &store.get_messages()[0];
        assert_eq!(sealed.has_been_animated, Some(true));
        assert_eq!(sealed.animate_typing, Some(false));
    }

    #[tokio::test]
    async fn empty_stream_placeholder_is_dropped_on_finalize() {
        let store = fresh_store();
        store.start_stream_message("s1");
        store.finalize_stream("s1");
        assert!(store.get_messages().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offline_send_queues_and_drains_on_reconnect() {
        let cache = Arc::new(FlakyCache::new());
        let store = store_with_cache(cache.clone());
        let monitor = ConnectivityMonitor::new(true);
        let _watcher = store.attach_connectivity(&monitor);

        store.set_current_user("u1").await;
        store.set_current_conversation(Some("c1".to_string())).await;

        monitor.set_online(false);
        wait_until(|| !store.is_online()).await;
        cache.set_fail_writes(true);

        store.add_message(Message::user("hi"));
        // Optimistic append: visible immediately despite the doomed write.
        assert_eq!(store.get_messages()[0].text, "hi");
        wait_until(|| store.get_debug_info().pending_write_count == 1).await;

        cache.set_fail_writes(false);
        monitor.set_online(true);
        wait_until(|| store.get_debug_info().pending_write_count == 0).await;

        let stored = storage::read_all_messages(&*cache, "u1", "c1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn still_failing_replays_are_requeued_with_retry_count() {
        let cache = Arc::new(FlakyCache::new());
        let store = store_with_cache(cache.clone());
        store.set_current_user("u1").await;
        store.set_current_conversation(Some("c1".to_string())).await;
        store.set_online(false);
        cache.set_fail_writes(true);

        store.add_message(Message::user("hi"));
        wait_until(|| store.get_debug_info().pending_write_count == 1).await;

        // Still failing: one retry per drain cycle, item stays queued.
        store.drain_pending_writes().await;
        assert_eq!(store.get_debug_info().pending_write_count, 1);
        {
            let pending = store.inner.pending.lock().unwrap();
            assert_eq!(pending[0].retry_count, 1);
        }

        cache.set_fail_writes(false);
        store.drain_pending_writes().await;
        assert_eq!(store.get_debug_info().pending_write_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_are_forwarded_to_long_term_memory() {
        let memory = Arc::new(RecordingMemory {
            appended: Mutex::new(Vec::new()),
        });
        let store = MessageStore::new(
            Arc::new(MemoryCache::new()),
            Some(memory.clone()),
            &StoreConfig::default(),
        );
        store.set_current_user("u1").await;
        store.set_current_conversation(Some("c1".to_string())).await;

        store.add_message(Message::user("remember me"));
        wait_until(|| !memory.appended.lock().unwrap().is_empty()).await;

        let appended = memory.appended.lock().unwrap();
        assert_eq!(appended[0], ("c1".to_string(), "remember me".to_string()));
    }

    #[tokio::test]
    async fn set_current_user_is_a_noop_for_same_user() {
        let cache = Arc::new(MemoryCache::new());
        let store = store_with_cache(cache);
        store.set_current_user("u1").await;
        store.add_message(Message::user("kept"));

        store.set_current_user("u1").await;
        assert_eq!(store.get_messages().len(), 1);

        store.set_current_user("u2").await;
        assert!(store.get_messages().is_empty());
    }
}
