//! lenor-core: client-side conversation engine for the Lenor chat companion.
//!
//! The crate wires four pieces together:
//! - [`plugins::history::MessageStore`]: in-memory store for the active
//!   conversation, with subscriber notifications and offline write queueing
//! - [`plugins::history::ConversationDirectory`]: per-user conversation
//!   listing, creation, switching, and deletion
//! - [`services::connectivity::ConnectivityMonitor`]: online/offline state
//!   with edge-triggered listeners
//! - [`services::typing::TypingAnimator`]: incremental text-reveal scheduling
//!
//! Hosts construct everything through [`CoreBuilder`], injecting their own
//! [`plugins::storage::DurableCache`] and optional
//! [`services::memory::LongTermMemory`] backends.

pub mod plugins;
pub mod services;

use std::sync::Arc;

use plugins::history::{ConversationDirectory, MessageStore};
use plugins::storage::{DurableCache, MemoryCache};
use services::config::StoreConfig;
use services::connectivity::ConnectivityMonitor;
use services::memory::LongTermMemory;
use services::typing::TypingAnimator;

/// Everything a host needs to drive a conversation UI. Handles are cheap to
/// clone where cloning is supported; independent cores never share state.
pub struct Core {
    pub store: MessageStore,
    pub directory: ConversationDirectory,
    pub connectivity: ConnectivityMonitor,
    pub typing: TypingAnimator,
    connectivity_watcher: tokio::task::JoinHandle<()>,
}

impl Core {
    /// Stop following connectivity changes. Queued offline writes stay queued
    /// and can still be drained explicitly.
    pub fn detach_connectivity(&self) {
        self.connectivity_watcher.abort();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.connectivity_watcher.abort();
    }
}

/// Builds a [`Core`] with injected collaborators. Defaults: in-memory cache,
/// no long-term memory, online, environment-derived store and typing config.
pub struct CoreBuilder {
    cache: Option<Arc<dyn DurableCache>>,
    memory: Option<Arc<dyn LongTermMemory>>,
    store_config: Option<StoreConfig>,
    initially_online: bool,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self {
            cache: None,
            memory: None,
            store_config: None,
            initially_online: true,
        }
    }

    pub fn cache(mut self, cache: Arc<dyn DurableCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = Some(config);
        self
    }

    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Assemble the core. Must run inside a tokio runtime; the connectivity
    /// watcher task starts immediately.
    pub fn build(self) -> Core {
        let cache: Arc<dyn DurableCache> = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let store_config = self
            .store_config
            .unwrap_or_else(services::config::load_store_config);

        let store = MessageStore::new(cache.clone(), self.memory, &store_config);
        let connectivity = ConnectivityMonitor::new(self.initially_online);
        let connectivity_watcher = store.attach_connectivity(&connectivity);
        let directory = ConversationDirectory::new(cache, store.clone());

        Core {
            store,
            directory,
            connectivity,
            typing: TypingAnimator::from_env(),
            connectivity_watcher,
        }
    }
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugins::history::Message;

    #[tokio::test]
    async fn independent_cores_share_nothing() {
        let a = CoreBuilder::new().build();
        let b = CoreBuilder::new().build();

        a.store.set_current_user("u1").await;
        a.store.add_message(Message::user("only in a"));

        assert_eq!(a.store.get_messages().len(), 1);
        assert!(b.store.get_messages().is_empty());
    }

    #[tokio::test]
    async fn builder_injects_the_cache_into_store_and_directory() {
        let cache = Arc::new(MemoryCache::new());
        let core = CoreBuilder::new().cache(cache.clone()).build();

        let id = core.directory.create("u1").await.unwrap();
        core.store.add_message(Message::user("hello"));
        core.store.flush().await.unwrap();

        let listed = core.directory.list("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(listed[0].is_current);
    }
}
