use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::DurableCache;
use crate::plugins::history::StoreError;

/// In-process cache backend. Not durable; used by tests and as an ephemeral
/// fallback when no database is configured.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::internal("Memory cache lock poisoned"))
    }
}

#[async_trait]
impl DurableCache for MemoryCache {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.entries()?.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove_roundtrip() {
        let cache = MemoryCache::new();
        cache.set_item("a", "1").await.unwrap();
        assert_eq!(cache.get_item("a").await.unwrap().as_deref(), Some("1"));
        cache.remove_item("a").await.unwrap();
        assert_eq!(cache.get_item("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix() {
        let cache = MemoryCache::new();
        cache.set_item("user:1:a", "x").await.unwrap();
        cache.set_item("user:1:b", "y").await.unwrap();
        cache.set_item("user:2:a", "z").await.unwrap();
        let mut keys = cache.list_keys("user:1:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:1:a", "user:1:b"]);
    }
}
