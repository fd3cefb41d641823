//! Shared configuration loading for the conversation store and the remote
//! memory client.

use serde::Serialize;

const DEFAULT_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 500;

/// Store tuning loaded from `.env`/environment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub page_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Load store configuration from `.env`/environment.
///
/// Reads:
/// - `CHAT_PAGE_SIZE` (default 10, clamped to 1..=500)
pub fn load_store_config() -> StoreConfig {
    let _ = dotenvy::dotenv();

    StoreConfig {
        page_size: env_u32("CHAT_PAGE_SIZE", DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
    }
}

/// Remote long-term memory endpoint configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub base_url: String,
    pub api_key: String,
}

impl MemoryConfig {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.getzep.com".to_string(),
            api_key: String::new(),
        }
    }
}

/// Load memory service configuration from `.env`/environment.
///
/// Reads:
/// - `MEMORY_API_URL` (fallback: `ZEP_API_URL`)
/// - `MEMORY_API_KEY` (fallback: `ZEP_API_KEY`)
pub fn load_memory_config() -> MemoryConfig {
    let _ = dotenvy::dotenv();

    let defaults = MemoryConfig::default();
    MemoryConfig {
        base_url: std::env::var("MEMORY_API_URL")
            .or_else(|_| std::env::var("ZEP_API_URL"))
            .ok()
            .map(|v| normalize_base_url(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.base_url),
        api_key: std::env::var("MEMORY_API_KEY")
            .or_else(|_| std::env::var("ZEP_API_KEY"))
            .unwrap_or_default(),
    }
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Public memory configuration safe to expose to the host UI (secrets omitted).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPublicConfig {
    pub base_url: String,
    pub has_api_key: bool,
}

impl From<&MemoryConfig> for MemoryPublicConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            has_api_key: config.has_api_key(),
        }
    }
}

pub(crate) fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
