use serde::{Deserialize, Serialize};

/// Tunables for the Chunk Cache and Handle Cache (spec §3.1, §4.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_chunk_cache_cap")]
    pub chunk_cache_cap: usize,
    #[serde(default = "default_chunk_ttl_secs")]
    pub chunk_ttl_secs: u64,
    #[serde(default = "default_handle_cache_cap")]
    pub handle_cache_cap: usize,
    #[serde(default = "default_handle_ttl_secs")]
    pub handle_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_cache_cap: default_chunk_cache_cap(),
            chunk_ttl_secs: default_chunk_ttl_secs(),
            handle_cache_cap: default_handle_cache_cap(),
            handle_ttl_secs: default_handle_ttl_secs(),
        }
    }
}

fn default_chunk_cache_cap() -> usize {
    50
}

fn default_chunk_ttl_secs() -> u64 {
    60
}

fn default_handle_cache_cap() -> usize {
    256
}

fn default_handle_ttl_secs() -> u64 {
    30 * 60
}
