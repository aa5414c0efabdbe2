use serde::{Deserialize, Serialize};

/// Tunables for the Virtual Reader and Reader Registry (spec §4.4, §4.5).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReaderConfig {
    #[serde(default = "default_k_max")]
    pub k_max_sessions: usize,
    #[serde(default = "default_pressure_threshold")]
    pub scale_pressure_threshold: f64,
    #[serde(default = "default_reader_ttl_secs")]
    pub reader_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_handle_refresh_timeout_secs")]
    pub handle_refresh_timeout_secs: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            k_max_sessions: default_k_max(),
            scale_pressure_threshold: default_pressure_threshold(),
            reader_ttl_secs: default_reader_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            handle_refresh_timeout_secs: default_handle_refresh_timeout_secs(),
        }
    }
}

fn default_k_max() -> usize {
    6
}

fn default_pressure_threshold() -> f64 {
    0.75
}

fn default_reader_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_chunk_timeout_secs() -> u64 {
    20
}

fn default_handle_refresh_timeout_secs() -> u64 {
    10
}
