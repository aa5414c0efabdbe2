use serde::{Deserialize, Serialize};

/// Tunables for the Session Pool (spec §3.1, §4.2).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_premium_sessions")]
    pub premium_sessions_per_account: u32,
    #[serde(default = "default_standard_sessions")]
    pub standard_sessions_per_account: u32,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    /// Where the account bootstrap list (id/tier/credentials) is read from at
    /// startup.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    /// Where each live session's exported backend state is written on
    /// shutdown, for diagnostics and future warm-restart support.
    #[serde(default = "default_session_state_path")]
    pub session_state_path: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            premium_sessions_per_account: default_premium_sessions(),
            standard_sessions_per_account: default_standard_sessions(),
            keepalive_interval_secs: default_keepalive_secs(),
            credentials_path: default_credentials_path(),
            session_state_path: default_session_state_path(),
        }
    }
}

fn default_premium_sessions() -> u32 {
    6
}

fn default_standard_sessions() -> u32 {
    4
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_credentials_path() -> String {
    "accounts.json".to_string()
}

fn default_session_state_path() -> String {
    "session_state.json".to_string()
}
