//! Session Pool: accounts, their sessions, tier-ordered selection and
//! account-level backoff (spec §4.2).

pub mod keepalive;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::BackendClient;
use crate::common::types::{AccountId, SessionId};

/// Relative priority of an account when selecting sessions. Premium accounts
/// are preferred over standard ones (spec §4.2 selection policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Standard,
    Premium,
}

/// One authenticated remote account, owning a fixed number of `Session`s
/// sized by tier (premium=6, standard=4; spec §3.1, §4.2).
pub struct Account {
    pub id: AccountId,
    pub tier: Tier,
    pub credentials: Vec<u8>,
    backoff_until: Mutex<Option<Instant>>,
}

impl Account {
    pub fn new(id: AccountId, tier: Tier, credentials: Vec<u8>) -> Self {
        Self {
            id,
            tier,
            credentials,
            backoff_until: Mutex::new(None),
        }
    }

    fn is_backed_off(&self) -> bool {
        match *self.backoff_until.lock() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let until = (*self.backoff_until.lock())?;
        let now = Instant::now();
        if until > now { Some(until - now) } else { None }
    }

    fn set_backoff(&self, duration: Duration) {
        *self.backoff_until.lock() = Some(Instant::now() + duration);
    }
}

/// One exclusively-leased connection to the backend. A `Session` is
/// single-threaded from the caller's perspective: the exclusive lease
/// enforces that (spec §5).
pub struct Session {
    pub id: SessionId,
    pub account: AccountId,
    pub tier: Tier,
}

/// Coarse lifecycle state of an account, derived from its backoff and
/// session-lease bookkeeping (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Active,
    Backoff,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub id: AccountId,
    pub tier: Tier,
    pub status: AccountState,
    pub total: usize,
    pub leased: usize,
    pub backoff_remaining_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub leased: usize,
    pub available: usize,
    pub pressure: f64,
    pub per_account: Vec<AccountStatus>,
}

struct PoolState {
    accounts: HashMap<AccountId, Arc<Account>>,
    /// All sessions, by id, regardless of lease state.
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Sessions currently free, grouped by tier-sorted account order is not
    /// precomputed — selection walks `accounts` each time since account
    /// counts are small (a handful).
    free: HashMap<SessionId, ()>,
}

/// Mutex-guarded table of accounts and sessions (spec §4.2). A single mutex
/// protects the leased/free bitmap and the account-backoff table; critical
/// sections are short and never held across an await.
pub struct SessionPool {
    state: Mutex<PoolState>,
    backend: Arc<dyn BackendClient>,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                accounts: HashMap::new(),
                sessions: HashMap::new(),
                free: HashMap::new(),
            }),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    /// Registers an account and mints its fixed allotment of sessions
    /// (premium=6, standard=4 by default, per `PoolConfig`).
    pub fn add_account(&self, account: Account, session_count: usize) {
        let account = Arc::new(account);
        let mut state = self.state.lock();
        for _ in 0..session_count {
            let session = Arc::new(Session {
                id: SessionId::generate(),
                account: account.id,
                tier: account.tier,
            });
            state.free.insert(session.id, ());
            state.sessions.insert(session.id, session);
        }
        state.accounts.insert(account.id, account);
    }

    pub fn remove_account(&self, id: AccountId) {
        let mut state = self.state.lock();
        state.accounts.remove(&id);
        let dead: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.account == id)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in dead {
            state.sessions.remove(&sid);
            state.free.remove(&sid);
        }
    }

    /// Non-blocking acquisition of one free session, preferring premium
    /// accounts, skipping backed-off accounts entirely (spec §4.2).
    pub fn try_acquire_one(&self) -> Option<Arc<Session>> {
        self.acquire(1).into_iter().next()
    }

    /// Non-blocking bulk acquisition of up to `n` free sessions in one
    /// critical section, tier-sorted the same way as `try_acquire_one`
    /// (spec §4.2: "returns up to n currently free Sessions... atomic w.r.t.
    /// concurrent acquirers"). Returns fewer than `n` (possibly zero) if the
    /// pool doesn't have that many usable sessions free.
    pub fn acquire(&self, n: usize) -> Vec<Arc<Session>> {
        if n == 0 {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let mut candidates: Vec<Arc<Session>> = state
            .free
            .keys()
            .filter_map(|sid| state.sessions.get(sid).cloned())
            .filter(|s| {
                state
                    .accounts
                    .get(&s.account)
                    .map(|a| !a.is_backed_off())
                    .unwrap_or(false)
            })
            .collect();

        candidates.sort_by(|a, b| b.tier.cmp(&a.tier));
        candidates.truncate(n);
        for s in &candidates {
            state.free.remove(&s.id);
        }
        candidates
    }

    pub fn release(&self, sessions: &[Arc<Session>]) {
        let mut state = self.state.lock();
        for s in sessions {
            if state.sessions.contains_key(&s.id) {
                state.free.insert(s.id, ());
            }
        }
    }

    pub fn pool_pressure(&self) -> f64 {
        let state = self.state.lock();
        let total = state.sessions.len();
        if total == 0 {
            return 0.0;
        }
        let leased = total - state.free.len();
        leased as f64 / total as f64
    }

    /// Marks `account` and all its sessions unusable until `now + seconds`.
    /// Already-leased sessions finish their current fetch; they are simply
    /// treated as unusable on release until the window passes, since
    /// acquisition re-checks `is_backed_off` rather than evicting eagerly.
    pub fn handle_backoff(&self, account: AccountId, seconds: u64) {
        let state = self.state.lock();
        if let Some(acc) = state.accounts.get(&account) {
            acc.set_backoff(Duration::from_secs(seconds));
        }
    }

    /// All currently-known session ids, leased or free. Used by the
    /// keep-alive task, which pings every session regardless of lease state.
    pub fn live_session_ids(&self) -> Vec<SessionId> {
        self.state.lock().sessions.keys().copied().collect()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let total = state.sessions.len();
        let available = state.free.len();
        let leased = total - available;
        let pressure = if total == 0 { 0.0 } else { leased as f64 / total as f64 };

        let per_account = state
            .accounts
            .values()
            .map(|acc| {
                let account_sessions: Vec<&Arc<Session>> = state
                    .sessions
                    .values()
                    .filter(|s| s.account == acc.id)
                    .collect();
                let account_total = account_sessions.len();
                let account_leased = account_sessions
                    .iter()
                    .filter(|s| !state.free.contains_key(&s.id))
                    .count();
                let backoff_remaining_s = acc.backoff_remaining().map(|d| d.as_secs());
                let status = if account_total == 0 {
                    AccountState::Offline
                } else if backoff_remaining_s.is_some() {
                    AccountState::Backoff
                } else {
                    AccountState::Active
                };
                AccountStatus {
                    id: acc.id,
                    tier: acc.tier,
                    status,
                    total: account_total,
                    leased: account_leased,
                    backoff_remaining_s,
                }
            })
            .collect();

        PoolStatus {
            total,
            leased,
            available,
            pressure,
            per_account,
        }
    }

    /// Stops and frees all sessions. Freeing here only means clearing the
    /// bookkeeping; any live transport state lives on the `BackendClient`
    /// implementation and is torn down by its own shutdown path.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.free.clear();
        state.sessions.clear();
        state.accounts.clear();
    }

    /// Exports every live session's backend state and writes it to `path` as
    /// a JSON array, so a future `main` can restore sessions without the
    /// backend re-authenticating each account from scratch (spec §6.2). Export
    /// failures for individual sessions are logged and skipped rather than
    /// aborting the whole persist pass.
    pub async fn persist_credentials(&self, path: &str) -> std::io::Result<()> {
        use base64::Engine;

        let sessions = self.live_session_ids();
        let mut exported = Vec::with_capacity(sessions.len());
        for session_id in sessions {
            match self.backend.export_state(session_id).await {
                Ok(blob) => exported.push(PersistedSession {
                    session: session_id,
                    state: base64::engine::general_purpose::STANDARD.encode(blob),
                }),
                Err(err) => {
                    tracing::warn!(session = %session_id, error = %err, "failed to export session state");
                }
            }
        }

        let json = serde_json::to_string_pretty(&exported)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    session: SessionId,
    state: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackendClient;

    fn pool() -> SessionPool {
        SessionPool::new(Arc::new(MockBackendClient::new()))
    }

    #[test]
    fn prefers_premium_over_standard() {
        let pool = pool();
        pool.add_account(Account::new(AccountId(1), Tier::Standard, vec![]), 2);
        pool.add_account(Account::new(AccountId(2), Tier::Premium, vec![]), 2);

        let first = pool.try_acquire_one().unwrap();
        assert_eq!(first.tier, Tier::Premium);
    }

    #[test]
    fn backed_off_account_is_skipped() {
        let pool = pool();
        pool.add_account(Account::new(AccountId(1), Tier::Premium, vec![]), 1);
        pool.add_account(Account::new(AccountId(2), Tier::Standard, vec![]), 1);

        pool.handle_backoff(AccountId(1), 60);
        let session = pool.try_acquire_one().unwrap();
        assert_eq!(session.account, AccountId(2));
    }

    #[tokio::test]
    async fn persist_credentials_writes_exported_state() {
        let pool = pool();
        pool.add_account(Account::new(AccountId(1), Tier::Premium, vec![]), 2);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("streamvault-session-state-{}.json", SessionId::generate().0));
        let path = path.to_str().unwrap().to_string();

        pool.persist_credentials(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<PersistedSession> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(|p| !p.state.is_empty()));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn acquire_returns_up_to_n_tier_sorted_sessions() {
        let pool = pool();
        pool.add_account(Account::new(AccountId(1), Tier::Standard, vec![]), 2);
        pool.add_account(Account::new(AccountId(2), Tier::Premium, vec![]), 2);

        let batch = pool.acquire(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].tier, Tier::Premium);
        assert_eq!(batch[1].tier, Tier::Premium);

        let rest = pool.acquire(10);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn pool_pressure_reflects_leased_fraction() {
        let pool = pool();
        pool.add_account(Account::new(AccountId(1), Tier::Premium, vec![]), 4);
        assert_eq!(pool.pool_pressure(), 0.0);

        let s1 = pool.try_acquire_one().unwrap();
        let s2 = pool.try_acquire_one().unwrap();
        assert_eq!(pool.pool_pressure(), 0.5);

        pool.release(&[s1, s2]);
        assert_eq!(pool.pool_pressure(), 0.0);
    }

    #[test]
    fn account_status_reflects_backoff_state() {
        let pool = pool();
        pool.add_account(Account::new(AccountId(1), Tier::Premium, vec![]), 2);

        let before = pool.status().per_account[0].clone();
        assert_eq!(before.status, AccountState::Active);
        assert!(before.backoff_remaining_s.is_none());

        pool.handle_backoff(AccountId(1), 60);
        let after = pool.status().per_account[0].clone();
        assert_eq!(after.status, AccountState::Backoff);
        assert!(after.backoff_remaining_s.is_some());
    }
}
