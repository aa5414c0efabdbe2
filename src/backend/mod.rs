//! Client surface for the chat/RPC backend that actually holds the media
//! bytes. A real deployment talks to a remote service over some transport;
//! tests and local development use [`mock::MockBackendClient`].

pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::types::{PartId, SessionId};

/// Opaque per-session handle minted by [`BackendClient::fetch_message`].
/// Treated as a bootstrap value by the catalog store; the core never writes
/// a refreshed handle back to the relational store, only to the in-memory
/// [`crate::cache::HandleCache`] (spec §4.3.3, §6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle(pub String);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of `fetch_message`: a handle plus the size the backend reports for
/// the underlying document, used as a sanity check against the catalog.
#[derive(Debug, Clone)]
pub struct Document {
    pub handle: Handle,
    pub size: u64,
}

/// One blob yielded by [`BackendClient::stream`]. Never larger than
/// [`crate::common::types::CHUNK_SIZE`].
pub type Chunk = bytes::Bytes;

/// Failure categories a backend call can surface, matching the
/// classification table in spec §4.3.5. The Fetch Engine state machine
/// matches on these variants directly; adding a new transient category here
/// must be mirrored there.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("handle expired for part {part}")]
    HandleExpired { part: PartId },

    #[error("rate limited, retry after {wait_secs}s")]
    RateLimited { wait_secs: u64 },

    #[error("transport error: {0}")]
    Io(String),

    #[error("session desynchronized")]
    Desync,

    #[error("fatal backend error: {0}")]
    Fatal(String),
}

/// Per-session RPC surface the Fetch Engine and Session Pool drive (spec
/// §6.2). Every method is issued over a specific, already-leased
/// [`crate::pool::Session`] — implementations must not share transport state
/// across sessions.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Mints or refreshes a handle for `(channel, message)`. Synchronous RPC
    /// used on first use per session and whenever a handle is invalidated.
    async fn fetch_message(
        &self,
        session: SessionId,
        channel: i64,
        message: i64,
    ) -> Result<Document, BackendError>;

    /// Streams up to `chunk_limit` blobs of up to one chunk each, starting at
    /// `chunk_offset`, for the given handle. May terminate before delivering
    /// `chunk_limit` blobs (an "incomplete" fetch, spec §4.3.3); may fail
    /// with any [`BackendError`] variant.
    async fn stream(
        &self,
        session: SessionId,
        handle: &Handle,
        chunk_offset: u64,
        chunk_limit: u64,
    ) -> Result<Box<dyn futures::Stream<Item = Result<Chunk, BackendError>> + Send + Unpin>, BackendError>;

    /// Keep-alive no-op, issued on a 30s cadence by the pool's keep-alive
    /// task (spec §5).
    async fn ping(&self, session: SessionId) -> Result<(), BackendError>;

    /// Serializes whatever state lets this session's credentials survive a
    /// process restart. Persisted by the Session Pool bootstrap (spec §6.2).
    async fn export_state(&self, session: SessionId) -> Result<Vec<u8>, BackendError>;
}
