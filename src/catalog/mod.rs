//! Catalog store: read-only (from the core's perspective) source of truth
//! for `Media` and its ordered `Part`s (spec §6.1).

pub mod sqlite;
pub mod static_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::types::{MediaId, PartId};

/// One upstream object backing a contiguous byte range of a `Media`.
/// `start_byte`/`end_byte` are absolute offsets within the media, not the
/// part itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: PartId,
    pub media_id: MediaId,
    pub index: u32,
    pub size: u64,
    pub start_byte: u64,
    pub end_byte: u64,
    pub channel: i64,
    pub message: i64,
    /// Bootstrap handle value. May be stale; refreshed on first use per
    /// session and never written back here (spec §6.1).
    pub handle: String,
}

/// A streamable item: its total size and ordered parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: MediaId,
    pub total_size: u64,
    /// Ordered by `Part::index`.
    pub parts: Vec<Part>,
    /// Optional known duration, surfaced through `Reader.duration` (spec §6.3).
    pub duration_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("media {0} not found")]
    NotFound(MediaId),
    #[error("store error: {0}")]
    Store(String),
}

/// Source of `Media`/`Part` data consumed by the Reader Registry (spec §4.5,
/// §6.1). The core never writes through this trait on its hot path.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_media(&self, media_id: MediaId) -> Result<Option<Media>, CatalogError>;
}
