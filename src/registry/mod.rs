//! Reader Registry: a `media_id -> ReaderEntry` map with TTL-based sweeping
//! (spec §4.5). Persistent readers accumulate sessions across requests so
//! long-lived streams get faster over time; non-persistent readers release
//! their lease as soon as the triggering range completes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::info;

use crate::cache::{ChunkCache, HandleCache};
use crate::catalog::CatalogStore;
use crate::common::types::MediaId;
use crate::pool::SessionPool;
use crate::reader::VirtualReader;

struct ReaderEntry {
    reader: Arc<VirtualReader>,
    last_touch: Instant,
}

/// Owns the shared pool/cache handles new readers are built from, and the
/// map of currently-registered persistent readers.
pub struct ReaderRegistry {
    entries: DashMap<MediaId, ReaderEntry>,
    catalog: Arc<dyn CatalogStore>,
    pool: Arc<SessionPool>,
    chunk_cache: Arc<ChunkCache>,
    handle_cache: Arc<HandleCache>,
    k_max: usize,
    scale_pressure_threshold: f64,
    reader_ttl: Duration,
    chunk_timeout: Duration,
    handle_refresh_timeout: Duration,
}

impl ReaderRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        pool: Arc<SessionPool>,
        chunk_cache: Arc<ChunkCache>,
        handle_cache: Arc<HandleCache>,
        k_max: usize,
        scale_pressure_threshold: f64,
        reader_ttl: Duration,
        chunk_timeout: Duration,
        handle_refresh_timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            catalog,
            pool,
            chunk_cache,
            handle_cache,
            k_max,
            scale_pressure_threshold,
            reader_ttl,
            chunk_timeout,
            handle_refresh_timeout,
        }
    }

    /// On hit, refreshes `last_touch` and returns the existing reader. On
    /// miss, loads the `Media` (with ordered parts) from the catalog and
    /// constructs a new reader; returns `Ok(None)` if the media has no
    /// parts or does not exist (spec §4.5).
    pub async fn get_or_create(
        &self,
        media_id: MediaId,
        persistent: bool,
    ) -> Result<Option<Arc<VirtualReader>>, crate::catalog::CatalogError> {
        if let Some(mut entry) = self.entries.get_mut(&media_id) {
            entry.last_touch = Instant::now();
            info!(
                media_id = %media_id,
                sessions = entry.reader.active_ranges(),
                "reusing cached reader"
            );
            return Ok(Some(entry.reader.clone()));
        }

        let Some(media) = self.catalog.get_media(media_id).await? else {
            return Ok(None);
        };
        if media.parts.is_empty() {
            return Ok(None);
        }

        let reader = Arc::new(VirtualReader::new(
            &media,
            self.pool.clone(),
            self.chunk_cache.clone(),
            self.handle_cache.clone(),
            self.k_max,
            self.scale_pressure_threshold,
            self.chunk_timeout,
            self.handle_refresh_timeout,
        ));

        if persistent {
            reader.mark_persistent();
            self.entries.insert(
                media_id,
                ReaderEntry { reader: reader.clone(), last_touch: Instant::now() },
            );
            info!(media_id = %media_id, "created persistent reader");
        }

        Ok(Some(reader))
    }

    /// Locates the entry, force-releases its lease even if ranges are still
    /// active, and removes it from the registry (spec §4.5).
    pub fn release(&self, media_id: MediaId) {
        if let Some((_, entry)) = self.entries.remove(&media_id) {
            entry.reader.force_release();
            info!(media_id = %media_id, "released reader");
        }
    }

    /// Periodic task: releases every entry idle longer than `reader_ttl`
    /// with no active ranges (spec §4.5).
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale: Vec<MediaId> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.last_touch) > self.reader_ttl && e.reader.active_ranges() == 0)
            .map(|e| *e.key())
            .collect();
        for media_id in stale {
            self.release(media_id);
        }
    }

    /// Force-releases every entry unconditionally, used on shutdown
    /// (spec §5).
    pub fn release_all(&self) {
        let ids: Vec<MediaId> = self.entries.iter().map(|e| *e.key()).collect();
        for media_id in ids {
            self.release(media_id);
        }
    }
}

/// Spawns the periodic sweep task.
pub fn spawn_sweep(
    registry: Arc<ReaderRegistry>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => registry.sweep(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackendClient;
    use crate::catalog::static_store::StaticCatalogStore;
    use crate::catalog::Part;
    use crate::common::types::{AccountId, PartId, CHUNK_SIZE};
    use crate::pool::{Account, SessionPool, Tier};

    fn registry_with_media(ttl: Duration) -> (Arc<ReaderRegistry>, MediaId) {
        let media_id = MediaId(1);
        let media = crate::catalog::Media {
            id: media_id,
            total_size: CHUNK_SIZE,
            duration_secs: None,
            parts: vec![Part {
                id: PartId(1),
                media_id,
                index: 0,
                size: CHUNK_SIZE,
                start_byte: 0,
                end_byte: CHUNK_SIZE,
                channel: 1,
                message: 1,
                handle: "boot".to_string(),
            }],
        };
        let catalog: Arc<dyn CatalogStore> = Arc::new(StaticCatalogStore::new().with_media(media));

        let backend = Arc::new(MockBackendClient::new());
        backend.put_document(1, 1, vec![0u8; CHUNK_SIZE as usize]);
        let pool = Arc::new(SessionPool::new(backend));
        pool.add_account(Account::new(AccountId(1), Tier::Premium, vec![]), 2);

        let chunk_cache = Arc::new(ChunkCache::new(50, Duration::from_secs(60)));
        let handle_cache = Arc::new(HandleCache::new(Duration::from_secs(1800)));

        let registry = Arc::new(ReaderRegistry::new(
            catalog,
            pool,
            chunk_cache,
            handle_cache,
            6,
            0.75,
            ttl,
            Duration::from_secs(20),
            Duration::from_secs(10),
        ));
        (registry, media_id)
    }

    #[tokio::test]
    async fn get_or_create_returns_none_for_unknown_media() {
        let (registry, _) = registry_with_media(Duration::from_secs(60));
        let result = registry.get_or_create(MediaId(999), false).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn persistent_reader_is_reused_across_calls() {
        let (registry, media_id) = registry_with_media(Duration::from_secs(60));

        let first = registry.get_or_create(media_id, true).await.unwrap().unwrap();
        let second = registry.get_or_create(media_id, true).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn sweep_releases_idle_entries_past_ttl() {
        let (registry, media_id) = registry_with_media(Duration::from_millis(1));

        registry.get_or_create(media_id, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.sweep();

        let again = registry.get_or_create(media_id, true).await.unwrap().unwrap();
        // A fresh reader was constructed since the old entry was swept away.
        assert_eq!(again.total_size, CHUNK_SIZE);
    }

    #[tokio::test]
    async fn release_force_releases_and_removes_entry() {
        let (registry, media_id) = registry_with_media(Duration::from_secs(60));

        let reader = registry.get_or_create(media_id, true).await.unwrap().unwrap();
        registry.release(media_id);
        assert!(reader.is_force_released());
    }
}

