//! Chunk Cache and Handle Cache (spec §3, §4.1). Both are small, TTL-bounded
//! maps guarded by their own `parking_lot` mutex; neither is ever held
//! across an `.await`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::Handle;
use crate::common::types::{PartId, SessionId};

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

/// LRU-ish, TTL-bounded cache of `(part, chunk_index) -> bytes`, grounded in
/// the original system's chunk cache (50 entries, 60s TTL).
pub struct ChunkCache {
    cap: usize,
    ttl: Duration,
    entries: Mutex<HashMap<(PartId, u64), Entry<Bytes>>>,
}

impl ChunkCache {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            cap,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_chunk(&self, part: PartId, chunk_index: u64) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        let key = (part, chunk_index);
        if let Some(entry) = entries.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
            entries.remove(&key);
        }
        None
    }

    pub fn put_chunk(&self, part: PartId, chunk_index: u64, data: Bytes) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);

        while entries.len() >= self.cap {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| *k)
            else {
                break;
            };
            entries.remove(&oldest);
        }

        entries.insert((part, chunk_index), Entry { value: data, inserted_at: now });
    }

    /// Drops every cached chunk for `part`. Used when a part's handle is
    /// invalidated in a way that makes previously cached bytes suspect.
    pub fn invalidate_part(&self, part: PartId) {
        self.entries.lock().retain(|(p, _), _| *p != part);
    }
}

/// TTL-bounded cache of the per-session handle minted for a part, keyed by
/// `(part, session)` so that handles never leak across sessions (spec
/// §4.3.3: "this in-memory update is per-session only").
pub struct HandleCache {
    ttl: Duration,
    entries: Mutex<HashMap<(PartId, SessionId), Entry<Handle>>>,
}

impl HandleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_handle(&self, part: PartId, session: SessionId) -> Option<Handle> {
        let mut entries = self.entries.lock();
        let key = (part, session);
        if let Some(entry) = entries.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
            entries.remove(&key);
        }
        None
    }

    pub fn put_handle(&self, part: PartId, session: SessionId, handle: Handle) {
        self.entries.lock().insert(
            (part, session),
            Entry { value: handle, inserted_at: Instant::now() },
        );
    }

    pub fn invalidate(&self, part: PartId, session: SessionId) {
        self.entries.lock().remove(&(part, session));
    }

    /// Drops every session's cached handle for `part`, analogous to
    /// `ChunkCache::invalidate_part`. Used when a part's handle is known bad
    /// regardless of which session minted it (spec §4.1).
    pub fn invalidate_part_handles(&self, part: PartId) {
        self.entries.lock().retain(|(p, _), _| *p != part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_cache_hits_before_ttl_and_misses_after() {
        let cache = ChunkCache::new(10, Duration::from_millis(20));
        cache.put_chunk(PartId(1), 0, Bytes::from_static(b"abc"));
        assert_eq!(cache.get_chunk(PartId(1), 0).as_deref(), Some(&b"abc"[..]));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get_chunk(PartId(1), 0), None);
    }

    #[test]
    fn chunk_cache_evicts_oldest_over_capacity() {
        let cache = ChunkCache::new(2, Duration::from_secs(60));
        cache.put_chunk(PartId(1), 0, Bytes::from_static(b"a"));
        cache.put_chunk(PartId(1), 1, Bytes::from_static(b"b"));
        cache.put_chunk(PartId(1), 2, Bytes::from_static(b"c"));
        assert_eq!(cache.get_chunk(PartId(1), 0), None);
        assert!(cache.get_chunk(PartId(1), 1).is_some());
        assert!(cache.get_chunk(PartId(1), 2).is_some());
    }

    #[test]
    fn invalidate_part_handles_drops_every_session_for_that_part() {
        let cache = HandleCache::new(Duration::from_secs(60));
        cache.put_handle(PartId(1), SessionId(1), Handle("h1".to_string()));
        cache.put_handle(PartId(1), SessionId(2), Handle("h2".to_string()));
        cache.put_handle(PartId(2), SessionId(1), Handle("other-part".to_string()));

        cache.invalidate_part_handles(PartId(1));

        assert!(cache.get_handle(PartId(1), SessionId(1)).is_none());
        assert!(cache.get_handle(PartId(1), SessionId(2)).is_none());
        assert!(cache.get_handle(PartId(2), SessionId(1)).is_some());
    }

    #[test]
    fn handle_cache_is_scoped_per_session() {
        let cache = HandleCache::new(Duration::from_secs(60));
        cache.put_handle(PartId(1), SessionId(1), Handle("h1".to_string()));
        assert!(cache.get_handle(PartId(1), SessionId(2)).is_none());
        assert_eq!(
            cache.get_handle(PartId(1), SessionId(1)).map(|h| h.0),
            Some("h1".to_string())
        );
    }
}
