//! Virtual Reader: a file-like view over an ordered sequence of `Part`s,
//! backed by a lease of one or more pool `Session`s (spec §4.4).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{ChunkCache, HandleCache};
use crate::catalog::{Media, Part};
use crate::common::errors::CoreError;
use crate::fetch::{self, FetchRequest};
use crate::pool::{Session, SessionPool};

struct LeaseState {
    sessions: Vec<Arc<Session>>,
    rr: usize,
}

/// Holds the ordered parts of one `Media`, a lease of sessions, and the
/// bookkeeping flags described in spec §4.4.
pub struct VirtualReader {
    parts: Vec<Part>,
    pub total_size: u64,
    pub duration_secs: Option<u64>,
    pool: Arc<SessionPool>,
    chunk_cache: Arc<ChunkCache>,
    handle_cache: Arc<HandleCache>,
    lease: Mutex<LeaseState>,
    active_ranges: AtomicU64,
    batch_mode: AtomicBool,
    persistent: AtomicBool,
    force_released: AtomicBool,
    k_max: usize,
    scale_pressure_threshold: f64,
    chunk_timeout: Duration,
    handle_refresh_timeout: Duration,
}

impl VirtualReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media: &Media,
        pool: Arc<SessionPool>,
        chunk_cache: Arc<ChunkCache>,
        handle_cache: Arc<HandleCache>,
        k_max: usize,
        scale_pressure_threshold: f64,
        chunk_timeout: Duration,
        handle_refresh_timeout: Duration,
    ) -> Self {
        Self {
            parts: media.parts.clone(),
            total_size: media.total_size,
            duration_secs: media.duration_secs,
            pool,
            chunk_cache,
            handle_cache,
            lease: Mutex::new(LeaseState { sessions: Vec::new(), rr: 0 }),
            active_ranges: AtomicU64::new(0),
            batch_mode: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            force_released: AtomicBool::new(false),
            k_max,
            scale_pressure_threshold,
            chunk_timeout,
            handle_refresh_timeout,
        }
    }

    pub fn mark_persistent(&self) {
        self.persistent.store(true, Ordering::Relaxed);
    }

    pub fn active_ranges(&self) -> u64 {
        self.active_ranges.load(Ordering::Relaxed)
    }

    pub fn is_force_released(&self) -> bool {
        self.force_released.load(Ordering::Relaxed)
    }

    /// `locate(byte_offset) -> (part, local_offset)` (spec §4.4.1). Linear
    /// scan with early exit; the part count is small (at most a few dozen).
    fn locate(&self, byte_offset: u64) -> Option<(&Part, u64)> {
        if byte_offset >= self.total_size {
            return None;
        }
        for part in &self.parts {
            if byte_offset >= part.start_byte && byte_offset < part.end_byte {
                return Some((part, byte_offset - part.start_byte));
            }
        }
        None
    }

    fn try_scale_up(&self) {
        let mut lease = self.lease.lock();
        if lease.sessions.len() >= self.k_max {
            return;
        }
        if self.pool.pool_pressure() > self.scale_pressure_threshold {
            return;
        }
        if let Some(session) = self.pool.try_acquire_one() {
            debug!(reader_sessions = lease.sessions.len() + 1, "scale-up");
            lease.sessions.push(session);
        }
    }

    fn try_scale_down(&self) {
        let mut lease = self.lease.lock();
        if lease.sessions.len() <= 1 {
            return;
        }
        if self.pool.pool_pressure() <= self.scale_pressure_threshold {
            return;
        }
        if let Some(session) = lease.sessions.pop() {
            debug!(reader_sessions = lease.sessions.len(), "scale-down");
            self.pool.release(&[session]);
        }
    }

    fn ensure_lease(&self) -> Result<(), CoreError> {
        let mut lease = self.lease.lock();
        if !lease.sessions.is_empty() {
            return Ok(());
        }
        let session = self.pool.try_acquire_one().ok_or(CoreError::NoWorkers)?;
        lease.sessions.push(session);
        Ok(())
    }

    /// Primary operation (spec §4.4.2). Pre-conditions are clamped per spec:
    /// an out-of-range or empty request yields nothing rather than erroring.
    pub async fn read_range(
        self: &Arc<Self>,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
        mut on_bytes: impl FnMut(Bytes),
    ) -> Result<(), CoreError> {
        let end = end.min(self.total_size);
        if start >= end {
            return Ok(());
        }

        self.active_ranges.fetch_add(1, Ordering::Relaxed);
        let result = self.read_range_inner(start, end, cancel, &mut on_bytes).await;
        self.active_ranges.fetch_sub(1, Ordering::Relaxed);

        if !self.persistent.load(Ordering::Relaxed) && !self.batch_mode.load(Ordering::Relaxed) {
            let mut lease = self.lease.lock();
            if !lease.sessions.is_empty() {
                self.pool.release(&lease.sessions);
                lease.sessions.clear();
            }
        }

        result
    }

    async fn read_range_inner(
        &self,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
        on_bytes: &mut impl FnMut(Bytes),
    ) -> Result<(), CoreError> {
        self.ensure_lease()?;

        if !self.batch_mode.load(Ordering::Relaxed) {
            self.try_scale_down();
            self.try_scale_up();
        }

        let session = {
            let mut lease = self.lease.lock();
            if lease.sessions.is_empty() {
                return Err(CoreError::NoWorkers);
            }
            let idx = lease.rr % lease.sessions.len();
            lease.rr = lease.rr.wrapping_add(1);
            lease.sessions[idx].clone()
        };

        let mut cur = start;
        while cur < end {
            if self.force_released.load(Ordering::Relaxed) {
                info!("read_range aborting: reader was force-released");
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let Some((part, local_offset)) = self.locate(cur) else {
                break;
            };
            let len = (end - cur).min(part.end_byte - cur);

            fetch::fetch(
                self.pool.backend(),
                &self.chunk_cache,
                &self.handle_cache,
                FetchRequest {
                    session: session.id,
                    part,
                    byte_offset: local_offset,
                    byte_length: len,
                },
                cancel,
                &self.force_released,
                self.chunk_timeout,
                self.handle_refresh_timeout,
                |blob| {
                    cur += blob.len() as u64;
                    on_bytes(blob);
                },
            )
            .await?;
        }

        Ok(())
    }

    /// Scoped acquisition of the lease with guaranteed release on drop
    /// (spec §4.4.4). While the guard is alive, `read_range` does not
    /// release the lease on completion.
    pub fn batch_mode(self: &Arc<Self>) -> BatchGuard {
        self.batch_mode.store(true, Ordering::Relaxed);
        let _ = self.ensure_lease();
        BatchGuard { reader: self.clone() }
    }

    /// Sets `force_released` and returns all sessions unconditionally, even
    /// if ranges are still active (spec §4.4.5).
    pub fn force_release(&self) {
        self.force_released.store(true, Ordering::Relaxed);
        let mut lease = self.lease.lock();
        if !lease.sessions.is_empty() {
            self.pool.release(&lease.sessions);
            lease.sessions.clear();
        }
    }
}

/// Guard returned by [`VirtualReader::batch_mode`]. Releases the lease when
/// dropped, regardless of exit path.
pub struct BatchGuard {
    reader: Arc<VirtualReader>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.reader.batch_mode.store(false, Ordering::Relaxed);
        if !self.reader.persistent.load(Ordering::Relaxed) {
            let mut lease = self.reader.lease.lock();
            if !lease.sessions.is_empty() {
                self.reader.pool.release(&lease.sessions);
                lease.sessions.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::backend::mock::MockBackendClient;
    use crate::backend::BackendClient;
    use crate::cache::{ChunkCache, HandleCache};
    use crate::common::types::{AccountId, MediaId, PartId, CHUNK_SIZE};
    use crate::pool::{Account, Tier};

    fn two_part_media(part_size: u64) -> (Media, Vec<u8>, Vec<u8>) {
        let body_a: Vec<u8> = (0..part_size as usize).map(|i| (i % 251) as u8).collect();
        let body_b: Vec<u8> = (0..part_size as usize).map(|i| ((i * 7) % 251) as u8).collect();

        let media = Media {
            id: MediaId(1),
            total_size: part_size * 2,
            duration_secs: None,
            parts: vec![
                Part {
                    id: PartId(1),
                    media_id: MediaId(1),
                    index: 0,
                    size: part_size,
                    start_byte: 0,
                    end_byte: part_size,
                    channel: 1,
                    message: 1,
                    handle: "boot-a".to_string(),
                },
                Part {
                    id: PartId(2),
                    media_id: MediaId(1),
                    index: 1,
                    size: part_size,
                    start_byte: part_size,
                    end_byte: part_size * 2,
                    channel: 1,
                    message: 2,
                    handle: "boot-b".to_string(),
                },
            ],
        };
        (media, body_a, body_b)
    }

    fn make_reader(media: &Media, backend: Arc<dyn BackendClient>) -> Arc<VirtualReader> {
        let pool = Arc::new(crate::pool::SessionPool::new(backend));
        pool.add_account(Account::new(AccountId(1), Tier::Premium, vec![]), 4);
        let chunk_cache = Arc::new(ChunkCache::new(50, std::time::Duration::from_secs(60)));
        let handle_cache = Arc::new(HandleCache::new(std::time::Duration::from_secs(1800)));
        Arc::new(VirtualReader::new(
            media,
            pool,
            chunk_cache,
            handle_cache,
            6,
            0.75,
            std::time::Duration::from_secs(20),
            std::time::Duration::from_secs(10),
        ))
    }

    async fn read_all(reader: &Arc<VirtualReader>, start: u64, end: u64) -> Vec<u8> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        reader.read_range(start, end, &cancel, |b| out.extend_from_slice(&b)).await.unwrap();
        out
    }

    #[tokio::test]
    async fn read_range_crosses_part_seam() {
        let part_size = CHUNK_SIZE * 2;
        let (media, body_a, body_b) = two_part_media(part_size);

        let backend = Arc::new(MockBackendClient::new());
        backend.put_document(1, 1, body_a.clone());
        backend.put_document(1, 2, body_b.clone());
        let reader = make_reader(&media, backend);

        let full: Vec<u8> = body_a.iter().chain(body_b.iter()).copied().collect();
        let start = part_size - 10;
        let end = part_size + 10;
        let out = read_all(&reader, start, end).await;

        assert_eq!(out, full[start as usize..end as usize]);
    }

    #[tokio::test]
    async fn release_after_release_all_yields_no_bytes() {
        let part_size = CHUNK_SIZE;
        let (media, body_a, _) = two_part_media(part_size);

        let backend = Arc::new(MockBackendClient::new());
        backend.put_document(1, 1, body_a.clone());
        backend.put_document(1, 2, vec![0u8; part_size as usize]);
        let reader = make_reader(&media, backend);

        reader.force_release();
        let out = read_all(&reader, 0, part_size).await;
        assert!(out.is_empty());
    }

    proptest! {
        #[test]
        fn partition_concatenation_matches_whole_range(
            cut in 1u64..(CHUNK_SIZE),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let part_size = CHUNK_SIZE;
                let (media, body_a, body_b) = two_part_media(part_size);

                let backend = Arc::new(MockBackendClient::new());
                backend.put_document(1, 1, body_a.clone());
                backend.put_document(1, 2, body_b.clone());
                let reader = make_reader(&media, backend);

                let whole = read_all(&reader, 0, part_size * 2).await;

                let backend2 = Arc::new(MockBackendClient::new());
                backend2.put_document(1, 1, body_a.clone());
                backend2.put_document(1, 2, body_b.clone());
                let reader2 = make_reader(&media, backend2);

                let mut partitioned = read_all(&reader2, 0, cut).await;
                partitioned.extend(read_all(&reader2, cut, part_size * 2).await);

                prop_assert_eq!(whole, partitioned);
                Ok(())
            })?;
        }
    }
}
