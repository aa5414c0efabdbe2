//! Fetch Engine: streams a byte range of a single `Part` over a leased
//! `Session`, serving from the chunk cache first and falling back to the
//! backend with the retry/recovery state machine of spec §4.3.4.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendClient, BackendError, Handle};
use crate::cache::{ChunkCache, HandleCache};
use crate::catalog::Part;
use crate::common::errors::CoreError;
use crate::common::types::{CHUNK_SIZE, SessionId};

const MAX_ATTEMPTS: u32 = 5;
const MAX_CONSECUTIVE_INCOMPLETE: u32 = 3;

/// Parameters for one fetch invocation: a leased session, the part, and the
/// byte range (already known to lie fully inside the part).
pub struct FetchRequest<'a> {
    pub session: SessionId,
    pub part: &'a Part,
    pub byte_offset: u64,
    pub byte_length: u64,
}

/// Which recovery branch of spec §4.3.4/§4.3.5 a backend error falls into.
enum Category {
    HandleExpired,
    Backoff { wait_secs: u64 },
    Io,
    Fatal(String),
}

fn classify(err: &BackendError) -> Category {
    match err {
        BackendError::HandleExpired { .. } => Category::HandleExpired,
        BackendError::RateLimited { wait_secs } => Category::Backoff { wait_secs: *wait_secs },
        BackendError::Io(_) | BackendError::Desync => Category::Io,
        BackendError::Fatal(msg) => Category::Fatal(msg.clone()),
    }
}

/// Streams `request.byte_length` bytes starting at `request.byte_offset`
/// within `request.part`, invoking `on_bytes` for each blob in strictly
/// increasing byte order. Returns once the full range has been delivered,
/// the cancellation token fires, or the retry budget is exhausted.
pub async fn fetch<F>(
    backend: &Arc<dyn BackendClient>,
    chunk_cache: &ChunkCache,
    handle_cache: &HandleCache,
    request: FetchRequest<'_>,
    cancel: &CancellationToken,
    force_released: &AtomicBool,
    chunk_timeout: Duration,
    handle_refresh_timeout: Duration,
    mut on_bytes: F,
) -> Result<(), CoreError>
where
    F: FnMut(Bytes),
{
    let part = request.part;
    let q0 = request.byte_offset / CHUNK_SIZE;
    let r0 = request.byte_offset % CHUNK_SIZE;
    let q_end = (request.byte_offset + request.byte_length).div_ceil(CHUNK_SIZE);

    let mut remaining = request.byte_length;
    let mut skip = r0;
    let mut q_cur = q0;

    // Cache-serve phase (spec §4.3.2).
    while q_cur < q_end {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if force_released.load(Ordering::Relaxed) {
            debug!(part = %part.id, "fetch aborting: reader was force-released");
            return Ok(());
        }
        let Some(chunk) = chunk_cache.get_chunk(part.id, q_cur) else {
            break;
        };
        emit(&mut on_bytes, chunk, &mut skip, &mut remaining);
        q_cur += 1;
        if remaining == 0 {
            return Ok(());
        }
    }

    if remaining == 0 {
        return Ok(());
    }

    // Fetch phase state (spec §4.3.3, §4.3.4).
    let mut attempts: u32 = 0;
    let mut consecutive_incomplete: u32 = 0;
    let mut consecutive_io: u32 = 0;

    'attempt: loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if force_released.load(Ordering::Relaxed) {
            debug!(part = %part.id, "fetch aborting: reader was force-released");
            return Ok(());
        }
        if attempts >= MAX_ATTEMPTS {
            return Err(fatal("exhausted retry budget"));
        }

        let handle = match ensure_handle(backend, handle_cache, request.session, part, handle_refresh_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(CoreError::HandleRefreshFailed { source, .. }) => {
                handle_disposition(
                    classify(&source),
                    part,
                    chunk_cache,
                    handle_cache,
                    &mut attempts,
                    &mut consecutive_io,
                )
                .await?;
                continue 'attempt;
            }
            Err(other) => return Err(other),
        };
        let chunk_limit = q_end - q_cur;

        let mut stream = match backend.stream(request.session, &handle, q_cur, chunk_limit).await {
            Ok(s) => s,
            Err(err) => {
                handle_disposition(
                    classify(&err),
                    part,
                    chunk_cache,
                    handle_cache,
                    &mut attempts,
                    &mut consecutive_io,
                )
                .await?;
                continue 'attempt;
            }
        };

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if force_released.load(Ordering::Relaxed) {
                debug!(part = %part.id, "fetch aborting: reader was force-released");
                return Ok(());
            }

            let next = tokio::time::timeout(chunk_timeout, stream.next()).await;

            let item = match next {
                Ok(item) => item,
                Err(_elapsed) => {
                    let io_err = BackendError::Io("chunk fetch timed out".to_string());
                    handle_disposition(
                        classify(&io_err),
                        part,
                        chunk_cache,
                        handle_cache,
                        &mut attempts,
                        &mut consecutive_io,
                    )
                    .await?;
                    continue 'attempt;
                }
            };

            let Some(item) = item else {
                // Stream ended before delivering chunk_limit blobs: incomplete.
                consecutive_incomplete += 1;
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    return Err(fatal("exhausted retry budget on incomplete fetch"));
                }
                if consecutive_incomplete < MAX_CONSECUTIVE_INCOMPLETE {
                    let wait = Duration::from_secs(consecutive_incomplete as u64);
                    debug!(part = %part.id, wait_s = wait.as_secs(), "incomplete fetch, linear backoff");
                    tokio::time::sleep(wait).await;
                } else {
                    warn!(part = %part.id, "repeated incomplete fetches, forcing handle refresh");
                    handle_cache.invalidate(part.id, request.session);
                    consecutive_incomplete = 0;
                }
                continue 'attempt;
            };

            match item {
                Ok(blob) => {
                    chunk_cache.put_chunk(part.id, q_cur, blob.clone());
                    emit(&mut on_bytes, blob, &mut skip, &mut remaining);
                    q_cur += 1;
                    consecutive_incomplete = 0;
                    consecutive_io = 0;
                    if remaining == 0 {
                        return Ok(());
                    }
                }
                Err(err) => {
                    handle_disposition(
                        classify(&err),
                        part,
                        chunk_cache,
                        handle_cache,
                        &mut attempts,
                        &mut consecutive_io,
                    )
                    .await?;
                    continue 'attempt;
                }
            }
        }
    }
}

/// Applies the recovery branch selected by `classify`, advancing `attempts`
/// and `consecutive_io` per spec §4.3.4, then either returns (caller retries
/// immediately) or sleeps first.
async fn handle_disposition(
    category: Category,
    part: &Part,
    chunk_cache: &ChunkCache,
    handle_cache: &HandleCache,
    attempts: &mut u32,
    consecutive_io: &mut u32,
) -> Result<(), CoreError> {
    match category {
        Category::HandleExpired => {
            // A backend-reported expiry invalidates the part's handle for
            // every session, not just the one that hit it, and makes bytes
            // fetched under that handle suspect.
            handle_cache.invalidate_part_handles(part.id);
            chunk_cache.invalidate_part(part.id);
            *consecutive_io = 0;
            *attempts += 1;
            check_budget(*attempts)
        }
        Category::Backoff { wait_secs } => {
            // Does not count against attempts (spec §4.3.4).
            *consecutive_io = 0;
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
            Ok(())
        }
        Category::Io => {
            *attempts += 1;
            check_budget(*attempts)?;
            *consecutive_io += 1;
            // First retry is immediate to minimize visible stutter; later
            // ones back off exponentially capped at 8s (spec §4.3.4).
            let wait = if *consecutive_io <= 1 {
                Duration::from_secs(0)
            } else {
                Duration::from_secs((*consecutive_io as u64 * 2).min(8))
            };
            tokio::time::sleep(wait).await;
            Ok(())
        }
        Category::Fatal(msg) => Err(fatal(&msg)),
    }
}

fn check_budget(attempts: u32) -> Result<(), CoreError> {
    if attempts >= MAX_ATTEMPTS {
        Err(fatal("exhausted retry budget"))
    } else {
        Ok(())
    }
}

fn fatal(msg: &str) -> CoreError {
    CoreError::BackendUnavailable(BackendError::Fatal(msg.to_string()))
}

async fn ensure_handle(
    backend: &Arc<dyn BackendClient>,
    handle_cache: &HandleCache,
    session: SessionId,
    part: &Part,
    handle_refresh_timeout: Duration,
) -> Result<Handle, CoreError> {
    if let Some(handle) = handle_cache.get_handle(part.id, session) {
        return Ok(handle);
    }
    let doc = match tokio::time::timeout(
        handle_refresh_timeout,
        backend.fetch_message(session, part.channel, part.message),
    )
    .await
    {
        Ok(result) => result.map_err(|source| CoreError::HandleRefreshFailed { part: part.id.0, source })?,
        Err(_elapsed) => {
            return Err(CoreError::HandleRefreshFailed {
                part: part.id.0,
                source: BackendError::Io("handle refresh timed out".to_string()),
            });
        }
    };
    handle_cache.put_handle(part.id, session, doc.handle.clone());
    Ok(doc.handle)
}

fn emit<F: FnMut(Bytes)>(on_bytes: &mut F, mut chunk: Bytes, skip: &mut u64, remaining: &mut u64) {
    if *skip > 0 {
        if (chunk.len() as u64) <= *skip {
            *skip -= chunk.len() as u64;
            return;
        }
        chunk = chunk.split_off(*skip as usize);
        *skip = 0;
    }

    if chunk.is_empty() {
        return;
    }

    let len = chunk.len() as u64;
    if len > *remaining {
        let needed = *remaining as usize;
        let mut truncated = BytesMut::with_capacity(needed);
        truncated.extend_from_slice(&chunk[..needed]);
        on_bytes(truncated.freeze());
        *remaining = 0;
    } else {
        *remaining -= len;
        on_bytes(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackendClient;
    use crate::common::types::{MediaId, PartId};
    use std::time::Duration as StdDuration;

    fn test_part() -> Part {
        Part {
            id: PartId(1),
            media_id: MediaId(1),
            index: 0,
            size: CHUNK_SIZE * 3,
            start_byte: 0,
            end_byte: CHUNK_SIZE * 3,
            channel: 10,
            message: 20,
            handle: "bootstrap".to_string(),
        }
    }

    #[tokio::test]
    async fn serves_single_part_exact_range() {
        let backend = Arc::new(MockBackendClient::new());
        let body = vec![7u8; (CHUNK_SIZE * 2) as usize];
        backend.put_document(10, 20, body.clone());
        let backend: Arc<dyn BackendClient> = backend;

        let chunk_cache = ChunkCache::new(50, StdDuration::from_secs(60));
        let handle_cache = HandleCache::new(StdDuration::from_secs(1800));
        let part = test_part();
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        fetch(
            &backend,
            &chunk_cache,
            &handle_cache,
            FetchRequest {
                session: SessionId(1),
                part: &part,
                byte_offset: 0,
                byte_length: body.len() as u64,
            },
            &cancel,
            &AtomicBool::new(false),
            StdDuration::from_secs(20),
            StdDuration::from_secs(10),
            |b| out.extend_from_slice(&b),
        )
        .await
        .unwrap();

        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn sub_chunk_skip_and_truncate() {
        let backend = Arc::new(MockBackendClient::new());
        let body: Vec<u8> = (0..(CHUNK_SIZE * 2) as usize).map(|i| (i % 251) as u8).collect();
        backend.put_document(10, 20, body.clone());
        let backend: Arc<dyn BackendClient> = backend;

        let chunk_cache = ChunkCache::new(50, StdDuration::from_secs(60));
        let handle_cache = HandleCache::new(StdDuration::from_secs(1800));
        let part = test_part();
        let cancel = CancellationToken::new();

        let start = 10u64;
        let len = 100u64;
        let mut out = Vec::new();
        fetch(
            &backend,
            &chunk_cache,
            &handle_cache,
            FetchRequest {
                session: SessionId(1),
                part: &part,
                byte_offset: start,
                byte_length: len,
            },
            &cancel,
            &AtomicBool::new(false),
            StdDuration::from_secs(20),
            StdDuration::from_secs(10),
            |b| out.extend_from_slice(&b),
        )
        .await
        .unwrap();

        assert_eq!(out, body[start as usize..(start + len) as usize]);
    }

    #[tokio::test]
    async fn retries_past_rate_limit_without_counting_attempts() {
        let backend = Arc::new(MockBackendClient::new());
        let body = vec![9u8; CHUNK_SIZE as usize];
        backend.put_document(10, 20, body.clone());

        // Mint the handle up front so we can target the fault at it.
        let doc = backend.fetch_message(SessionId(1), 10, 20).await.unwrap();
        for _ in 0..4 {
            backend.inject_fault(&doc.handle, crate::backend::mock::Injected::RateLimited { wait_secs: 0 });
        }
        let backend: Arc<dyn BackendClient> = backend;

        let chunk_cache = ChunkCache::new(50, StdDuration::from_secs(60));
        let handle_cache = HandleCache::new(StdDuration::from_secs(1800));
        handle_cache.put_handle(PartId(1), SessionId(1), doc.handle.clone());
        let part = test_part();
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        fetch(
            &backend,
            &chunk_cache,
            &handle_cache,
            FetchRequest {
                session: SessionId(1),
                part: &part,
                byte_offset: 0,
                byte_length: body.len() as u64,
            },
            &cancel,
            &AtomicBool::new(false),
            StdDuration::from_secs(20),
            StdDuration::from_secs(10),
            |b| out.extend_from_slice(&b),
        )
        .await
        .unwrap();

        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn cancellation_stops_before_any_bytes() {
        let backend = Arc::new(MockBackendClient::new());
        backend.put_document(10, 20, vec![1u8; CHUNK_SIZE as usize]);
        let backend: Arc<dyn BackendClient> = backend;

        let chunk_cache = ChunkCache::new(50, StdDuration::from_secs(60));
        let handle_cache = HandleCache::new(StdDuration::from_secs(1800));
        let part = test_part();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut out = Vec::new();
        let result = fetch(
            &backend,
            &chunk_cache,
            &handle_cache,
            FetchRequest {
                session: SessionId(1),
                part: &part,
                byte_offset: 0,
                byte_length: CHUNK_SIZE,
            },
            &cancel,
            &AtomicBool::new(false),
            StdDuration::from_secs(20),
            StdDuration::from_secs(10),
            |b| out.extend_from_slice(&b),
        )
        .await;

        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn force_release_stops_before_any_bytes() {
        let backend = Arc::new(MockBackendClient::new());
        backend.put_document(10, 20, vec![1u8; (CHUNK_SIZE * 3) as usize]);
        let backend: Arc<dyn BackendClient> = backend;

        let chunk_cache = ChunkCache::new(50, StdDuration::from_secs(60));
        let handle_cache = HandleCache::new(StdDuration::from_secs(1800));
        let part = test_part();
        let cancel = CancellationToken::new();
        let force_released = AtomicBool::new(true);

        let mut out = Vec::new();
        let result = fetch(
            &backend,
            &chunk_cache,
            &handle_cache,
            FetchRequest {
                session: SessionId(1),
                part: &part,
                byte_offset: 0,
                byte_length: CHUNK_SIZE * 3,
            },
            &cancel,
            &force_released,
            StdDuration::from_secs(20),
            StdDuration::from_secs(10),
            |b| out.extend_from_slice(&b),
        )
        .await;

        assert!(result.is_ok());
        assert!(out.is_empty());
    }
}
