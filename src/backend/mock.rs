//! In-memory [`BackendClient`] used by tests and the `StaticCatalogStore`
//! demo setup. Holds a fixed byte buffer per `(channel, message)` and serves
//! it in [`crate::common::types::CHUNK_SIZE`]-sized blobs.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_stream as stream;

use crate::common::types::{CHUNK_SIZE, PartId, SessionId};

use super::{BackendClient, BackendError, Chunk, Document, Handle};

/// A scripted failure injected on the `nth` call to `stream` for a given
/// handle, consumed once then removed.
#[derive(Debug, Clone)]
pub enum Injected {
    HandleExpired,
    RateLimited { wait_secs: u64 },
    Io,
    Desync,
    Fatal,
    /// Terminate the stream after `after` chunks instead of erroring.
    Incomplete { after: usize },
}

#[derive(Default)]
struct Inner {
    documents: HashMap<(i64, i64), Vec<u8>>,
    handles: HashMap<String, (i64, i64)>,
    next_handle: u64,
    faults: HashMap<String, Vec<Injected>>,
}

/// Deterministic stand-in for a remote backend, for unit and property tests.
pub struct MockBackendClient {
    inner: Mutex<Inner>,
}

impl MockBackendClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registers a document body addressable as `(channel, message)`.
    pub fn put_document(&self, channel: i64, message: i64, body: Vec<u8>) {
        self.inner.lock().documents.insert((channel, message), body);
    }

    /// Queues a fault to be returned the next time `stream` is called on
    /// `handle`, consumed in FIFO order.
    pub fn inject_fault(&self, handle: &Handle, fault: Injected) {
        self.inner
            .lock()
            .faults
            .entry(handle.0.clone())
            .or_default()
            .push(fault);
    }
}

impl Default for MockBackendClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendClient for MockBackendClient {
    async fn fetch_message(
        &self,
        _session: SessionId,
        channel: i64,
        message: i64,
    ) -> Result<Document, BackendError> {
        let mut inner = self.inner.lock();
        let size = inner
            .documents
            .get(&(channel, message))
            .map(|b| b.len() as u64)
            .ok_or_else(|| BackendError::Fatal("no such message".to_string()))?;
        inner.next_handle += 1;
        let handle = Handle(format!("h{}", inner.next_handle));
        inner.handles.insert(handle.0.clone(), (channel, message));
        Ok(Document { handle, size })
    }

    async fn stream(
        &self,
        _session: SessionId,
        handle: &Handle,
        chunk_offset: u64,
        chunk_limit: u64,
    ) -> Result<Box<dyn futures::Stream<Item = Result<Chunk, BackendError>> + Send + Unpin>, BackendError>
    {
        let fault = {
            let mut inner = self.inner.lock();
            inner
                .faults
                .get_mut(&handle.0)
                .and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) })
        };

        if let Some(fault) = &fault {
            match fault {
                Injected::HandleExpired => {
                    return Err(BackendError::HandleExpired {
                        part: PartId(0),
                    });
                }
                Injected::RateLimited { wait_secs } => {
                    return Err(BackendError::RateLimited {
                        wait_secs: *wait_secs,
                    });
                }
                Injected::Io => return Err(BackendError::Io("mock io failure".to_string())),
                Injected::Desync => return Err(BackendError::Desync),
                Injected::Fatal => return Err(BackendError::Fatal("mock fatal".to_string())),
                Injected::Incomplete { .. } => {}
            }
        }

        let (channel, message) = {
            let inner = self.inner.lock();
            *inner
                .handles
                .get(&handle.0)
                .ok_or_else(|| BackendError::HandleExpired { part: PartId(0) })?
        };

        let body = {
            let inner = self.inner.lock();
            inner
                .documents
                .get(&(channel, message))
                .cloned()
                .ok_or_else(|| BackendError::Fatal("document vanished".to_string()))?
        };

        let start = (chunk_offset * CHUNK_SIZE) as usize;
        let mut blobs: Vec<Result<Chunk, BackendError>> = Vec::new();
        let mut pos = start;
        for i in 0..chunk_limit {
            if pos >= body.len() {
                break;
            }
            if let Some(Injected::Incomplete { after }) = &fault {
                if i as usize >= *after {
                    break;
                }
            }
            let end = (pos + CHUNK_SIZE as usize).min(body.len());
            blobs.push(Ok(Bytes::copy_from_slice(&body[pos..end])));
            pos = end;
        }

        Ok(Box::new(stream::iter(blobs)))
    }

    async fn ping(&self, _session: SessionId) -> Result<(), BackendError> {
        Ok(())
    }

    async fn export_state(&self, _session: SessionId) -> Result<Vec<u8>, BackendError> {
        Ok(b"mock-state".to_vec())
    }
}
