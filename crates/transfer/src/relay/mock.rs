//! In-memory relay for testing.

use super::{ByteStream, FetchRequest, Relay};
use crate::descriptor::Variant;
use crate::error::{ErrorKind, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::TryStreamExt;
use mirage_storage::FileHash;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, watch};

const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Holds back delivery until opened. Dropping it unopened makes the held
/// transfer fail with a network error.
pub struct DeliveryGate {
    tx: watch::Sender<bool>,
}
impl DeliveryGate {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone)]
struct Served {
    data: Vec<u8>,
    gate: Option<watch::Receiver<bool>>,
    /// Fail with a network error before yielding this chunk.
    fail_at_chunk: Option<usize>,
}

/// In-memory relay for testing.
///
/// Files are served from a map keyed by digest; anything not in the map is
/// reported as missing on the server. Uploads are collected and can be
/// inspected afterwards.
pub struct MockRelay {
    files: RwLock<HashMap<FileHash, Served>>,
    pushed: RwLock<HashMap<FileHash, (Variant, Vec<u8>)>>,
    push_gate: RwLock<Option<watch::Receiver<bool>>>,
    fetches: AtomicUsize,
    chunk_size: usize,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self {
            files: RwLock::default(),
            pushed: RwLock::default(),
            push_gate: RwLock::default(),
            fetches: AtomicUsize::new(0),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MockRelay {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn insert(&self, hash: FileHash, served: Served) {
        self.files.write().await.insert(hash, served);
    }

    /// Serve `data` under its own digest.
    pub async fn serve(&self, data: Vec<u8>) -> FileHash {
        let hash = FileHash::digest(&data);
        self.serve_as(hash, data).await;
        hash
    }

    /// Serve `data` under any hash, including one it doesn't match.
    pub async fn serve_as(&self, hash: FileHash, data: Vec<u8>) {
        self.insert(hash, Served { data, gate: None, fail_at_chunk: None }).await;
    }

    /// Serve `data`, but only start sending once the returned gate opens.
    pub async fn serve_gated(&self, data: Vec<u8>) -> (FileHash, DeliveryGate) {
        let hash = FileHash::digest(&data);
        let (gate, rx) = DeliveryGate::new();
        self.insert(hash, Served { data, gate: Some(rx), fail_at_chunk: None }).await;
        (hash, gate)
    }

    /// Serve `data`, dropping the connection before chunk `at_chunk`.
    pub async fn serve_failing(&self, data: Vec<u8>, at_chunk: usize) -> FileHash {
        let hash = FileHash::digest(&data);
        self.insert(hash, Served { data, gate: None, fail_at_chunk: Some(at_chunk) }).await;
        hash
    }

    /// Hold every upload until the returned gate opens.
    pub async fn gate_pushes(&self) -> DeliveryGate {
        let (gate, rx) = DeliveryGate::new();
        *self.push_gate.write().await = Some(rx);
        gate
    }

    /// Number of fetches started, including ones for missing files.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn pushed(&self, hash: &FileHash) -> Option<(Variant, Vec<u8>)> {
        self.pushed.read().await.get(hash).cloned()
    }
}

#[async_trait]
impl Relay for MockRelay {
    async fn fetch(&self, request: &FetchRequest) -> Result<ByteStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let served = self
            .files
            .read()
            .await
            .get(&request.hash)
            .cloned()
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFoundOnServer(request.hash)))?;
        let chunk_size = self.chunk_size;

        Ok(Box::pin(stream! {
            let Served { data, gate, fail_at_chunk } = served;
            if let Some(mut gate) = gate {
                let opened = gate.wait_for(|open| *open).await.is_ok();
                if !opened {
                    yield Err(exn::Exn::from(ErrorKind::Network("delivery gate dropped".to_string())));
                    return;
                }
            }
            for (index, chunk) in data.chunks(chunk_size).enumerate() {
                if fail_at_chunk == Some(index) {
                    yield Err(exn::Exn::from(ErrorKind::Network("connection reset".to_string())));
                    return;
                }
                yield Ok(chunk.to_vec());
            }
        }))
    }

    async fn push(&self, hash: &FileHash, variant: Variant, data: ByteStream) -> Result<()> {
        let gate = self.push_gate.read().await.clone();
        if let Some(mut gate) = gate {
            let opened = gate.wait_for(|open| *open).await.is_ok();
            if !opened {
                exn::bail!(ErrorKind::Network("push gate dropped".to_string()));
            }
        }
        let chunks: Vec<Vec<u8>> = data.try_collect().await?;
        self.pushed.write().await.insert(*hash, (variant, chunks.concat()));
        Ok(())
    }
}
