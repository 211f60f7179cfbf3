//! In-memory chunk store: the reference trait implementation and the test
//! double for the replication engine.
//!
//! Uploaded table files are parsed and staged; the manifest commit moves
//! their chunks into the visible set in one step, which is what gives the
//! pull its atomic-publish semantics from a reader's perspective. The store
//! records fetch batches and supports failure injection for pipeline tests.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tracing::debug;

use crate::address::{Address, AddressSet};
use crate::chunk::{Chunk, CompressedChunk};
use crate::error::{StoreError, StoreResult};
use crate::store::{ChunkStore, CompressedChunkSource, OpenTableFileBody, TableFileSink};
use crate::table::read_table_file;

/// Operation counts recorded by [`MemoryChunkStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreStats {
    /// Number of `has_many` calls served.
    pub has_many_calls: u64,
    /// Number of `get_many_compressed` calls served.
    pub fetch_calls: u64,
    /// Largest batch size seen across fetch calls.
    pub max_fetch_batch: usize,
    /// Number of `write_table_file` calls served.
    pub table_files_written: u64,
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<Address, CompressedChunk>,
    staged: HashMap<String, Vec<CompressedChunk>>,
    manifest: HashMap<String, u32>,
    fetched: Vec<Address>,
    stats: MemoryStoreStats,
}

/// An in-memory store implementing source and sink interfaces.
pub struct MemoryChunkStore {
    version: String,
    inner: Mutex<Inner>,
    // Failure injection: countdown of chunks to serve before erroring
    // (negative disables), and extra open_body invocations per upload.
    fail_fetches_after: AtomicI64,
    transient_write_failures: AtomicU32,
}

impl MemoryChunkStore {
    /// Creates an empty store reporting the given format version.
    pub fn new(version: impl Into<String>) -> Self {
        MemoryChunkStore {
            version: version.into(),
            inner: Mutex::new(Inner::default()),
            fail_fetches_after: AtomicI64::new(-1),
            transient_write_failures: AtomicU32::new(0),
        }
    }

    /// Compresses and inserts a chunk into the visible set.
    pub fn insert(&self, chunk: &Chunk) {
        self.insert_compressed(CompressedChunk::compress(chunk));
    }

    /// Inserts an already-compressed chunk into the visible set.
    pub fn insert_compressed(&self, chunk: CompressedChunk) {
        let mut inner = self.lock();
        inner.chunks.insert(*chunk.address(), chunk);
    }

    /// Returns true if the address is visible (committed).
    pub fn has_chunk(&self, addr: &Address) -> bool {
        self.lock().chunks.contains_key(addr)
    }

    /// Number of visible chunks.
    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    /// The committed manifest: table-file id to chunk count.
    pub fn manifest(&self) -> HashMap<String, u32> {
        self.lock().manifest.clone()
    }

    /// Every address served through `get_many_compressed`, in fetch order,
    /// duplicates included.
    pub fn fetched_addresses(&self) -> Vec<Address> {
        self.lock().fetched.clone()
    }

    /// Operation counts.
    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats.clone()
    }

    /// After serving `n` more chunks, every fetch fails.
    pub fn fail_fetches_after(&self, n: u64) {
        self.fail_fetches_after.store(n as i64, Ordering::SeqCst);
    }

    /// The next `n` uploads each discard one body and re-invoke
    /// `open_body`, exercising the retry path.
    pub fn transient_write_failures(&self, n: u32) {
        self.transient_write_failures.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    fn version(&self) -> String {
        self.version.clone()
    }

    async fn has_many(&self, addrs: &AddressSet) -> StoreResult<AddressSet> {
        let mut inner = self.lock();
        inner.stats.has_many_calls += 1;
        let mut absent = AddressSet::new();
        for addr in addrs.iter() {
            if !inner.chunks.contains_key(addr) {
                absent.insert(*addr);
            }
        }
        Ok(absent)
    }

    fn compressed_source(self: Arc<Self>) -> Option<Arc<dyn CompressedChunkSource>> {
        Some(self)
    }
}

#[async_trait]
impl CompressedChunkSource for MemoryChunkStore {
    async fn get_many_compressed(
        &self,
        addrs: &AddressSet,
        found: mpsc::Sender<CompressedChunk>,
    ) -> StoreResult<()> {
        // Collect under the lock, send outside it.
        let batch: Vec<CompressedChunk> = {
            let mut inner = self.lock();
            inner.stats.fetch_calls += 1;
            inner.stats.max_fetch_batch = inner.stats.max_fetch_batch.max(addrs.len());
            let mut batch = Vec::with_capacity(addrs.len());
            for addr in addrs.iter() {
                match inner.chunks.get(addr) {
                    Some(chunk) => batch.push(chunk.clone()),
                    None => return Err(StoreError::ChunkNotFound { address: *addr }),
                }
            }
            for chunk in &batch {
                inner.fetched.push(*chunk.address());
            }
            batch
        };

        for chunk in batch {
            let remaining = self.fail_fetches_after.load(Ordering::SeqCst);
            if remaining == 0 {
                return Err(StoreError::Backend {
                    msg: "injected fetch failure".to_string(),
                });
            }
            if remaining > 0 {
                self.fail_fetches_after.fetch_sub(1, Ordering::SeqCst);
            }
            if found.send(chunk).await.is_err() {
                // Receiver gone: the pull is shutting down.
                return Ok(());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TableFileSink for MemoryChunkStore {
    async fn write_table_file(
        &self,
        id: &str,
        chunk_count: u32,
        content_md5: [u8; 16],
        open_body: OpenTableFileBody<'_>,
    ) -> StoreResult<()> {
        let mut attempts_left = self.transient_write_failures.swap(0, Ordering::SeqCst);
        let bytes = loop {
            let (mut reader, content_len) = open_body()?;
            let mut buf = Vec::with_capacity(content_len as usize);
            reader.read_to_end(&mut buf)?;
            if buf.len() as u64 != content_len {
                return Err(StoreError::Backend {
                    msg: format!(
                        "table file {id}: body length {} != declared {content_len}",
                        buf.len()
                    ),
                });
            }
            if attempts_left == 0 {
                break buf;
            }
            // Simulated transient failure: drop this body and retry.
            debug!(id, "discarding table-file body, retrying upload");
            attempts_left -= 1;
        };

        let digest: [u8; 16] = Md5::digest(&bytes).into();
        if digest != content_md5 {
            return Err(StoreError::Backend {
                msg: format!("table file {id}: content MD5 mismatch"),
            });
        }
        let chunks = read_table_file(&bytes)?;
        if chunks.len() as u32 != chunk_count {
            return Err(StoreError::Backend {
                msg: format!(
                    "table file {id}: holds {} chunks, caller declared {chunk_count}",
                    chunks.len()
                ),
            });
        }

        let mut inner = self.lock();
        inner.stats.table_files_written += 1;
        inner.staged.insert(id.to_string(), chunks);
        Ok(())
    }

    async fn add_table_files_to_manifest(&self, files: &HashMap<String, u32>) -> StoreResult<()> {
        let mut inner = self.lock();
        // Validate the whole commit before mutating anything.
        for id in files.keys() {
            if !inner.staged.contains_key(id) {
                return Err(StoreError::Backend {
                    msg: format!("table file {id} was never uploaded"),
                });
            }
        }
        for (id, count) in files {
            if let Some(chunks) = inner.staged.remove(id) {
                for chunk in chunks {
                    inner.chunks.insert(*chunk.address(), chunk);
                }
                inner.manifest.insert(id.clone(), *count);
            }
        }
        debug!(files = files.len(), "manifest updated");
        Ok(())
    }
}
