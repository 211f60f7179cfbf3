//! Chunk-store traits: the seam between the replication engine and the
//! source/destination databases.
//!
//! A source must expose the compressed-chunk interface to be pullable; a
//! sink must additionally accept table-file uploads and a single-shot
//! manifest commit.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::AddressSet;
use crate::chunk::CompressedChunk;
use crate::error::StoreResult;

/// Callback handed to [`TableFileSink::write_table_file`]. Each invocation
/// must yield a fresh reader positioned at the start of the file plus the
/// file's content length; the sink may invoke it more than once on
/// transient retries.
pub type OpenTableFileBody<'a> =
    &'a (dyn Fn() -> StoreResult<(Box<dyn Read + Send>, u64)> + Send + Sync);

/// Base chunk-store interface shared by sources and sinks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// The store's format version. Pulls require source and sink versions
    /// to match exactly.
    fn version(&self) -> String;

    /// Set difference with contents: returns the subset of `addrs` this
    /// store does not have.
    async fn has_many(&self, addrs: &AddressSet) -> StoreResult<AddressSet>;

    /// Returns an owned compressed-chunk view of this store, if it
    /// supports one. Owned so fetch workers can be spawned with it.
    fn compressed_source(self: Arc<Self>) -> Option<Arc<dyn CompressedChunkSource>> {
        None
    }
}

/// A store that can stream chunks out in compressed form.
#[async_trait]
pub trait CompressedChunkSource: ChunkStore {
    /// Streams each requested chunk through `found`, possibly from
    /// parallel worker tasks. On return every requested address has been
    /// sent or an error has been returned; a missing address is
    /// [`StoreError::ChunkNotFound`]. A dropped receiver ends the call
    /// cleanly — the pull is being cancelled.
    ///
    /// [`StoreError::ChunkNotFound`]: crate::error::StoreError::ChunkNotFound
    async fn get_many_compressed(
        &self,
        addrs: &AddressSet,
        found: mpsc::Sender<CompressedChunk>,
    ) -> StoreResult<()>;
}

/// A destination store that accepts table-file uploads and commits them to
/// its manifest.
#[async_trait]
pub trait TableFileSink: ChunkStore {
    /// Uploads one table file. `open_body` is invoked for the upload body
    /// and again on each transient retry; every invocation observes the
    /// same `chunk_count` and `content_md5`.
    async fn write_table_file(
        &self,
        id: &str,
        chunk_count: u32,
        content_md5: [u8; 16],
        open_body: OpenTableFileBody<'_>,
    ) -> StoreResult<()>;

    /// Atomically registers the uploaded table files. Until this call
    /// returns, none of their chunks are visible to readers of the sink.
    async fn add_table_files_to_manifest(&self, files: &HashMap<String, u32>) -> StoreResult<()>;
}
