//! The pull pipeline: a level-synchronous Merkle BFS that replicates every
//! chunk reachable from a set of roots into a destination store.
//!
//! The pipeline is a set of cooperating tasks joined over bounded channels:
//!
//! ```text
//! driver ──batches──▶ fetch x2 ──found──▶ decode+walk ──processed──▶ pack ──completed──▶ upload x2
//!   ▲                                                                 │
//!   └────────────── next-level candidates at the wave boundary ◀──────┘
//! ```
//!
//! The replicated stages — fetch and upload — are spawned tasks collected
//! in a [`JoinSet`], one task per worker. Fetch workers relay compressed
//! chunks out of the source store, accounting bytes as they pass. The
//! walker decompresses each chunk and collects its outbound references.
//! The pack stage is a singleton so the in-progress table file needs no
//! locking; it rotates writers under a semaphore that caps how many table
//! files exist at once, and hands filled writers to the upload workers,
//! which finalize, upload with a retry-safe body, and record each file for
//! the single manifest commit that publishes the whole pull atomically.
//!
//! The first error cancels the rest: singleton stages are dropped at their
//! next suspension point, and the worker sets are shut down — aborted and
//! reaped — before the pull returns. Table files ride on temp files that
//! delete themselves on drop, so failed pulls leave the temp directory
//! clean.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use dagsync_store::{
    walk_node_refs, Address, AddressSet, Chunk, ChunkStore, CompressedChunk,
    CompressedChunkSource, StoreResult, TableFileMeta, TableFileSink, TableFileWriter,
};

use crate::batch::split_batches;
use crate::error::PullError;
use crate::pushlog::PushLog;
use crate::stats::{PullCounters, PullStats, StatsEmitter};

/// Pluggable chunk-to-references walker: parses a chunk's DAG encoding and
/// invokes the callback with each outbound address and a flag marking
/// targets known to be leaves. The flag is a hint; correctness does not
/// depend on it.
pub type WalkRefs = Arc<
    dyn Fn(&Chunk, &mut dyn FnMut(Address, bool) -> StoreResult<()>) -> StoreResult<()>
        + Send
        + Sync,
>;

/// Returns a walker over the reference Merkle-node encoding.
pub fn node_walker() -> WalkRefs {
    Arc::new(|chunk, emit| walk_node_refs(chunk, emit))
}

const FETCH_WORKERS: usize = 2;
const UPLOAD_WORKERS: usize = 2;
const OUTSTANDING_TABLE_FILES: usize = 2;
const MAX_BATCH_SIZE: usize = 64 * 1024;
const CHUNK_CHANNEL_CAP: usize = 4096;
const COMPLETED_TABLES_CAP: usize = 8;

/// A table-file writer plus the semaphore permit that bounds how many of
/// them exist. The permit releases when the slot is dropped, after upload.
struct WriterSlot {
    wr: TableFileWriter,
    _permit: OwnedSemaphorePermit,
}

type ManifestMap = Arc<std::sync::Mutex<HashMap<String, u32>>>;

/// Replicates the chunks reachable from a set of root addresses from a
/// source store into a sink store.
pub struct Puller {
    source: Arc<dyn ChunkStore>,
    sink: Arc<dyn TableFileSink>,
    walk: WalkRefs,
    absent: AddressSet,
    temp_dir: PathBuf,
    chunks_per_table_file: usize,
    counters: Arc<PullCounters>,
    updates: Option<mpsc::Sender<PullStats>>,
    push_log: Option<Arc<PushLog>>,
}

impl std::fmt::Debug for Puller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller").finish_non_exhaustive()
    }
}

impl Puller {
    /// Runs the startup checks and prepares a pull of `roots`.
    ///
    /// Fails with [`PullError::RootsNotFound`] if the source is missing any
    /// root, [`PullError::AlreadyUpToDate`] if the sink is missing none
    /// (including when `roots` is empty), [`PullError::VersionMismatch`] if
    /// the stores disagree on format version, and
    /// [`PullError::IncompatibleSource`] if the source cannot stream
    /// compressed chunks.
    pub async fn new(
        temp_dir: impl Into<PathBuf>,
        chunks_per_table_file: usize,
        source: Arc<dyn ChunkStore>,
        sink: Arc<dyn TableFileSink>,
        walk: WalkRefs,
        roots: &[Address],
        updates: Option<mpsc::Sender<PullStats>>,
    ) -> Result<Puller, PullError> {
        let root_set: AddressSet = roots.iter().copied().collect();

        let missing_at_source = source.has_many(&root_set).await?;
        if !missing_at_source.is_empty() {
            return Err(PullError::RootsNotFound {
                missing: missing_at_source.len(),
            });
        }

        let absent = sink.has_many(&root_set).await?;
        if absent.is_empty() {
            return Err(PullError::AlreadyUpToDate);
        }

        let source_version = source.version();
        let sink_version = sink.version();
        if source_version != sink_version {
            return Err(PullError::VersionMismatch {
                source_version,
                sink: sink_version,
            });
        }

        if source.clone().compressed_source().is_none() {
            return Err(PullError::IncompatibleSource);
        }

        let temp_dir = temp_dir.into();
        let push_log = PushLog::from_env(&temp_dir).map(Arc::new);

        Ok(Puller {
            source,
            sink,
            walk,
            absent,
            temp_dir,
            chunks_per_table_file,
            counters: Arc::new(PullCounters::new()),
            updates,
            push_log,
        })
    }

    /// Executes the sync. A pull is single-shot; the puller is consumed.
    ///
    /// On success every reachable chunk has been uploaded and the sink's
    /// manifest updated in one commit. On failure nothing was committed and
    /// the temp directory holds no files from this pull.
    pub async fn pull(self) -> Result<(), PullError> {
        let Puller {
            source,
            sink,
            walk,
            absent,
            temp_dir,
            chunks_per_table_file,
            counters,
            updates,
            push_log,
        } = self;

        let emitter = updates.map(|tx| StatsEmitter::spawn(counters.clone(), tx));
        let result = run_pull(
            source,
            sink,
            walk,
            absent,
            &temp_dir,
            chunks_per_table_file,
            &counters,
            push_log,
        )
        .await;
        if let Some(emitter) = emitter {
            emitter.stop().await;
        }
        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pull(
    source: Arc<dyn ChunkStore>,
    sink: Arc<dyn TableFileSink>,
    walk: WalkRefs,
    absent: AddressSet,
    temp_dir: &Path,
    chunks_per_table_file: usize,
    counters: &Arc<PullCounters>,
    push_log: Option<Arc<PushLog>>,
) -> Result<(), PullError> {
    let sema = Arc::new(Semaphore::new(OUTSTANDING_TABLE_FILES));
    let (completed_tx, completed_rx) = mpsc::channel::<WriterSlot>(COMPLETED_TABLES_CAP);
    let completed_rx = Arc::new(Mutex::new(completed_rx));
    let manifest: ManifestMap = Arc::default();

    let mut upload_workers = JoinSet::new();
    for worker in 0..UPLOAD_WORKERS {
        upload_workers.spawn(upload_worker(
            worker,
            sink.clone(),
            completed_rx.clone(),
            manifest.clone(),
            counters.clone(),
            push_log.clone(),
        ));
    }

    let driver = {
        let sink = sink.clone();
        let sema = sema.clone();
        let counters = counters.clone();
        let push_log = push_log.clone();
        async move {
            let cmp_source = source
                .clone()
                .compressed_source()
                .ok_or(PullError::IncompatibleSource)?;

            let permit = sema
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PullError::Cancelled)?;
            let mut slot = WriterSlot {
                wr: TableFileWriter::new_in(temp_dir)?,
                _permit: permit,
            };
            let mut absent = absent;
            let mut downloaded = AddressSet::new();
            let mut level = 0u32;

            while !absent.is_empty() {
                downloaded.insert_all(&absent);
                let requested = absent.len();
                counters.add_total_source_chunks(requested as u64);
                debug!(level, chunks = requested, "pull level start");
                if let Some(log) = &push_log {
                    log.record(&format!("level {level}: fetching {requested} chunks"));
                }

                let batches = split_batches(absent, MAX_BATCH_SIZE);
                let mut next = run_level(
                    &cmp_source,
                    &walk,
                    batches,
                    requested,
                    &mut slot,
                    temp_dir,
                    chunks_per_table_file,
                    &sema,
                    &completed_tx,
                    &counters,
                )
                .await?;

                next.remove_all(&downloaded);
                absent = if next.is_empty() {
                    next
                } else {
                    sink.has_many(&next).await?
                };
                level += 1;
            }

            if slot.wr.chunk_count() > 0 {
                completed_tx
                    .send(slot)
                    .await
                    .map_err(|_| PullError::Cancelled)?;
            }
            // completed_tx drops here, closing the channel and letting the
            // upload workers drain out.
            Ok(())
        }
    };

    let result = {
        let uploaders = join_workers(&mut upload_workers);
        tokio::try_join!(driver, uploaders)
    };
    // Abort and reap any workers still running after a failure, so temp
    // files are gone before the pull returns.
    upload_workers.shutdown().await;
    result?;

    let files = {
        let guard = match manifest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    };
    sink.add_table_files_to_manifest(&files).await?;
    info!(files = files.len(), "pull committed");
    if let Some(log) = &push_log {
        log.record(&format!("manifest committed with {} table file(s)", files.len()));
    }
    Ok(())
}

/// Waits for every worker in the set, surfacing the first failure.
async fn join_workers(workers: &mut JoinSet<Result<(), PullError>>) -> Result<(), PullError> {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(result) => result?,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => return Err(PullError::Cancelled),
        }
    }
    Ok(())
}

/// Runs one BFS wave through fetch, walk, and pack, returning the
/// candidate addresses for the next wave.
#[allow(clippy::too_many_arguments)]
async fn run_level(
    source: &Arc<dyn CompressedChunkSource>,
    walk: &WalkRefs,
    batches: Vec<AddressSet>,
    requested: usize,
    slot: &mut WriterSlot,
    temp_dir: &Path,
    chunks_per_table_file: usize,
    sema: &Arc<Semaphore>,
    completed_tx: &mpsc::Sender<WriterSlot>,
    counters: &Arc<PullCounters>,
) -> Result<AddressSet, PullError> {
    let (batch_tx, batch_rx) = mpsc::channel(batches.len().max(1));
    for batch in batches {
        // Capacity covers every batch; these sends never block.
        batch_tx.send(batch).await.map_err(|_| PullError::Cancelled)?;
    }
    drop(batch_tx);
    let batch_rx = Arc::new(Mutex::new(batch_rx));

    let (found_tx, mut found_rx) = mpsc::channel::<CompressedChunk>(CHUNK_CHANNEL_CAP);
    let (processed_tx, mut processed_rx) =
        mpsc::channel::<(CompressedChunk, AddressSet)>(CHUNK_CHANNEL_CAP);

    let mut fetch_workers = JoinSet::new();
    for _ in 0..FETCH_WORKERS {
        let source = source.clone();
        let batch_rx = batch_rx.clone();
        let found_tx = found_tx.clone();
        let counters = counters.clone();
        fetch_workers.spawn(async move {
            loop {
                let batch = { batch_rx.lock().await.recv().await };
                let Some(batch) = batch else {
                    return Ok::<(), PullError>(());
                };
                fetch_batch(source.as_ref(), &batch, &found_tx, &counters).await?;
            }
        });
    }
    drop(found_tx);

    let walker = async move {
        while let Some(cmp) = found_rx.recv().await {
            let chunk = cmp.decompress()?;
            let mut refs = AddressSet::new();
            walk(&chunk, &mut |addr, _is_leaf| {
                refs.insert(addr);
                Ok(())
            })?;
            if processed_tx.send((cmp, refs)).await.is_err() {
                // Pack stage is gone; its error wins the join.
                return Ok(());
            }
        }
        Ok::<(), PullError>(())
    };

    let packer = async move {
        let mut seen = 0usize;
        let mut next_level = AddressSet::new();
        while let Some((cmp, refs)) = processed_rx.recv().await {
            seen += 1;
            counters.add_buffered_send_bytes(cmp.payload_len());
            slot.wr.add_compressed_chunk(&cmp)?;

            if slot.wr.chunk_count() as usize >= chunks_per_table_file {
                // Open the successor before handing off the filled writer;
                // its permit rides along and frees once the upload is done.
                let permit = sema
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PullError::Cancelled)?;
                let fresh = WriterSlot {
                    wr: TableFileWriter::new_in(temp_dir)?,
                    _permit: permit,
                };
                let filled = std::mem::replace(slot, fresh);
                debug!(chunks = filled.wr.chunk_count(), "table file filled, rotating writer");
                completed_tx
                    .send(filled)
                    .await
                    .map_err(|_| PullError::Cancelled)?;
            }

            next_level.insert_all(&refs);
        }
        if seen != requested {
            return Err(PullError::IncompleteFetch {
                requested,
                fetched: seen,
            });
        }
        Ok(next_level)
    };

    let result = {
        let fetchers = join_workers(&mut fetch_workers);
        tokio::try_join!(fetchers, walker, packer)
    };
    fetch_workers.shutdown().await;
    let (_, _, next_level) = result?;
    Ok(next_level)
}

/// Fetches one batch, relaying each chunk the source emits into the found
/// channel with fetch accounting on the way through.
async fn fetch_batch(
    source: &dyn CompressedChunkSource,
    batch: &AddressSet,
    found_tx: &mpsc::Sender<CompressedChunk>,
    counters: &PullCounters,
) -> Result<(), PullError> {
    let (relay_tx, mut relay_rx) = mpsc::channel::<CompressedChunk>(CHUNK_CHANNEL_CAP);

    let fetch = async { source.get_many_compressed(batch, relay_tx).await.map_err(PullError::from) };
    let forward = async {
        while let Some(cmp) = relay_rx.recv().await {
            counters.note_fetched(cmp.payload_len());
            if found_tx.send(cmp).await.is_err() {
                // Downstream stage failed; the join surfaces its error.
                break;
            }
        }
        Ok::<(), PullError>(())
    };

    tokio::try_join!(fetch, forward)?;
    Ok(())
}

/// Consumes filled writers: finalizes, uploads with a retry-safe body,
/// records the file for the manifest commit, and removes the temp file.
async fn upload_worker(
    worker: usize,
    sink: Arc<dyn TableFileSink>,
    completed_rx: Arc<Mutex<mpsc::Receiver<WriterSlot>>>,
    manifest: ManifestMap,
    counters: Arc<PullCounters>,
    push_log: Option<Arc<PushLog>>,
) -> Result<(), PullError> {
    loop {
        let slot = { completed_rx.lock().await.recv().await };
        let Some(mut slot) = slot else {
            return Ok(());
        };

        // Chunk-record length before finish; finish appends the index and
        // footer, which the upload body accounts on first open.
        let chunks_len = slot.wr.content_length();
        let meta = slot.wr.finish()?;
        debug!(worker, id = %meta.id, chunks = meta.chunk_count, "uploading table file");
        if let Some(log) = &push_log {
            log.record(&format!(
                "uploading table file {} ({} chunks, {} bytes)",
                meta.id, meta.chunk_count, meta.content_length
            ));
        }

        upload_table_file(sink.as_ref(), &slot.wr, &meta, chunks_len, &counters).await?;

        {
            let mut guard = match manifest.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.insert(meta.id.clone(), meta.chunk_count);
        }
        slot.wr.remove()?;
        // Dropping the slot releases its writer permit.
    }
}

async fn upload_table_file(
    sink: &dyn TableFileSink,
    wr: &TableFileWriter,
    meta: &TableFileMeta,
    chunks_len: u64,
    counters: &Arc<PullCounters>,
) -> Result<(), PullError> {
    let content_length = meta.content_length;
    let uploaded_this_file = Arc::new(AtomicU64::new(0));

    let body_counters = counters.clone();
    let body_progress = uploaded_this_file.clone();
    let open_body = move || -> StoreResult<(Box<dyn Read + Send>, u64)> {
        let file = wr.reader()?;

        let prior = body_progress.swap(0, Ordering::SeqCst);
        if prior == 0 {
            // First open: chunk payload bytes were buffered as they were
            // packed; the index and footer are buffered here.
            body_counters.add_buffered_send_bytes(content_length - chunks_len);
        } else {
            // A retry: what was already sent counts as re-buffered.
            body_counters.add_buffered_send_bytes(prior);
        }

        let progress = body_progress.clone();
        let finished = body_counters.clone();
        let reader = CountingReader::new(file, move |n| {
            progress.fetch_add(n, Ordering::SeqCst);
            finished.add_finished_send_bytes(n);
        });
        Ok((Box::new(reader), content_length))
    };

    sink.write_table_file(&meta.id, meta.chunk_count, meta.content_md5, &open_body)
        .await?;
    Ok(())
}

/// Reader adapter reporting every byte that passes through it.
struct CountingReader<R, F> {
    inner: R,
    on_read: F,
}

impl<R, F> CountingReader<R, F> {
    fn new(inner: R, on_read: F) -> Self {
        CountingReader { inner, on_read }
    }
}

impl<R: Read, F: Fn(u64)> Read for CountingReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        (self.on_read)(n as u64);
        Ok(n)
    }
}
