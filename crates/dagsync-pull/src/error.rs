//! Error types for the replication engine.

use thiserror::Error;

use dagsync_store::StoreError;

/// Errors that can occur constructing or running a pull.
#[derive(Debug, Error)]
pub enum PullError {
    /// The sink already holds every root; there is nothing to pull.
    /// Returned by the constructor only, before the pipeline starts.
    #[error("sink is already up to date")]
    AlreadyUpToDate,

    /// The source store does not expose the compressed-chunk interface.
    #[error("source store does not expose a compressed-chunk interface")]
    IncompatibleSource,

    /// Source and sink report different store format versions.
    #[error("cannot pull: source version is {source_version} and sink version is {sink}")]
    VersionMismatch {
        /// Version reported by the source.
        source_version: String,
        /// Version reported by the sink.
        sink: String,
    },

    /// One or more root addresses are absent at the source.
    #[error("{missing} root address(es) not found at the source")]
    RootsNotFound {
        /// How many roots the source is missing.
        missing: usize,
    },

    /// A fetch wave produced fewer chunks than were requested.
    #[error("incomplete fetch: requested {requested} chunks, received {fetched}")]
    IncompleteFetch {
        /// Chunks requested in the wave.
        requested: usize,
        /// Chunks actually received.
        fetched: usize,
    },

    /// A pipeline channel or semaphore was severed by peer shutdown.
    #[error("pull cancelled")]
    Cancelled,

    /// Chunk-store failure.
    #[error("chunk store error")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
