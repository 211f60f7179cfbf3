//! Error types for the chunk-store substrate.

use thiserror::Error;

use crate::address::Address;

/// Result type alias for chunk-store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for chunk-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload or on-disk structure failed to decode.
    #[error("corrupt data: {msg}")]
    Corrupt {
        /// Description of what failed to decode.
        msg: String,
    },

    /// A requested chunk does not exist in the store.
    #[error("chunk not found: {address}")]
    ChunkNotFound {
        /// The address that was not found.
        address: Address,
    },

    /// The table-file writer has already been finished.
    #[error("table-file writer is finalized")]
    WriterFinalized,

    /// A reader was requested before the table file was finished.
    #[error("table-file writer is not finished")]
    WriterNotFinished,

    /// The table file's backing temp file has been removed.
    #[error("table file has been removed")]
    WriterRemoved,

    /// Backend-specific store failure.
    #[error("store backend error: {msg}")]
    Backend {
        /// Description of the backend failure.
        msg: String,
    },
}
