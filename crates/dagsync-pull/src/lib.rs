#![warn(missing_docs)]

//! dagsync replication engine: transitive pull of a content-addressed
//! Merkle DAG from a source chunk store into a destination chunk store.
//!
//! Given a set of root addresses, [`Puller`] discovers every reachable
//! chunk with a level-synchronous BFS, fetches the ones the sink is
//! missing, packs them into bounded table files, uploads the files, and
//! registers them in the sink's manifest with a single atomic commit.

pub mod error;
pub mod puller;
pub mod stats;

mod batch;
mod pushlog;

pub use error::PullError;
pub use puller::{node_walker, Puller, WalkRefs};
pub use stats::PullStats;
