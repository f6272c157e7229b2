//! Durable snapshot cache for offline support.
//!
//! One atomically-replaced snapshot per (workspace, project) scope,
//! written as a metadata file plus a ticket file. Corrupt files are
//! deleted and the scope is treated as empty.

mod store;

pub use store::{CacheMetadata, SnapshotStore};
