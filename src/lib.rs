//! Core sync engine for a Rally terminal client.
//!
//! The hard part of the client lives here: reconciling a durable local
//! snapshot with a remote, rate-limited, unreliable API. Reads are
//! stale-while-revalidate against an atomically-replaced on-disk
//! snapshot, all outbound traffic shares one concurrency-throttled
//! retrying gateway, and bulk mutations are best-effort with per-item
//! failure isolation.
//!
//! The TUI (rendering, key bindings, filtering, entry point) lives in
//! the binary and consumes [`CachedRallyClient`].

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod rally;

pub use cache::{CacheMetadata, SnapshotStore};
pub use config::Config;
pub use error::{Error, Result};
pub use rally::bulk::{BulkUpdater, CancelFlag};
pub use rally::cached_client::{CachedRallyClient, SyncStatus};
pub use rally::client::RallyClient;
pub use rally::gateway::TicketGateway;
pub use rally::types::{
  BulkResult, EntityKind, FieldChange, IterationOwners, Scope, Ticket,
};
