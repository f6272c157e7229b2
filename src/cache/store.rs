//! Durable on-disk snapshot storage.
//!
//! Each (workspace, project) scope gets two JSON files under the
//! per-user cache directory: a metadata file and a ticket snapshot.
//! Writes go to a temporary file in the same directory followed by an
//! atomic rename, so a reader never observes a half-written file and a
//! crash mid-write leaves the previous snapshot intact.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rally::types::{Scope, Ticket};

/// Bumped when the on-disk layout changes; a mismatch is treated as
/// corruption and the files are rebuilt from the remote.
const SNAPSHOT_VERSION: u32 = 1;

/// Sidecar metadata written alongside every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
  pub version: u32,
  pub workspace: String,
  pub project: String,
  pub last_updated: DateTime<Utc>,
}

/// File-backed snapshot store.
///
/// No internal locking: the synchronizing client is the only writer,
/// and atomic renames keep concurrent readers consistent.
pub struct SnapshotStore {
  dir: PathBuf,
}

impl SnapshotStore {
  /// Open the store at the default per-user cache location.
  pub fn open() -> Result<Self> {
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| Error::Config("Could not determine cache directory".to_string()))?;

    Self::open_at(cache_dir.join("r9s"))
  }

  /// Open the store at an explicit directory (config override, tests).
  pub fn open_at(dir: impl Into<PathBuf>) -> Result<Self> {
    let dir = dir.into();
    fs::create_dir_all(&dir)
      .map_err(|e| Error::Config(format!("Failed to create cache directory: {}", e)))?;
    Ok(Self { dir })
  }

  fn meta_path(&self, scope: &Scope) -> PathBuf {
    self.dir.join(format!("{}.meta.json", scope.cache_key()))
  }

  fn tickets_path(&self, scope: &Scope) -> PathBuf {
    self.dir.join(format!("{}.tickets.json", scope.cache_key()))
  }

  /// Load the snapshot for a scope.
  ///
  /// Returns an empty list and absent metadata when no snapshot exists
  /// or when either file fails to parse; a parse failure additionally
  /// deletes both files so the next fetch rebuilds them.
  pub fn load(&self, scope: &Scope) -> (Vec<Ticket>, Option<CacheMetadata>) {
    match self.try_load(scope) {
      Ok(Some((tickets, metadata))) => (tickets, Some(metadata)),
      Ok(None) => (Vec::new(), None),
      Err(e) => {
        warn!(scope = %scope, error = %e, "cache unreadable, discarding");
        self.clear(scope);
        (Vec::new(), None)
      }
    }
  }

  fn try_load(&self, scope: &Scope) -> Result<Option<(Vec<Ticket>, CacheMetadata)>> {
    let meta_path = self.meta_path(scope);
    let tickets_path = self.tickets_path(scope);
    if !meta_path.exists() || !tickets_path.exists() {
      return Ok(None);
    }

    let metadata = read_json::<CacheMetadata>(&meta_path)?;
    if metadata.version != SNAPSHOT_VERSION {
      return Err(Error::CacheCorruption(format!(
        "snapshot version {} != {}",
        metadata.version, SNAPSHOT_VERSION
      )));
    }
    if metadata.workspace != scope.workspace || metadata.project != scope.project {
      return Err(Error::CacheCorruption("snapshot belongs to another scope".to_string()));
    }

    let tickets = read_json::<Vec<Ticket>>(&tickets_path)?;
    Ok(Some((tickets, metadata)))
  }

  /// Persist a snapshot for a scope, replacing any previous one.
  ///
  /// The ticket file is committed before the metadata file: a crash
  /// between the two renames leaves old metadata over a complete new
  /// snapshot, which only under-reports freshness.
  pub fn save(&self, scope: &Scope, tickets: &[Ticket]) -> Result<CacheMetadata> {
    let metadata = CacheMetadata {
      version: SNAPSHOT_VERSION,
      workspace: scope.workspace.clone(),
      project: scope.project.clone(),
      last_updated: Utc::now(),
    };

    write_json_atomic(&self.tickets_path(scope), &tickets)?;
    write_json_atomic(&self.meta_path(scope), &metadata)?;

    debug!(scope = %scope, count = tickets.len(), "snapshot saved");
    Ok(metadata)
  }

  /// True when no usable metadata exists or the snapshot is older than
  /// `ttl`.
  pub fn is_stale(&self, scope: &Scope, ttl: Duration) -> bool {
    match self.read_metadata(scope) {
      Some(metadata) => Utc::now() - metadata.last_updated > ttl,
      None => true,
    }
  }

  /// Age of the current snapshot, if one exists.
  pub fn cache_age(&self, scope: &Scope) -> Option<Duration> {
    self
      .read_metadata(scope)
      .map(|m| Utc::now() - m.last_updated)
  }

  fn read_metadata(&self, scope: &Scope) -> Option<CacheMetadata> {
    let path = self.meta_path(scope);
    if !path.exists() {
      return None;
    }
    read_json::<CacheMetadata>(&path)
      .ok()
      .filter(|m| m.version == SNAPSHOT_VERSION)
  }

  /// Delete the snapshot and metadata for a scope.
  ///
  /// Called on workspace/project switch so data never leaks across
  /// scopes, and on corruption.
  pub fn clear(&self, scope: &Scope) {
    for path in [self.meta_path(scope), self.tickets_path(scope)] {
      if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
          warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
      }
    }
  }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  let contents = fs::read_to_string(path)
    .map_err(|e| Error::CacheCorruption(format!("{}: {}", path.display(), e)))?;
  serde_json::from_str(&contents)
    .map_err(|e| Error::CacheCorruption(format!("{}: {}", path.display(), e)))
}

/// Serialize to a temp file in the target directory, then rename over
/// the final path. Rename within one directory is atomic, so readers
/// see the old file or the new one, never a mix.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let data = serde_json::to_vec_pretty(value)
    .map_err(|e| Error::CacheCorruption(format!("serialize {}: {}", path.display(), e)))?;

  let tmp_path = path.with_extension("json.tmp");
  fs::write(&tmp_path, &data)
    .map_err(|e| Error::CacheCorruption(format!("write {}: {}", tmp_path.display(), e)))?;
  fs::rename(&tmp_path, path)
    .map_err(|e| Error::CacheCorruption(format!("rename {}: {}", path.display(), e)))?;

  Ok(())
}
