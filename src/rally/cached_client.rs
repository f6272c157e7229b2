//! Cached Rally client that wraps a gateway with a durable snapshot.
//!
//! Reads are served stale-while-revalidate: the local snapshot comes
//! back immediately and an expired one triggers a single background
//! refresh per scope. Connectivity failures flip the scope offline;
//! cached data keeps being served but mutations are rejected until a
//! refresh succeeds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::SnapshotStore;
use crate::config::Config;
use crate::error::{Error, Result};

use super::bulk::{BulkUpdater, CancelFlag};
use super::client::RallyClient;
use super::gateway::TicketGateway;
use super::types::{BulkResult, EntityKind, FieldChange, IterationOwners, Scope, Ticket};

/// Where a scope currently stands in the refresh lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  /// No snapshot yet; the first read blocks on the network
  Empty,
  /// Snapshot younger than the TTL
  Fresh,
  /// Snapshot past the TTL, still served while a refresh is due
  Stale,
  /// A refresh is in flight
  Refreshing,
  /// Last refresh hit a connectivity failure; cache served, writes rejected
  Offline,
}

/// Terminal outcome of one refresh, broadcast to every attached waiter.
#[derive(Debug, Clone)]
enum RefreshOutcome {
  Success,
  Connectivity(String),
  Application(String),
}

struct SyncState {
  scope: Scope,
  tickets: Vec<Ticket>,
  owners: IterationOwners,
  /// Whether the in-memory mirror has been initialized from disk
  mirrored: bool,
  /// Whether a committed snapshot exists for the scope
  has_snapshot: bool,
  offline: bool,
  /// Predicate used by the most recent read; refreshes reuse it
  last_query: Option<String>,
}

type InflightMap = HashMap<Scope, watch::Receiver<Option<RefreshOutcome>>>;

/// A poisoned lock only means a refresh task panicked mid-update; the
/// guarded state is still structurally valid, so recover the guard.
fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rally client with a durable snapshot cache and offline tracking.
///
/// This wraps the gateway and provides the interface the UI consumes:
/// the same read/mutate surface, plus cache lifecycle, background
/// refresh, and bulk mutation.
pub struct CachedRallyClient<G: TicketGateway> {
  gateway: Arc<G>,
  store: Arc<SnapshotStore>,
  ttl: Duration,
  caching_enabled: bool,
  bulk_concurrency: usize,
  state: Arc<Mutex<SyncState>>,
  /// In-flight refreshes keyed by scope; repeat triggers attach to the
  /// existing operation instead of spawning a duplicate.
  inflight: Arc<Mutex<InflightMap>>,
}

impl CachedRallyClient<RallyClient> {
  /// Create a production client from configuration.
  pub fn new(config: &Config) -> Result<Self> {
    let gateway = Arc::new(RallyClient::new(config)?);
    let store = match &config.cache.dir {
      Some(dir) => SnapshotStore::open_at(dir)?,
      None => SnapshotStore::open()?,
    };
    let scope = Scope::new(
      config.rally.workspace.as_str(),
      config.rally.project.as_str(),
    );
    let bulk_concurrency = gateway.max_in_flight();

    Ok(Self::with_gateway(
      gateway,
      store,
      scope,
      config.cache_ttl(),
      config.cache.enabled,
      bulk_concurrency,
    ))
  }
}

impl<G: TicketGateway> CachedRallyClient<G> {
  /// Assemble a client from parts. Tests inject a fake gateway here.
  pub fn with_gateway(
    gateway: Arc<G>,
    store: SnapshotStore,
    scope: Scope,
    ttl: Duration,
    caching_enabled: bool,
    bulk_concurrency: usize,
  ) -> Self {
    Self {
      gateway,
      store: Arc::new(store),
      ttl,
      caching_enabled,
      bulk_concurrency,
      state: Arc::new(Mutex::new(SyncState {
        scope,
        tickets: Vec::new(),
        owners: IterationOwners::default(),
        mirrored: false,
        has_snapshot: false,
        offline: false,
        last_query: None,
      })),
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// List the scope's work items.
  ///
  /// With caching disabled this is a plain gateway fetch. Otherwise the
  /// snapshot is served immediately when one exists; an expired one
  /// additionally triggers a single background refresh. An empty scope
  /// blocks on the first fetch and persists the result.
  pub async fn list(&self, query: Option<&str>) -> Result<Vec<Ticket>> {
    if !self.caching_enabled {
      return self.gateway.fetch(&EntityKind::ALL, query).await;
    }

    let (snapshot, scope, offline) = {
      let mut st = lock_recover(&self.state);
      st.last_query = query.map(String::from);
      Self::ensure_mirrored(&mut st, &self.store);
      if st.has_snapshot {
        (Some(st.tickets.clone()), st.scope.clone(), st.offline)
      } else if st.offline {
        return Err(Error::Offline);
      } else {
        (None, st.scope.clone(), st.offline)
      }
    };

    if let Some(tickets) = snapshot {
      if !offline && self.store.is_stale(&scope, self.ttl) {
        // Serve the stale snapshot now, revalidate in the background.
        debug!(scope = %scope, "snapshot stale, refreshing in background");
        let _ = self.spawn_refresh();
      }
      return Ok(tickets);
    }

    // Empty scope: the first read blocks on the network.
    self.wait_refresh(self.spawn_refresh()).await?;
    let st = lock_recover(&self.state);
    Ok(st.tickets.clone())
  }

  /// Get a single work item, from the snapshot when possible.
  pub async fn get(&self, formatted_id: &str) -> Result<Option<Ticket>> {
    if self.caching_enabled {
      let (found, offline) = {
        let mut st = lock_recover(&self.state);
        Self::ensure_mirrored(&mut st, &self.store);
        (
          st.tickets
            .iter()
            .find(|t| t.formatted_id == formatted_id)
            .cloned(),
          st.offline,
        )
      };
      if found.is_some() {
        return Ok(found);
      }
      if offline {
        // Serve cache-only while offline; the item simply isn't there.
        return Ok(None);
      }
    }

    match self.gateway.fetch_one(formatted_id).await {
      Ok(ticket) => Ok(ticket),
      Err(e) => Err(self.note_failure(e)),
    }
  }

  /// Apply field changes to one work item.
  ///
  /// Rejected immediately while offline, without network I/O. The
  /// updated ticket replaces its snapshot entry wholesale.
  pub async fn mutate(
    &self,
    formatted_id: &str,
    changes: &[FieldChange],
  ) -> Result<Option<Ticket>> {
    if self.caching_enabled && self.is_offline() {
      return Err(Error::Offline);
    }

    let target = match self.get(formatted_id).await? {
      Some(ticket) => ticket,
      None => return Ok(None),
    };

    match self.gateway.mutate(&target, changes).await {
      Ok(Some(updated)) => {
        self.apply_updates(std::slice::from_ref(&updated));
        Ok(Some(updated))
      }
      Ok(None) => Ok(None),
      Err(e) => Err(self.note_failure(e)),
    }
  }

  /// Apply one field change across many work items, best-effort.
  ///
  /// Per-item failures are collected in the returned [`BulkResult`];
  /// the batch is rejected outright only when offline.
  pub async fn bulk_mutate(
    &self,
    ids: &[String],
    change: &FieldChange,
    cancel: &CancelFlag,
  ) -> Result<BulkResult> {
    if self.caching_enabled && self.is_offline() {
      return Err(Error::Offline);
    }

    let (targets, missing) = self.resolve_targets(ids).await?;

    let updater = BulkUpdater::new(Arc::clone(&self.gateway), self.bulk_concurrency);
    let mut result = updater.run(targets, change, cancel).await;

    for id in missing {
      result.failed_count += 1;
      result.errors.push(format!("{}: not found", id));
    }

    self.apply_updates(&result.updated);
    Ok(result)
  }

  async fn resolve_targets(&self, ids: &[String]) -> Result<(Vec<Ticket>, Vec<String>)> {
    let pool = if self.caching_enabled {
      let mut st = lock_recover(&self.state);
      Self::ensure_mirrored(&mut st, &self.store);
      st.tickets.clone()
    } else {
      match self.gateway.fetch(&EntityKind::ALL, None).await {
        Ok(tickets) => tickets,
        Err(e) => return Err(self.note_failure(e)),
      }
    };

    let mut seen = std::collections::HashSet::new();
    let mut targets = Vec::new();
    let mut missing = Vec::new();
    for id in ids {
      if !seen.insert(id.as_str()) {
        continue;
      }
      match pool.iter().find(|t| &t.formatted_id == id) {
        Some(ticket) => targets.push(ticket.clone()),
        None => missing.push(id.clone()),
      }
    }
    Ok((targets, missing))
  }

  /// Unconditional blocking fetch, bypassing the staleness check.
  ///
  /// Joins an already-running refresh instead of starting a second
  /// one. A success replaces the snapshot and clears the offline flag.
  pub async fn refresh(&self) -> Result<()> {
    self.wait_refresh(self.spawn_refresh()).await
  }

  pub fn is_offline(&self) -> bool {
    lock_recover(&self.state).offline
  }

  /// Age of the current snapshot, if one exists.
  pub fn cache_age(&self) -> Option<Duration> {
    let scope = lock_recover(&self.state).scope.clone();
    self.store.cache_age(&scope)
  }

  /// Owner identities per iteration, derived from the loaded snapshot.
  pub fn iteration_owners(&self) -> IterationOwners {
    let mut st = lock_recover(&self.state);
    Self::ensure_mirrored(&mut st, &self.store);
    st.owners.clone()
  }

  pub fn scope(&self) -> Scope {
    lock_recover(&self.state).scope.clone()
  }

  pub fn status(&self) -> SyncStatus {
    let (scope, offline) = {
      let st = lock_recover(&self.state);
      (st.scope.clone(), st.offline)
    };
    if offline {
      return SyncStatus::Offline;
    }
    if lock_recover(&self.inflight).contains_key(&scope) {
      return SyncStatus::Refreshing;
    }
    match self.store.cache_age(&scope) {
      None => SyncStatus::Empty,
      Some(age) if age > self.ttl => SyncStatus::Stale,
      Some(_) => SyncStatus::Fresh,
    }
  }

  /// Move to a different (workspace, project) scope.
  ///
  /// The old scope's snapshot is deleted so data never leaks across
  /// projects, and all in-memory state is reset.
  pub fn switch_scope(&self, scope: Scope) {
    let mut st = lock_recover(&self.state);
    if st.scope == scope {
      return;
    }
    self.store.clear(&st.scope);
    st.scope = scope;
    st.tickets = Vec::new();
    st.owners = IterationOwners::default();
    st.mirrored = false;
    st.has_snapshot = false;
    st.offline = false;
    st.last_query = None;
  }

  fn ensure_mirrored(st: &mut SyncState, store: &SnapshotStore) {
    if st.mirrored {
      return;
    }
    let (tickets, metadata) = store.load(&st.scope);
    st.has_snapshot = metadata.is_some();
    st.owners = IterationOwners::build(&tickets);
    st.tickets = tickets;
    st.mirrored = true;
  }

  /// Record a gateway failure; connectivity-class failures flip the
  /// scope offline.
  fn note_failure(&self, e: Error) -> Error {
    if self.caching_enabled && e.is_connectivity() {
      lock_recover(&self.state).offline = true;
    }
    e
  }

  /// Replace updated tickets in the mirror wholesale and persist.
  fn apply_updates(&self, updated: &[Ticket]) {
    if !self.caching_enabled || updated.is_empty() {
      return;
    }
    let mut st = lock_recover(&self.state);
    Self::ensure_mirrored(&mut st, &self.store);
    for ticket in updated {
      match st
        .tickets
        .iter_mut()
        .find(|t| t.formatted_id == ticket.formatted_id)
      {
        Some(slot) => *slot = ticket.clone(),
        None => st.tickets.push(ticket.clone()),
      }
    }
    st.owners = IterationOwners::build(&st.tickets);
    // A lone mutation never marks an empty scope as fully synced; only
    // a complete fetch commits the first snapshot.
    if st.has_snapshot {
      if let Err(e) = self.store.save(&st.scope, &st.tickets) {
        warn!(error = %e, "failed to persist snapshot after mutation");
      }
    }
  }

  /// Start a refresh for the current scope, or attach to the one
  /// already in flight (single-flight per scope).
  fn spawn_refresh(&self) -> watch::Receiver<Option<RefreshOutcome>> {
    let (scope, query) = {
      let st = lock_recover(&self.state);
      (st.scope.clone(), st.last_query.clone())
    };

    let mut inflight = lock_recover(&self.inflight);
    if let Some(rx) = inflight.get(&scope) {
      return rx.clone();
    }

    let (tx, rx) = watch::channel(None);
    inflight.insert(scope.clone(), rx.clone());

    let gateway = Arc::clone(&self.gateway);
    let store = Arc::clone(&self.store);
    let state = Arc::clone(&self.state);
    let registry = Arc::clone(&self.inflight);
    tokio::spawn(async move {
      let outcome = Self::do_refresh(gateway, store, state, scope.clone(), query).await;
      lock_recover(&registry).remove(&scope);
      let _ = tx.send(Some(outcome));
    });

    rx
  }

  async fn do_refresh(
    gateway: Arc<G>,
    store: Arc<SnapshotStore>,
    state: Arc<Mutex<SyncState>>,
    scope: Scope,
    query: Option<String>,
  ) -> RefreshOutcome {
    match gateway.fetch(&EntityKind::ALL, query.as_deref()).await {
      Ok(tickets) => {
        let mut st = lock_recover(&state);
        if st.scope != scope {
          // The client switched scope mid-fetch; drop the result.
          return RefreshOutcome::Success;
        }
        if let Err(e) = store.save(&scope, &tickets) {
          warn!(scope = %scope, error = %e, "failed to persist snapshot");
        }
        st.owners = IterationOwners::build(&tickets);
        st.tickets = tickets;
        st.mirrored = true;
        st.has_snapshot = true;
        st.offline = false;
        RefreshOutcome::Success
      }
      Err(Error::Connectivity(message)) => {
        let mut st = lock_recover(&state);
        if st.scope == scope {
          st.offline = true;
        }
        warn!(scope = %scope, error = %message, "refresh failed, going offline");
        RefreshOutcome::Connectivity(message)
      }
      Err(e) => RefreshOutcome::Application(e.to_string()),
    }
  }

  /// Block until the given refresh completes and translate its outcome.
  async fn wait_refresh(
    &self,
    mut rx: watch::Receiver<Option<RefreshOutcome>>,
  ) -> Result<()> {
    let outcome = rx
      .wait_for(|o| o.is_some())
      .await
      .map_err(|_| Error::Connectivity("refresh task dropped".to_string()))?;
    match &*outcome {
      Some(RefreshOutcome::Success) => Ok(()),
      Some(RefreshOutcome::Connectivity(m)) => Err(Error::Connectivity(m.clone())),
      Some(RefreshOutcome::Application(m)) => Err(Error::Application(m.clone())),
      None => Err(Error::Connectivity("refresh ended without result".to_string())),
    }
  }
}

impl<G: TicketGateway> Clone for CachedRallyClient<G> {
  fn clone(&self) -> Self {
    Self {
      gateway: Arc::clone(&self.gateway),
      store: Arc::clone(&self.store),
      ttl: self.ttl,
      caching_enabled: self.caching_enabled,
      bulk_concurrency: self.bulk_concurrency,
      state: Arc::clone(&self.state),
      inflight: Arc::clone(&self.inflight),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rally::gateway::testing::{FailMode, FakeGateway};
  use std::time::Duration as StdDuration;

  fn ticket(formatted_id: &str) -> Ticket {
    Ticket {
      formatted_id: formatted_id.to_string(),
      name: format!("Ticket {}", formatted_id),
      kind: "HierarchicalRequirement".to_string(),
      schedule_state: "Defined".to_string(),
      owner: Some("alice".to_string()),
      iteration: Some("Sprint 1".to_string()),
      plan_estimate: Some(3.0),
      description: String::new(),
      notes: String::new(),
      parent: None,
      object_id: Some(format!("oid-{}", formatted_id)),
    }
  }

  fn tickets(n: usize) -> Vec<Ticket> {
    (1..=n).map(|i| ticket(&format!("US{}", i))).collect()
  }

  fn client(
    fake: &Arc<FakeGateway>,
    dir: &tempfile::TempDir,
    ttl: Duration,
    caching_enabled: bool,
  ) -> CachedRallyClient<FakeGateway> {
    let store = SnapshotStore::open_at(dir.path()).unwrap();
    CachedRallyClient::with_gateway(
      Arc::clone(fake),
      store,
      Scope::new("Acme", "Platform"),
      ttl,
      caching_enabled,
      5,
    )
  }

  #[tokio::test]
  async fn test_empty_cache_blocks_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    assert_eq!(client.status(), SyncStatus::Empty);
    let listed = client.list(None).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(fake.fetch_calls(), 1);
    assert_eq!(client.status(), SyncStatus::Fresh);

    // The snapshot survives a new client instance with no network
    let fake2 = Arc::new(FakeGateway::new(Vec::new()));
    let client2 = client_at(&fake2, &dir);
    let listed = client2.list(None).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(fake2.fetch_calls(), 0);
  }

  fn client_at(fake: &Arc<FakeGateway>, dir: &tempfile::TempDir) -> CachedRallyClient<FakeGateway> {
    client(fake, dir, Duration::minutes(5), true)
  }

  #[tokio::test]
  async fn test_fresh_read_makes_no_network_calls() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    client.list(None).await.unwrap();
    let listed = client.list(None).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(fake.fetch_calls(), 1);
  }

  #[tokio::test]
  async fn test_stale_read_serves_cache_and_refreshes_once() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    // Zero TTL: every snapshot is immediately stale
    let client = client(&fake, &dir, Duration::zero(), true);

    client.list(None).await.unwrap();
    assert_eq!(fake.fetch_calls(), 1);

    fake.set_delay(StdDuration::from_millis(30));

    // N concurrent stale reads: each serves the cache instantly and
    // only one refresh goes out
    let mut handles = Vec::new();
    for _ in 0..5 {
      let c = client.clone();
      handles.push(tokio::spawn(async move { c.list(None).await }));
    }
    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap().len(), 3);
    }
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(fake.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_background_refresh_updates_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::zero(), true);

    client.list(None).await.unwrap();
    fake.set_tickets(tickets(5));

    // Stale read triggers the refresh; give it time to land
    assert_eq!(client.list(None).await.unwrap().len(), 3);
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    assert_eq!(client.list(None).await.unwrap().len(), 5);
  }

  #[tokio::test]
  async fn test_connectivity_failure_flips_offline_and_serves_cache() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::zero(), true);

    client.list(None).await.unwrap();
    fake.set_fetch_error(Some(FailMode::Connectivity));

    // Stale read still serves the cache, refresh fails in background
    assert_eq!(client.list(None).await.unwrap().len(), 3);
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(client.is_offline());
    assert_eq!(client.status(), SyncStatus::Offline);

    // While offline no further refresh is attempted
    let calls = fake.fetch_calls();
    assert_eq!(client.list(None).await.unwrap().len(), 3);
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(fake.fetch_calls(), calls);
  }

  #[tokio::test]
  async fn test_offline_gates_mutations_until_refresh_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::zero(), true);

    client.list(None).await.unwrap();
    fake.set_fetch_error(Some(FailMode::Connectivity));
    client.list(None).await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(client.is_offline());

    // Mutations are rejected without touching the gateway
    let err = client
      .mutate("US1", &[FieldChange::SetState("Accepted".to_string())])
      .await
      .unwrap_err();
    assert!(err.is_offline());
    assert_eq!(fake.mutate_calls(), 0);

    // Connectivity restored: refresh clears the flag
    fake.set_fetch_error(None);
    client.refresh().await.unwrap();
    assert!(!client.is_offline());

    let updated = client
      .mutate("US1", &[FieldChange::SetState("Accepted".to_string())])
      .await
      .unwrap()
      .unwrap();
    assert_eq!(updated.schedule_state, "Accepted");
    assert_eq!(fake.mutate_calls(), 1);
  }

  #[tokio::test]
  async fn test_refresh_failure_on_empty_cache_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(Vec::new()));
    fake.set_fetch_error(Some(FailMode::Connectivity));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    let err = client.list(None).await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(client.is_offline());

    // Still empty and offline: the distinct offline condition
    let err = client.list(None).await.unwrap_err();
    assert!(err.is_offline());
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(2)));
    fake.set_delay(StdDuration::from_millis(30));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    let mut handles = Vec::new();
    for _ in 0..4 {
      let c = client.clone();
      handles.push(tokio::spawn(async move { c.refresh().await }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }
    assert_eq!(fake.fetch_calls(), 1);
  }

  #[tokio::test]
  async fn test_mutation_replaces_snapshot_entry_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    client.list(None).await.unwrap();
    client
      .mutate("US2", &[FieldChange::SetOwner("bob".to_string())])
      .await
      .unwrap();

    let listed = client.list(None).await.unwrap();
    let us2 = listed.iter().find(|t| t.formatted_id == "US2").unwrap();
    assert_eq!(us2.owner.as_deref(), Some("bob"));

    // The change was persisted, not just mirrored
    let fake2 = Arc::new(FakeGateway::new(Vec::new()));
    let client2 = client_at(&fake2, &dir);
    let listed = client2.list(None).await.unwrap();
    let us2 = listed.iter().find(|t| t.formatted_id == "US2").unwrap();
    assert_eq!(us2.owner.as_deref(), Some("bob"));
  }

  #[tokio::test]
  async fn test_get_prefers_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    client.list(None).await.unwrap();

    let found = client.get("US2").await.unwrap().unwrap();
    assert_eq!(found.formatted_id, "US2");
    assert_eq!(fake.fetch_one_calls(), 0);

    // Unknown id falls through to the gateway
    assert!(client.get("US99").await.unwrap().is_none());
    assert_eq!(fake.fetch_one_calls(), 1);
  }

  #[tokio::test]
  async fn test_bulk_mutate_applies_and_reports_missing() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(4)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    client.list(None).await.unwrap();

    let ids: Vec<String> = vec![
      "US1".to_string(),
      "US2".to_string(),
      "US2".to_string(), // duplicate: dispatched once
      "US9".to_string(), // unknown
    ];
    let result = client
      .bulk_mutate(
        &ids,
        &FieldChange::SetIteration("Sprint 2".to_string()),
        &CancelFlag::new(),
      )
      .await
      .unwrap();

    assert_eq!(result.success_count, 2);
    assert_eq!(result.failed_count, 1);
    assert!(result.errors[0].starts_with("US9"));
    assert_eq!(fake.mutate_calls(), 2);

    let listed = client.list(None).await.unwrap();
    let moved = listed
      .iter()
      .filter(|t| t.iteration.as_deref() == Some("Sprint 2"))
      .count();
    assert_eq!(moved, 2);
  }

  #[tokio::test]
  async fn test_bulk_mutate_rejected_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(2)));
    let client = client(&fake, &dir, Duration::zero(), true);

    client.list(None).await.unwrap();
    fake.set_fetch_error(Some(FailMode::Connectivity));
    client.list(None).await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(client.is_offline());

    let err = client
      .bulk_mutate(
        &["US1".to_string()],
        &FieldChange::SetPoints(1.0),
        &CancelFlag::new(),
      )
      .await
      .unwrap_err();
    assert!(err.is_offline());
    assert_eq!(fake.mutate_calls(), 0);
  }

  #[tokio::test]
  async fn test_caching_disabled_always_hits_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(2)));
    let client = client(&fake, &dir, Duration::minutes(5), false);

    client.list(None).await.unwrap();
    client.list(None).await.unwrap();
    assert_eq!(fake.fetch_calls(), 2);
    // Nothing was written to disk
    assert!(client.cache_age().is_none());
  }

  #[tokio::test]
  async fn test_switch_scope_clears_old_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(2)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    client.list(None).await.unwrap();
    assert!(client.cache_age().is_some());

    let old_scope = client.scope();
    client.switch_scope(Scope::new("Acme", "Mobile"));
    assert_eq!(client.status(), SyncStatus::Empty);

    // The old scope's files are gone
    let store = SnapshotStore::open_at(dir.path()).unwrap();
    let (tickets, metadata) = store.load(&old_scope);
    assert!(tickets.is_empty());
    assert!(metadata.is_none());
  }

  #[tokio::test]
  async fn test_iteration_owners_follow_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(2)));
    let client = client(&fake, &dir, Duration::minutes(5), true);

    client.list(None).await.unwrap();
    let owners = client.iteration_owners();
    assert!(owners.owners("Sprint 1").unwrap().contains("alice"));

    client
      .mutate("US1", &[FieldChange::SetOwner("carol".to_string())])
      .await
      .unwrap();
    let owners = client.iteration_owners();
    assert!(owners.owners("Sprint 1").unwrap().contains("carol"));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeGateway::new(tickets(3)));
    let client = client(&fake, &dir, Duration::milliseconds(200), true);

    // Empty cache: blocking fetch persists three tickets
    assert_eq!(client.list(None).await.unwrap().len(), 3);
    assert_eq!(fake.fetch_calls(), 1);

    // Within the TTL: served from cache, no network
    assert_eq!(client.list(None).await.unwrap().len(), 3);
    assert_eq!(fake.fetch_calls(), 1);

    // Past the TTL: still served instantly, one background refresh
    tokio::time::sleep(StdDuration::from_millis(250)).await;
    assert_eq!(client.status(), SyncStatus::Stale);
    assert_eq!(client.list(None).await.unwrap().len(), 3);
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(fake.fetch_calls(), 2);
    assert_eq!(client.status(), SyncStatus::Fresh);
  }
}
