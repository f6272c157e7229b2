//! Gateway trait between the sync layer and the remote service.

use async_trait::async_trait;

use crate::error::Result;

use super::types::{EntityKind, FieldChange, Ticket};

/// Remote operations the synchronizing client and bulk coordinator
/// depend on. `RallyClient` is the production implementation; tests
/// substitute a fake.
#[async_trait]
pub trait TicketGateway: Send + Sync + 'static {
  /// Fetch all work items of the given kinds matching an optional
  /// query predicate, fully paginated.
  async fn fetch(&self, kinds: &[EntityKind], query: Option<&str>) -> Result<Vec<Ticket>>;

  /// Fetch a single work item by formatted id.
  async fn fetch_one(&self, formatted_id: &str) -> Result<Option<Ticket>>;

  /// Apply field changes to one work item, returning the updated item.
  async fn mutate(&self, ticket: &Ticket, changes: &[FieldChange]) -> Result<Option<Ticket>>;

  /// Create a new work item. Only retried when `idempotency_key` is
  /// provided; a keyless create failure is surfaced immediately.
  async fn create(
    &self,
    kind: EntityKind,
    fields: serde_json::Map<String, serde_json::Value>,
    idempotency_key: Option<&str>,
  ) -> Result<Option<Ticket>>;
}
