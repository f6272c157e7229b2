//! Best-effort bulk mutations.
//!
//! One field change fans out across many work items. Failures are
//! per-item: a ticket that cannot be updated is recorded and the rest
//! of the batch proceeds. The call returns only after every dispatched
//! operation has completed, so the result is never partial.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::debug;

use super::gateway::TicketGateway;
use super::types::{BulkResult, FieldChange, Ticket};

/// Cooperative cancellation handle for an in-progress batch.
///
/// Cancelling stops new dispatches; calls already in flight run to
/// completion and their outcomes are counted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

enum Outcome {
  Updated(Ticket),
  Failed(String),
  Cancelled,
}

/// Fans one mutation out across a batch of tickets.
///
/// Dispatch width is bounded by the gateway's concurrency ceiling; the
/// gateway's own limiter additionally bounds aggregate in-flight
/// requests across this batch and any direct calls.
pub struct BulkUpdater<G: TicketGateway> {
  gateway: Arc<G>,
  max_in_flight: usize,
}

impl<G: TicketGateway> BulkUpdater<G> {
  pub fn new(gateway: Arc<G>, max_in_flight: usize) -> Self {
    Self {
      gateway,
      max_in_flight: max_in_flight.max(1),
    }
  }

  pub async fn run(
    &self,
    targets: Vec<Ticket>,
    change: &FieldChange,
    cancel: &CancelFlag,
  ) -> BulkResult {
    let mut result = BulkResult::default();

    // The same ticket is never dispatched twice in one batch.
    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    for ticket in targets {
      if !seen.insert(ticket.formatted_id.clone()) {
        continue;
      }
      if change.is_satisfied_by(&ticket) {
        // Already holds the target value: success without a call.
        debug!(id = %ticket.formatted_id, "skipping, already at target value");
        result.success_count += 1;
      } else {
        pending.push(ticket);
      }
    }

    let outcomes: Vec<(String, Outcome)> = stream::iter(pending.into_iter().map(|ticket| {
      let gateway = Arc::clone(&self.gateway);
      let change = change.clone();
      let cancel = cancel.clone();
      async move {
        let id = ticket.formatted_id.clone();
        // Checked at dispatch time: once a call is admitted it runs to
        // completion even if the batch is cancelled afterwards.
        if cancel.is_cancelled() {
          return (id, Outcome::Cancelled);
        }
        match gateway.mutate(&ticket, std::slice::from_ref(&change)).await {
          Ok(Some(updated)) => (id, Outcome::Updated(updated)),
          Ok(None) => (id, Outcome::Failed("no longer exists".to_string())),
          Err(e) => (id, Outcome::Failed(e.to_string())),
        }
      }
    }))
    .buffer_unordered(self.max_in_flight)
    .collect()
    .await;

    for (id, outcome) in outcomes {
      match outcome {
        Outcome::Updated(ticket) => {
          result.success_count += 1;
          result.updated.push(ticket);
        }
        Outcome::Failed(message) => {
          result.failed_count += 1;
          result.errors.push(format!("{}: {}", id, message));
        }
        Outcome::Cancelled => {
          result.failed_count += 1;
          result.errors.push(format!("{}: batch cancelled", id));
        }
      }
    }

    result
  }
}
