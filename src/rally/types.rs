//! Domain types for Rally work items.
//!
//! These are the normalized types the rest of the application sees.
//! Raw WSAPI payload shapes never leave `api_types`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// A fully-populated Rally work item.
///
/// Tickets are immutable: the gateway builds them whole and they are
/// replaced wholesale when a refresh or mutation result is applied,
/// never field-patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
  /// Human-facing id, unique within a project (e.g. "US1234", "DE42")
  pub formatted_id: String,
  pub name: String,
  /// Work item type (e.g. "HierarchicalRequirement", "Defect")
  pub kind: String,
  /// Workflow state (e.g. "Defined", "In-Progress", "Accepted")
  pub schedule_state: String,
  pub owner: Option<String>,
  pub iteration: Option<String>,
  /// Story points
  pub plan_estimate: Option<f64>,
  pub description: String,
  pub notes: String,
  /// Parent work item reference (formatted id when the remote expands
  /// it, display name otherwise)
  pub parent: Option<String>,
  /// Server-side object identifier used for update endpoints
  pub object_id: Option<String>,
}

/// The (workspace, project) pair a snapshot belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
  pub workspace: String,
  pub project: String,
}

impl Scope {
  pub fn new(workspace: impl Into<String>, project: impl Into<String>) -> Self {
    Self {
      workspace: workspace.into(),
      project: project.into(),
    }
  }

  /// Stable, filesystem-safe key for this scope.
  ///
  /// SHA256 hash for fixed-length names regardless of what characters
  /// the workspace/project names contain.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.workspace.as_bytes());
    hasher.update(b":");
    hasher.update(self.project.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for Scope {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.workspace, self.project)
  }
}

/// Work item kinds the client understands, one WSAPI endpoint each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  Story,
  Defect,
}

impl EntityKind {
  pub const ALL: [EntityKind; 2] = [EntityKind::Story, EntityKind::Defect];

  /// URL path segment for this kind.
  pub fn endpoint(&self) -> &'static str {
    match self {
      EntityKind::Story => "hierarchicalrequirement",
      EntityKind::Defect => "defect",
    }
  }

  /// WSAPI type name as it appears in payloads.
  pub fn type_name(&self) -> &'static str {
    match self {
      EntityKind::Story => "HierarchicalRequirement",
      EntityKind::Defect => "Defect",
    }
  }

  /// Infer the kind from a formatted id prefix ("US1234" -> Story).
  pub fn for_formatted_id(formatted_id: &str) -> Option<EntityKind> {
    if formatted_id.starts_with("US") {
      Some(EntityKind::Story)
    } else if formatted_id.starts_with("DE") {
      Some(EntityKind::Defect)
    } else {
      None
    }
  }
}

/// One field mutation, as passed to `mutate` and `bulk_mutate`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
  SetState(String),
  SetOwner(String),
  SetIteration(String),
  SetPoints(f64),
}

impl FieldChange {
  /// WSAPI field name this change targets.
  pub fn field_name(&self) -> &'static str {
    match self {
      FieldChange::SetState(_) => "ScheduleState",
      FieldChange::SetOwner(_) => "Owner",
      FieldChange::SetIteration(_) => "Iteration",
      FieldChange::SetPoints(_) => "PlanEstimate",
    }
  }

  /// JSON value sent in the update body.
  pub fn to_value(&self) -> serde_json::Value {
    match self {
      FieldChange::SetState(s) | FieldChange::SetOwner(s) | FieldChange::SetIteration(s) => {
        serde_json::Value::String(s.clone())
      }
      FieldChange::SetPoints(p) => serde_json::json!(p),
    }
  }

  /// True when the ticket already holds the target value, so the bulk
  /// coordinator can count it as done without a network call.
  pub fn is_satisfied_by(&self, ticket: &Ticket) -> bool {
    match self {
      FieldChange::SetState(s) => ticket.schedule_state == *s,
      FieldChange::SetOwner(o) => ticket.owner.as_deref() == Some(o.as_str()),
      FieldChange::SetIteration(i) => ticket.iteration.as_deref() == Some(i.as_str()),
      FieldChange::SetPoints(p) => ticket.plan_estimate == Some(*p),
    }
  }
}

/// Build the update body for a set of field changes.
pub fn changes_to_fields(changes: &[FieldChange]) -> serde_json::Map<String, serde_json::Value> {
  changes
    .iter()
    .map(|c| (c.field_name().to_string(), c.to_value()))
    .collect()
}

/// Unique owner identities keyed by iteration name.
///
/// Derived from a loaded ticket list; rebuilt whenever the owning list
/// changes. Used by the UI for owner pickers scoped to an iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationOwners {
  by_iteration: HashMap<String, BTreeSet<String>>,
}

impl IterationOwners {
  pub fn build(tickets: &[Ticket]) -> Self {
    let mut by_iteration: HashMap<String, BTreeSet<String>> = HashMap::new();
    for ticket in tickets {
      if let (Some(iteration), Some(owner)) = (&ticket.iteration, &ticket.owner) {
        by_iteration
          .entry(iteration.clone())
          .or_default()
          .insert(owner.clone());
      }
    }
    Self { by_iteration }
  }

  pub fn owners(&self, iteration: &str) -> Option<&BTreeSet<String>> {
    self.by_iteration.get(iteration)
  }

  pub fn iterations(&self) -> impl Iterator<Item = &str> {
    self.by_iteration.keys().map(String::as_str)
  }
}

/// Aggregate outcome of one bulk mutation.
///
/// Built once by the coordinator and returned as a value; partial
/// failure is encoded here, never raised as an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
  pub success_count: usize,
  pub failed_count: usize,
  /// Updated tickets returned by the remote, for snapshot replacement
  pub updated: Vec<Ticket>,
  /// One message per failed ticket, prefixed with its formatted id
  pub errors: Vec<String>,
}

impl BulkResult {
  pub fn total(&self) -> usize {
    self.success_count + self.failed_count
  }

  /// Render "N updated, M failed" plus at most `max_error_lines` error
  /// lines, with an indicator when the list is truncated.
  pub fn summary(&self, max_error_lines: usize) -> String {
    let mut out = format!("{} updated, {} failed", self.success_count, self.failed_count);
    for line in self.errors.iter().take(max_error_lines) {
      out.push('\n');
      out.push_str(line);
    }
    if self.errors.len() > max_error_lines {
      out.push_str(&format!(
        "\n... and {} more",
        self.errors.len() - max_error_lines
      ));
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ticket(formatted_id: &str) -> Ticket {
    Ticket {
      formatted_id: formatted_id.to_string(),
      name: format!("Ticket {}", formatted_id),
      kind: "HierarchicalRequirement".to_string(),
      schedule_state: "Defined".to_string(),
      owner: None,
      iteration: None,
      plan_estimate: None,
      description: String::new(),
      notes: String::new(),
      parent: None,
      object_id: Some(format!("oid-{}", formatted_id)),
    }
  }

  #[test]
  fn test_scope_cache_key_is_stable_and_distinct() {
    let a = Scope::new("Acme", "Platform");
    let b = Scope::new("Acme", "Platform");
    let c = Scope::new("Acme", "Mobile");

    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), c.cache_key());
    // hex sha256
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_entity_kind_from_formatted_id() {
    assert_eq!(EntityKind::for_formatted_id("US1234"), Some(EntityKind::Story));
    assert_eq!(EntityKind::for_formatted_id("DE7"), Some(EntityKind::Defect));
    assert_eq!(EntityKind::for_formatted_id("TA99"), None);
  }

  #[test]
  fn test_field_change_satisfied() {
    let mut t = ticket("US1");
    t.schedule_state = "In-Progress".to_string();
    t.owner = Some("sam".to_string());
    t.plan_estimate = Some(3.0);

    assert!(FieldChange::SetState("In-Progress".into()).is_satisfied_by(&t));
    assert!(!FieldChange::SetState("Accepted".into()).is_satisfied_by(&t));
    assert!(FieldChange::SetOwner("sam".into()).is_satisfied_by(&t));
    assert!(!FieldChange::SetIteration("Sprint 9".into()).is_satisfied_by(&t));
    assert!(FieldChange::SetPoints(3.0).is_satisfied_by(&t));
    assert!(!FieldChange::SetPoints(5.0).is_satisfied_by(&t));
  }

  #[test]
  fn test_changes_to_fields() {
    let fields = changes_to_fields(&[
      FieldChange::SetState("Accepted".into()),
      FieldChange::SetPoints(2.0),
    ]);
    assert_eq!(fields["ScheduleState"], "Accepted");
    assert_eq!(fields["PlanEstimate"], 2.0);
  }

  #[test]
  fn test_iteration_owners_grouping() {
    let mut a = ticket("US1");
    a.iteration = Some("Sprint 1".into());
    a.owner = Some("alice".into());
    let mut b = ticket("US2");
    b.iteration = Some("Sprint 1".into());
    b.owner = Some("bob".into());
    let mut c = ticket("US3");
    c.iteration = Some("Sprint 2".into());
    c.owner = Some("alice".into());
    // No iteration: contributes nothing
    let mut d = ticket("US4");
    d.owner = Some("carol".into());

    let owners = IterationOwners::build(&[a, b, c, d]);

    let sprint1: Vec<_> = owners.owners("Sprint 1").unwrap().iter().collect();
    assert_eq!(sprint1, vec!["alice", "bob"]);
    assert_eq!(owners.owners("Sprint 2").unwrap().len(), 1);
    assert!(owners.owners("Sprint 3").is_none());
    assert_eq!(owners.iterations().count(), 2);
  }

  #[test]
  fn test_bulk_summary_truncation() {
    let result = BulkResult {
      success_count: 8,
      failed_count: 2,
      updated: Vec::new(),
      errors: vec!["US1: boom".to_string(), "US2: boom".to_string()],
    };

    let summary = result.summary(1);
    assert!(summary.starts_with("8 updated, 2 failed"));
    assert!(summary.contains("US1: boom"));
    assert!(!summary.contains("US2: boom"));
    assert!(summary.ends_with("... and 1 more"));

    // No truncation marker when everything fits
    assert!(!result.summary(5).contains("more"));
  }
}
