//! Serde-deserializable types matching Rally WSAPI responses.
//!
//! These types are separate from domain types to allow clean
//! deserialization while keeping domain types focused on application
//! needs. Every response is wrapped in a result envelope whose Errors
//! collection must be checked regardless of HTTP status.

use serde::Deserialize;
use serde_json::Value;

use super::types::{EntityKind, Ticket};

// ============================================================================
// Result envelopes
// ============================================================================

/// Envelope around query (read) responses.
#[derive(Debug, Deserialize)]
pub struct ApiQueryResponse {
  #[serde(rename = "QueryResult")]
  pub query_result: ApiQueryResult,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiQueryResult {
  #[serde(rename = "Errors", default)]
  pub errors: Vec<String>,
  #[serde(rename = "Warnings", default)]
  pub warnings: Vec<String>,
  #[serde(rename = "TotalResultCount", default)]
  pub total_result_count: u64,
  #[serde(rename = "StartIndex", default)]
  pub start_index: u64,
  #[serde(rename = "PageSize", default)]
  pub page_size: u64,
  #[serde(rename = "Results", default)]
  pub results: Vec<ApiWorkItem>,
}

/// Envelope around update responses.
#[derive(Debug, Deserialize)]
pub struct ApiOperationResponse {
  #[serde(rename = "OperationResult")]
  pub operation_result: ApiMutationResult,
}

/// Envelope around create responses.
#[derive(Debug, Deserialize)]
pub struct ApiCreateResponse {
  #[serde(rename = "CreateResult")]
  pub create_result: ApiMutationResult,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiMutationResult {
  #[serde(rename = "Errors", default)]
  pub errors: Vec<String>,
  #[serde(rename = "Warnings", default)]
  pub warnings: Vec<String>,
  #[serde(rename = "Object")]
  pub object: Option<ApiWorkItem>,
}

// ============================================================================
// Work item payload
// ============================================================================

/// Raw work item as WSAPI returns it.
///
/// Reference fields (Owner, Iteration, Parent, ScheduleState) are kept
/// as `Value` because their shape is not contractually stable: the same
/// field may arrive as a plain string, a ref object, or null.
#[derive(Debug, Default, Deserialize)]
pub struct ApiWorkItem {
  #[serde(rename = "FormattedID", default)]
  pub formatted_id: String,
  #[serde(rename = "Name", default)]
  pub name: String,
  #[serde(rename = "_type", default)]
  pub type_name: String,
  #[serde(rename = "ScheduleState")]
  pub schedule_state: Option<Value>,
  #[serde(rename = "Owner")]
  pub owner: Option<Value>,
  #[serde(rename = "Iteration")]
  pub iteration: Option<Value>,
  #[serde(rename = "PlanEstimate")]
  pub plan_estimate: Option<f64>,
  #[serde(rename = "Description", default)]
  pub description: String,
  #[serde(rename = "Notes", default)]
  pub notes: String,
  #[serde(rename = "Parent")]
  pub parent: Option<Value>,
  #[serde(rename = "ObjectID")]
  pub object_id: Option<Value>,
}

impl ApiWorkItem {
  /// Convert to the normalized domain ticket.
  ///
  /// `fallback_kind` is the endpoint the item was fetched from, used
  /// when the payload omits `_type`.
  pub fn into_ticket(self, fallback_kind: EntityKind) -> Ticket {
    let kind = if self.type_name.is_empty() {
      fallback_kind.type_name().to_string()
    } else {
      self.type_name
    };

    Ticket {
      formatted_id: self.formatted_id,
      name: self.name,
      kind,
      schedule_state: self
        .schedule_state
        .as_ref()
        .map(display_name)
        .unwrap_or_else(|| "Unknown".to_string()),
      owner: optional_display_name(self.owner.as_ref()),
      iteration: optional_display_name(self.iteration.as_ref()),
      plan_estimate: self.plan_estimate,
      description: self.description,
      notes: self.notes,
      parent: extract_parent(self.parent.as_ref()),
      object_id: self.object_id.as_ref().and_then(extract_object_id),
    }
  }
}

// ============================================================================
// Field normalization
// ============================================================================

/// Coerce a duck-typed WSAPI field to its display name.
///
/// Fixed precedence, in order:
/// 1. plain string passthrough
/// 2. object carrying the `_refObjectName` display-name key
/// 3. object carrying a `Name` attribute
/// 4. stringify the raw value
/// 5. `"Unknown"` for null
pub fn display_name(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Object(obj) => {
      if let Some(name) = obj.get("_refObjectName").and_then(Value::as_str) {
        name.to_string()
      } else if let Some(name) = obj.get("Name").and_then(Value::as_str) {
        name.to_string()
      } else {
        value.to_string()
      }
    }
    Value::Null => "Unknown".to_string(),
    other => other.to_string(),
  }
}

/// Like `display_name`, but absent and null both mean "no value" rather
/// than the Unknown sentinel. Used for genuinely optional fields.
fn optional_display_name(value: Option<&Value>) -> Option<String> {
  match value {
    None | Some(Value::Null) => None,
    Some(v) => Some(display_name(v)),
  }
}

/// Parent references carry a FormattedID when expanded; fall back to
/// the display-name chain otherwise.
fn extract_parent(value: Option<&Value>) -> Option<String> {
  let value = value?;
  if value.is_null() {
    return None;
  }
  if let Some(id) = value.get("FormattedID").and_then(Value::as_str) {
    return Some(id.to_string());
  }
  Some(display_name(value))
}

/// ObjectID arrives as a number in query results but as a string in
/// some mutation envelopes.
fn extract_object_id(value: &Value) -> Option<String> {
  match value {
    Value::Number(n) => Some(n.to_string()),
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    _ => None,
  }
}
