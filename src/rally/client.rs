//! Rally WSAPI client.
//!
//! All outbound traffic funnels through one request path that acquires
//! a permit from the shared concurrency limiter, applies the per-call
//! timeout, retries connectivity-class failures with capped exponential
//! backoff, and inspects the response envelope before anything reaches
//! the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

use super::api_types::{ApiCreateResponse, ApiOperationResponse, ApiQueryResponse};
use super::gateway::TicketGateway;
use super::types::{changes_to_fields, EntityKind, FieldChange, Ticket};

/// Fields requested on every work item read. Tickets are always fully
/// populated; there is no lazy loading.
const FETCH_FIELDS: &[&str] = &[
  "FormattedID",
  "Name",
  "ScheduleState",
  "Owner",
  "Iteration",
  "PlanEstimate",
  "Description",
  "Notes",
  "Parent",
  "ObjectID",
];

const PAGE_SIZE: u64 = 100;

/// Backoff schedule for connectivity-class failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Attempts for idempotent calls (reads and field updates)
  pub max_attempts: u32,
  pub base_delay: Duration,
  /// Ceiling on any single backoff delay
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(5),
    }
  }
}

impl RetryPolicy {
  /// Delay before the attempt following `attempt` (1-based), doubling
  /// from `base_delay` up to `max_delay`.
  fn delay(&self, attempt: u32) -> Duration {
    let exp = self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(self.max_delay)
  }
}

/// Retry `op` on connectivity-class failures, up to `max_attempts`
/// total attempts. Application errors are never retried.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
  policy: &RetryPolicy,
  max_attempts: u32,
  mut op: F,
) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut attempt = 1u32;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_connectivity() && attempt < max_attempts => {
        let delay = policy.delay(attempt);
        warn!(
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %e,
          "retrying after connectivity failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

/// Map a transport status to the error taxonomy. 5xx and 429 are
/// connectivity-class (retryable); other non-success statuses are
/// application errors.
fn check_status(status: StatusCode) -> Result<()> {
  if status.is_success() {
    Ok(())
  } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    Err(Error::Connectivity(format!("HTTP {}", status)))
  } else {
    Err(Error::Application(format!("HTTP {}", status)))
  }
}

/// Inspect a result envelope. WSAPI reports failures inside a 200
/// response, so this runs on every call regardless of status code.
fn check_envelope(errors: &[String], warnings: &[String], context: &str) -> Result<()> {
  for warning in warnings {
    warn!(context, warning = %warning, "Rally warning");
  }
  if errors.is_empty() {
    Ok(())
  } else {
    Err(Error::Application(errors.join("; ")))
  }
}

/// Compose the effective query predicate: the project clause alone, or
/// ANDed with the caller's predicate.
fn compose_query(project: &str, query: Option<&str>) -> String {
  let project_clause = format!("(Project.Name = \"{}\")", project);
  match query {
    Some(q) if !q.trim().is_empty() => format!("({} AND {})", project_clause, q.trim()),
    _ => project_clause,
  }
}

/// Rally WSAPI client wrapper.
#[derive(Clone)]
pub struct RallyClient {
  http: reqwest::Client,
  base: Url,
  project: String,
  limiter: Arc<Semaphore>,
  max_in_flight: usize,
  retry: RetryPolicy,
}

impl RallyClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_api_key(config, &api_key)
  }

  pub fn with_api_key(config: &Config, api_key: &str) -> Result<Self> {
    let mut headers = header::HeaderMap::new();
    let key = header::HeaderValue::from_str(api_key)
      .map_err(|e| Error::Config(format!("Rally API key is invalid: {}", e)))?;
    headers.insert("zsessionid", key);
    headers.insert(
      header::CONTENT_TYPE,
      header::HeaderValue::from_static("application/json"),
    );

    let http = reqwest::Client::builder()
      .timeout(config.request_timeout())
      .default_headers(headers)
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    let base = Url::parse(&config.rally.url)
      .and_then(|u| u.join("/slm/webservice/v2.0/"))
      .map_err(|e| Error::Config(format!("Invalid Rally URL {}: {}", config.rally.url, e)))?;

    Ok(Self {
      http,
      base,
      project: config.rally.project.clone(),
      limiter: Arc::new(Semaphore::new(config.rally.max_concurrent_requests)),
      max_in_flight: config.rally.max_concurrent_requests,
      retry: RetryPolicy::default(),
    })
  }

  /// The shared concurrency limiter. One permit is held per outbound
  /// request, across direct calls and bulk fan-out alike.
  pub fn limiter(&self) -> Arc<Semaphore> {
    Arc::clone(&self.limiter)
  }

  /// Size of the limiter; the bulk coordinator uses this as its
  /// dispatch width.
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight
  }

  fn endpoint_url(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| Error::Application(format!("invalid endpoint {}: {}", path, e)))
  }

  /// One attempt: take a throttle permit, issue the request, check the
  /// transport status. The permit is released when this returns, on
  /// every path.
  async fn attempt<T: DeserializeOwned>(
    &self,
    method: Method,
    url: Url,
    body: Option<&Value>,
    idempotency_key: Option<&str>,
  ) -> Result<T> {
    let _permit = self
      .limiter
      .acquire()
      .await
      .map_err(|_| Error::Connectivity("request limiter closed".to_string()))?;

    let mut req = self.http.request(method, url);
    if let Some(body) = body {
      req = req.json(body);
    }
    if let Some(key) = idempotency_key {
      req = req.header("X-Idempotency-Key", key);
    }

    let resp = req.send().await?;
    check_status(resp.status())?;
    Ok(resp.json::<T>().await?)
  }

  async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    url: Url,
    body: Option<Value>,
    idempotency_key: Option<&str>,
    max_attempts: u32,
  ) -> Result<T> {
    retry_with_backoff(&self.retry, max_attempts, || {
      self.attempt(method.clone(), url.clone(), body.as_ref(), idempotency_key)
    })
    .await
  }

  /// Fetch with an explicit requested-field list.
  pub async fn fetch_with_fields(
    &self,
    kinds: &[EntityKind],
    query: Option<&str>,
    fields: &[&str],
  ) -> Result<Vec<Ticket>> {
    let mut all = Vec::new();
    for kind in kinds {
      all.extend(self.fetch_kind(*kind, query, fields).await?);
    }
    Ok(all)
  }

  async fn fetch_kind(
    &self,
    kind: EntityKind,
    query: Option<&str>,
    fields: &[&str],
  ) -> Result<Vec<Ticket>> {
    let mut tickets = Vec::new();
    let mut start = 1u64;

    loop {
      let mut url = self.endpoint_url(kind.endpoint())?;
      url
        .query_pairs_mut()
        .append_pair("query", &compose_query(&self.project, query))
        .append_pair("fetch", &fields.join(","))
        .append_pair("pagesize", &PAGE_SIZE.to_string())
        .append_pair("start", &start.to_string());

      let resp: ApiQueryResponse = self
        .request(Method::GET, url, None, None, self.retry.max_attempts)
        .await?;
      let result = resp.query_result;
      check_envelope(&result.errors, &result.warnings, kind.endpoint())?;

      let count = result.results.len() as u64;
      tickets.extend(result.results.into_iter().map(|w| w.into_ticket(kind)));

      debug!(
        endpoint = kind.endpoint(),
        start,
        count,
        total = result.total_result_count,
        "fetched page"
      );

      // start is 1-based; stop once the last page is in
      if count == 0 || start + count > result.total_result_count {
        break;
      }
      start += count;
    }

    Ok(tickets)
  }

  fn kind_of(ticket: &Ticket) -> EntityKind {
    EntityKind::ALL
      .iter()
      .copied()
      .find(|k| k.type_name() == ticket.kind)
      .or_else(|| EntityKind::for_formatted_id(&ticket.formatted_id))
      .unwrap_or(EntityKind::Story)
  }
}

#[async_trait]
impl TicketGateway for RallyClient {
  async fn fetch(&self, kinds: &[EntityKind], query: Option<&str>) -> Result<Vec<Ticket>> {
    self.fetch_with_fields(kinds, query, FETCH_FIELDS).await
  }

  async fn fetch_one(&self, formatted_id: &str) -> Result<Option<Ticket>> {
    let kinds = match EntityKind::for_formatted_id(formatted_id) {
      Some(kind) => vec![kind],
      None => EntityKind::ALL.to_vec(),
    };

    let predicate = format!("(FormattedID = \"{}\")", formatted_id);
    for kind in kinds {
      let mut url = self.endpoint_url(kind.endpoint())?;
      url
        .query_pairs_mut()
        .append_pair("query", &compose_query(&self.project, Some(&predicate)))
        .append_pair("fetch", &FETCH_FIELDS.join(","))
        .append_pair("pagesize", "1")
        .append_pair("start", "1");

      let resp: ApiQueryResponse = self
        .request(Method::GET, url, None, None, self.retry.max_attempts)
        .await?;
      let result = resp.query_result;
      check_envelope(&result.errors, &result.warnings, kind.endpoint())?;

      if let Some(item) = result.results.into_iter().next() {
        return Ok(Some(item.into_ticket(kind)));
      }
    }

    Ok(None)
  }

  async fn mutate(&self, ticket: &Ticket, changes: &[FieldChange]) -> Result<Option<Ticket>> {
    // Resolve the server-side object id, falling back to a lookup for
    // tickets loaded before the id was cached.
    let (kind, object_id) = if let Some(object_id) = &ticket.object_id {
      (Self::kind_of(ticket), object_id.clone())
    } else {
      let resolved = match self.fetch_one(&ticket.formatted_id).await? {
        Some(t) => t,
        None => return Ok(None),
      };
      match resolved.object_id.clone() {
        Some(object_id) => (Self::kind_of(&resolved), object_id),
        None => return Ok(None),
      }
    };

    let url = self.endpoint_url(&format!("{}/{}", kind.endpoint(), object_id))?;
    let body = serde_json::json!({ kind.type_name(): changes_to_fields(changes) });

    let resp: ApiOperationResponse = self
      .request(Method::POST, url, Some(body), None, self.retry.max_attempts)
      .await?;
    let result = resp.operation_result;
    check_envelope(&result.errors, &result.warnings, "update")?;

    Ok(result.object.map(|w| w.into_ticket(kind)))
  }

  async fn create(
    &self,
    kind: EntityKind,
    fields: serde_json::Map<String, Value>,
    idempotency_key: Option<&str>,
  ) -> Result<Option<Ticket>> {
    let url = self.endpoint_url(&format!("{}/create", kind.endpoint()))?;
    let body = serde_json::json!({ kind.type_name(): fields });

    // Creates are not idempotent: without a key a failure is surfaced
    // rather than retried, to avoid duplicate work items.
    let max_attempts = if idempotency_key.is_some() { 2 } else { 1 };

    let resp: ApiCreateResponse = self
      .request(Method::POST, url, Some(body), idempotency_key, max_attempts)
      .await?;
    let result = resp.create_result;
    check_envelope(&result.errors, &result.warnings, "create")?;

    Ok(result.object.map(|w| w.into_ticket(kind)))
  }
}
