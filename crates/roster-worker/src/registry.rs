//! A [`RegistryClient`] over the registry's FHIR R4 `Patient` endpoints.
//!
//! | Call | Request |
//! |------|---------|
//! | search | `GET {base}/Patient?family=&given=&birthdate=eq{dob}&address-postalcode=&_history=&_fuzzy-match=` |
//! | lookup | `GET {base}/Patient/{id}` |
//!
//! Status mapping: `429` is [`RegistryError::RateLimited`] (honouring
//! `Retry-After`), other non-success statuses are
//! [`RegistryError::Transport`], and a client-side timeout is
//! [`RegistryError::Timeout`]. On lookup, a `400` for a malformed identifier
//! and a `404` whose OperationOutcome carries `INVALIDATED_RESOURCE` are both
//! [`Lookup::Invalidated`]: the patient is flagged and keeps the identifier.
//! Any other `404` is [`Lookup::NotFound`].

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{Client, Response, StatusCode, header::RETRY_AFTER};
use roster_core::{
  patient::{Demographics, RegistryId, RegistryRecord},
  registry::{Lookup, RegistryClient, RegistryError, SearchMatch},
  search::SearchQuery,
};
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

const INVALIDATED_RESOURCE: &str = "INVALIDATED_RESOURCE";
const TOO_MANY_MATCHES: &str = "TOO_MANY_MATCHES";

/// Connection settings for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
  pub base_url: String,
  /// Upper bound on a single request, connection included.
  pub timeout:  Duration,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:9090/FHIR/R4".to_owned(),
      timeout:  Duration::from_secs(10),
    }
  }
}

/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct HttpRegistryClient {
  client:   Client,
  base_url: String,
}

impl HttpRegistryClient {
  pub fn new(config: RegistryConfig) -> Result<Self> {
    let base_url = config.base_url.trim_end_matches('/').to_owned();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
      return Err(Error::InvalidBaseUrl(config.base_url));
    }
    let client = Client::builder()
      .timeout(config.timeout)
      .build()
      .map_err(Error::Http)?;
    Ok(Self { client, base_url })
  }

  fn url(&self, path: &str) -> String { format!("{}{path}", self.base_url) }
}

impl RegistryClient for HttpRegistryClient {
  async fn search(&self, query: &SearchQuery) -> Result<SearchMatch, RegistryError> {
    let resp = self
      .client
      .get(self.url("/Patient"))
      .header("Accept", "application/fhir+json")
      .query(&[
        ("family", query.family_name.clone()),
        ("given", query.given_name.clone()),
        ("birthdate", format!("eq{}", query.date_of_birth)),
        ("address-postalcode", query.postcode.clone()),
        ("_history", query.history.to_string()),
        ("_fuzzy-match", query.fuzzy.to_string()),
      ])
      .send()
      .await
      .map_err(transport)?;

    let resp = ensure_success(resp)?;
    let body = resp.text().await.map_err(transport)?;
    let found = parse_search(&body)?;
    debug!(family = %query.family_name, ?found, "registry search");
    Ok(found)
  }

  async fn find_by_identifier(&self, id: &RegistryId) -> Result<Lookup, RegistryError> {
    let resp = self
      .client
      .get(self.url(&format!("/Patient/{id}")))
      .header("Accept", "application/fhir+json")
      .send()
      .await
      .map_err(transport)?;

    match resp.status() {
      StatusCode::NOT_FOUND => {
        let body = resp.text().await.map_err(transport)?;
        Ok(parse_missing(&body))
      }
      StatusCode::BAD_REQUEST => {
        debug!(registry_id = %id, "registry rejected identifier");
        Ok(Lookup::Invalidated)
      }
      _ => {
        let body = ensure_success(resp)?.text().await.map_err(transport)?;
        parse_patient(&body).map(Lookup::Found)
      }
    }
  }
}

// ─── Status handling ──────────────────────────────────────────────────────────

fn transport(e: reqwest::Error) -> RegistryError {
  if e.is_timeout() {
    RegistryError::Timeout
  } else {
    RegistryError::Transport(e.to_string())
  }
}

fn ensure_success(resp: Response) -> Result<Response, RegistryError> {
  let status = resp.status();
  if status == StatusCode::TOO_MANY_REQUESTS {
    let retry_after = resp
      .headers()
      .get(RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Duration::from_secs);
    return Err(RegistryError::RateLimited { retry_after });
  }
  if !status.is_success() {
    return Err(RegistryError::Transport(format!("registry returned {status}")));
  }
  Ok(resp)
}

// ─── FHIR payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Bundle {
  #[serde(default)]
  total: Option<u64>,
  #[serde(default)]
  entry: Vec<BundleEntry>,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
  resource: Resource,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resourceType")]
enum Resource {
  Patient(FhirPatient),
  OperationOutcome(OperationOutcome),
  #[serde(other)]
  Other,
}

#[derive(Debug, Deserialize)]
struct FhirPatient {
  id:         String,
  #[serde(default)]
  name:       Vec<HumanName>,
  #[serde(rename = "birthDate")]
  birth_date: NaiveDate,
  #[serde(default)]
  address:    Vec<Address>,
}

#[derive(Debug, Deserialize)]
struct HumanName {
  #[serde(rename = "use", default)]
  usage:  Option<String>,
  #[serde(default)]
  given:  Vec<String>,
  #[serde(default)]
  family: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Address {
  #[serde(rename = "postalCode", default)]
  postal_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationOutcome {
  #[serde(default)]
  issue: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
  #[serde(default)]
  details: Option<CodeableConcept>,
}

#[derive(Debug, Deserialize)]
struct CodeableConcept {
  #[serde(default)]
  coding: Vec<Coding>,
}

#[derive(Debug, Deserialize)]
struct Coding {
  code: String,
}

impl OperationOutcome {
  fn has_code(&self, code: &str) -> bool {
    self
      .issue
      .iter()
      .filter_map(|i| i.details.as_ref())
      .flat_map(|d| &d.coding)
      .any(|c| c.code == code)
  }
}

impl FhirPatient {
  fn into_record(self) -> Result<RegistryRecord, RegistryError> {
    let name = self
      .name
      .iter()
      .find(|n| n.usage.as_deref() == Some("usual"))
      .or_else(|| self.name.first())
      .ok_or_else(|| {
        RegistryError::Transport(format!("registry record {} has no name", self.id))
      })?;

    Ok(RegistryRecord {
      registry_id:  RegistryId::new(self.id.clone()),
      demographics: Demographics {
        given_name:    name.given.first().cloned().unwrap_or_default(),
        family_name:   name.family.clone().unwrap_or_default(),
        date_of_birth: self.birth_date,
        postcode:      self.address.into_iter().find_map(|a| a.postal_code),
      },
    })
  }
}

fn malformed(e: serde_json::Error) -> RegistryError {
  RegistryError::Transport(format!("malformed registry response: {e}"))
}

fn parse_search(body: &str) -> Result<SearchMatch, RegistryError> {
  let bundle: Bundle = serde_json::from_str(body).map_err(malformed)?;

  let mut ids = Vec::new();
  for entry in bundle.entry {
    match entry.resource {
      Resource::OperationOutcome(o) if o.has_code(TOO_MANY_MATCHES) => {
        return Ok(SearchMatch::TooManyMatches);
      }
      Resource::Patient(p) => ids.push(p.id),
      _ => {}
    }
  }

  let total = bundle.total.map_or(ids.len(), |t| t as usize);
  Ok(match (total, ids.pop()) {
    (0, _) | (_, None) => SearchMatch::NoMatch,
    (1, Some(id)) => SearchMatch::OneMatch(RegistryId::new(id)),
    _ => SearchMatch::TooManyMatches,
  })
}

fn parse_missing(body: &str) -> Lookup {
  let outcome: OperationOutcome = serde_json::from_str(body).unwrap_or_default();
  if outcome.has_code(INVALIDATED_RESOURCE) {
    Lookup::Invalidated
  } else {
    Lookup::NotFound
  }
}

fn parse_patient(body: &str) -> Result<RegistryRecord, RegistryError> {
  let patient: FhirPatient = serde_json::from_str(body).map_err(malformed)?;
  patient.into_record()
}
