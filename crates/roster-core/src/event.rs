//! Domain events recorded alongside the changes they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
pub enum EventKind {
  #[serde(rename = "patient.merged")]
  #[strum(serialize = "patient.merged")]
  PatientMerged,
  #[serde(rename = "patient.identifier_resolved")]
  #[strum(serialize = "patient.identifier_resolved")]
  IdentifierResolved,
}

/// An outbox entry. Written in the same transaction as the change, so each
/// committed merge or resolution produces exactly one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
  pub event_id:    Uuid,
  pub kind:        EventKind,
  pub payload:     serde_json::Value,
  pub recorded_at: DateTime<Utc>,
}

impl DomainEvent {
  pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
    Self {
      event_id: Uuid::new_v4(),
      kind,
      payload,
      recorded_at: Utc::now(),
    }
  }
}
