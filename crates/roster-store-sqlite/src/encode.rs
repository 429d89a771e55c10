//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, dates are `YYYY-MM-DD`, UUIDs are
//! hyphenated lowercase strings. Status and outcome enums use their
//! snake_case names; `Resolution`, `Rejection` and search histories are
//! compact JSON.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use roster_core::{
  changeset::{Changeset, Import},
  event::DomainEvent,
  patient::{Demographics, Patient, RegistryId},
  search::SearchResultEntry,
  step_table::StepName,
};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn encode_date(d: NaiveDate) -> String { d.format(DATE_FORMAT).to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT)
    .map_err(|e| Error::DateParse(e.to_string()))
}

/// Parse a strum-backed enum column.
pub fn decode_enum<T: FromStr>(column: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| Error::Decode { column, value: s.to_owned() })
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
  Ok(serde_json::to_string(value)?)
}

pub fn decode_json<T: DeserializeOwned>(s: &str) -> Result<T> {
  Ok(serde_json::from_str(s)?)
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const PATIENT_COLUMNS: &str = "patient_id, registry_id, given_name, \
   family_name, date_of_birth, postcode, invalidated_at, created_at, updated_at";

/// Raw strings read directly from a `patients` row.
pub struct RawPatient {
  pub patient_id:     String,
  pub registry_id:    Option<String>,
  pub given_name:     String,
  pub family_name:    String,
  pub date_of_birth:  String,
  pub postcode:       Option<String>,
  pub invalidated_at: Option<String>,
  pub created_at:     String,
  pub updated_at:     String,
}

impl RawPatient {
  /// Map a row selected with [`PATIENT_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      patient_id:     row.get(0)?,
      registry_id:    row.get(1)?,
      given_name:     row.get(2)?,
      family_name:    row.get(3)?,
      date_of_birth:  row.get(4)?,
      postcode:       row.get(5)?,
      invalidated_at: row.get(6)?,
      created_at:     row.get(7)?,
      updated_at:     row.get(8)?,
    })
  }

  pub fn into_patient(self) -> Result<Patient> {
    Ok(Patient {
      patient_id:     decode_uuid(&self.patient_id)?,
      registry_id:    self.registry_id.map(RegistryId::new),
      demographics:   Demographics {
        given_name:    self.given_name,
        family_name:   self.family_name,
        date_of_birth: decode_date(&self.date_of_birth)?,
        postcode:      self.postcode,
      },
      invalidated_at: self.invalidated_at.as_deref().map(decode_dt).transpose()?,
      created_at:     decode_dt(&self.created_at)?,
      updated_at:     decode_dt(&self.updated_at)?,
    })
  }
}

pub const CHANGESET_COLUMNS: &str = "changeset_id, import_id, row_number, \
   given_name, family_name, date_of_birth, postcode, uploaded_registry_id, \
   status, resolution, search_results, staged_registry_id, invalid_reason, \
   patient_id";

/// Raw strings read directly from a `changesets` row.
pub struct RawChangeset {
  pub changeset_id:         String,
  pub import_id:            String,
  pub row_number:           u32,
  pub given_name:           String,
  pub family_name:          String,
  pub date_of_birth:        String,
  pub postcode:             Option<String>,
  pub uploaded_registry_id: Option<String>,
  pub status:               String,
  pub resolution:           Option<String>,
  pub search_results:       String,
  pub staged_registry_id:   Option<String>,
  pub invalid_reason:       Option<String>,
  pub patient_id:           Option<String>,
}

impl RawChangeset {
  /// Map a row selected with [`CHANGESET_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      changeset_id:         row.get(0)?,
      import_id:            row.get(1)?,
      row_number:           row.get(2)?,
      given_name:           row.get(3)?,
      family_name:          row.get(4)?,
      date_of_birth:        row.get(5)?,
      postcode:             row.get(6)?,
      uploaded_registry_id: row.get(7)?,
      status:               row.get(8)?,
      resolution:           row.get(9)?,
      search_results:       row.get(10)?,
      staged_registry_id:   row.get(11)?,
      invalid_reason:       row.get(12)?,
      patient_id:           row.get(13)?,
    })
  }

  pub fn into_changeset(self) -> Result<Changeset> {
    Ok(Changeset {
      changeset_id:         decode_uuid(&self.changeset_id)?,
      import_id:            decode_uuid(&self.import_id)?,
      row_number:           self.row_number,
      demographics:         Demographics {
        given_name:    self.given_name,
        family_name:   self.family_name,
        date_of_birth: decode_date(&self.date_of_birth)?,
        postcode:      self.postcode,
      },
      uploaded_registry_id: self.uploaded_registry_id.map(RegistryId::new),
      status:               decode_enum("changesets.status", &self.status)?,
      resolution:           self.resolution.as_deref().map(decode_json).transpose()?,
      search_results:       decode_json(&self.search_results)?,
      staged_registry_id:   self.staged_registry_id.map(RegistryId::new),
      invalid_reason:       self
        .invalid_reason
        .as_deref()
        .map(|s| decode_enum("changesets.invalid_reason", s))
        .transpose()?,
      patient_id:           self.patient_id.as_deref().map(decode_uuid).transpose()?,
    })
  }
}

pub const IMPORT_COLUMNS: &str =
  "import_id, status, row_count, match_rate, rejection, created_at, processed_at";

/// Raw strings read directly from an `imports` row.
pub struct RawImport {
  pub import_id:    String,
  pub status:       String,
  pub row_count:    i64,
  pub match_rate:   Option<f64>,
  pub rejection:    Option<String>,
  pub created_at:   String,
  pub processed_at: Option<String>,
}

impl RawImport {
  /// Map a row selected with [`IMPORT_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      import_id:    row.get(0)?,
      status:       row.get(1)?,
      row_count:    row.get(2)?,
      match_rate:   row.get(3)?,
      rejection:    row.get(4)?,
      created_at:   row.get(5)?,
      processed_at: row.get(6)?,
    })
  }

  pub fn into_import(self) -> Result<Import> {
    Ok(Import {
      import_id:    decode_uuid(&self.import_id)?,
      status:       decode_enum("imports.status", &self.status)?,
      row_count:    usize::try_from(self.row_count).unwrap_or_default(),
      match_rate:   self.match_rate,
      rejection:    self.rejection.as_deref().map(decode_json).transpose()?,
      created_at:   decode_dt(&self.created_at)?,
      processed_at: self.processed_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

/// Raw strings read directly from a `search_results` row.
pub struct RawSearchResult {
  pub step:        String,
  pub outcome:     String,
  pub registry_id: Option<String>,
  pub created_at:  String,
}

impl RawSearchResult {
  pub fn into_entry(self) -> Result<SearchResultEntry> {
    Ok(SearchResultEntry {
      step:        StepName::new(self.step),
      outcome:     decode_enum("search_results.outcome", &self.outcome)?,
      registry_id: self.registry_id.map(RegistryId::new),
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read directly from an `events` row.
pub struct RawEvent {
  pub event_id:    String,
  pub kind:        String,
  pub payload:     String,
  pub recorded_at: String,
}

impl RawEvent {
  pub fn into_event(self) -> Result<DomainEvent> {
    Ok(DomainEvent {
      event_id:    decode_uuid(&self.event_id)?,
      kind:        decode_enum("events.kind", &self.kind)?,
      payload:     decode_json(&self.payload)?,
      recorded_at: decode_dt(&self.recorded_at)?,
    })
  }
}
