//! Patient records, registry identifiers and staged demographic updates.
//!
//! A [`Patient`] is the canonical local identity. Its optional
//! [`RegistryId`] links it to the national demographics registry and is
//! globally unique when present.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Registry identifier ─────────────────────────────────────────────────────

/// The unique identity key issued by the external registry.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RegistryId(String);

impl RegistryId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for RegistryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ─── Demographics ────────────────────────────────────────────────────────────

/// The fields used to match a person against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
  pub given_name:    String,
  pub family_name:   String,
  pub date_of_birth: NaiveDate,
  pub postcode:      Option<String>,
}

impl Demographics {
  /// The postcode, if present and not blank.
  pub fn postcode(&self) -> Option<&str> {
    self.postcode.as_deref().map(str::trim).filter(|p| !p.is_empty())
  }
}

// ─── Patient ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
  pub patient_id:     Uuid,
  pub registry_id:    Option<RegistryId>,
  pub demographics:   Demographics,
  /// Set when the registry reported the identifier as an invalidated
  /// resource.
  pub invalidated_at: Option<DateTime<Utc>>,
  pub created_at:     DateTime<Utc>,
  pub updated_at:     DateTime<Utc>,
}

impl Patient {
  pub fn is_invalidated(&self) -> bool { self.invalidated_at.is_some() }
}

/// Input to [`crate::store::PatientStore::add_patient`].
#[derive(Debug, Clone)]
pub struct NewPatient {
  pub registry_id:  Option<RegistryId>,
  pub demographics: Demographics,
}

/// Demographics as currently held by the registry for one identifier.
///
/// `registry_id` may differ from the identifier that was looked up when the
/// registry has superseded it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRecord {
  pub registry_id:  RegistryId,
  pub demographics: Demographics,
}

// ─── Pending changes ─────────────────────────────────────────────────────────

/// A demographic attribute that can be staged for update.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Attribute {
  GivenName,
  FamilyName,
  DateOfBirth,
  Postcode,
}

const DATE_FORMAT: &str = "%Y-%m-%d";

fn non_blank(value: &str) -> Option<&str> {
  let value = value.trim();
  (!value.is_empty()).then_some(value)
}

/// Attribute writes staged against a patient, keyed by attribute.
///
/// Only values that differ from the record they were staged against are kept.
/// Applying is idempotent: once applied, the same set stages to nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingChanges(BTreeMap<Attribute, String>);

impl PendingChanges {
  /// Stage the registry's values for every attribute where they differ from
  /// `current`. A blank or missing value from the registry never clears a
  /// local one.
  pub fn stage(current: &Demographics, incoming: &Demographics) -> Self {
    let mut changes = BTreeMap::new();

    if let Some(given) = non_blank(&incoming.given_name)
      && given != current.given_name
    {
      changes.insert(Attribute::GivenName, given.to_owned());
    }
    if let Some(family) = non_blank(&incoming.family_name)
      && family != current.family_name
    {
      changes.insert(Attribute::FamilyName, family.to_owned());
    }
    if incoming.date_of_birth != current.date_of_birth {
      changes.insert(
        Attribute::DateOfBirth,
        incoming.date_of_birth.format(DATE_FORMAT).to_string(),
      );
    }
    if let Some(postcode) = incoming.postcode()
      && current.postcode() != Some(postcode)
    {
      changes.insert(Attribute::Postcode, postcode.to_owned());
    }

    Self(changes)
  }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn get(&self, attribute: Attribute) -> Option<&str> {
    self.0.get(&attribute).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (Attribute, &str)> {
    self.0.iter().map(|(k, v)| (*k, v.as_str()))
  }

  /// Write every staged value onto `demographics`.
  pub fn apply(&self, demographics: &mut Demographics) -> Result<()> {
    for (attribute, value) in self.iter() {
      match attribute {
        Attribute::GivenName => demographics.given_name = value.to_owned(),
        Attribute::FamilyName => demographics.family_name = value.to_owned(),
        Attribute::DateOfBirth => {
          demographics.date_of_birth =
            NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| {
              Error::InvalidAttribute {
                attribute: attribute.to_string(),
                value:     value.to_owned(),
              }
            })?;
        }
        Attribute::Postcode => demographics.postcode = Some(value.to_owned()),
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn demographics() -> Demographics {
    Demographics {
      given_name:    "Jo".into(),
      family_name:   "Smith".into(),
      date_of_birth: NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
      postcode:      Some("AB1 2CD".into()),
    }
  }

  #[test]
  fn stage_keeps_only_differing_values() {
    let current = demographics();
    let mut incoming = demographics();
    incoming.family_name = "Smyth".into();

    let changes = PendingChanges::stage(&current, &incoming);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes.get(Attribute::FamilyName), Some("Smyth"));
  }

  #[test]
  fn missing_registry_postcode_does_not_clear_local_one() {
    let current = demographics();
    let mut incoming = demographics();
    incoming.postcode = None;

    assert!(PendingChanges::stage(&current, &incoming).is_empty());
  }

  #[test]
  fn blank_registry_names_do_not_clear_local_ones() {
    let mut current = demographics();
    let mut incoming = demographics();
    incoming.given_name = String::new();
    incoming.family_name = "  ".into();

    let changes = PendingChanges::stage(&current, &incoming);
    assert!(changes.is_empty());

    changes.apply(&mut current).unwrap();
    assert_eq!(current.given_name, "Jo");
    assert_eq!(current.family_name, "Smith");
  }

  #[test]
  fn apply_is_idempotent() {
    let mut current = demographics();
    let mut incoming = demographics();
    incoming.given_name = "Joanna".into();
    incoming.date_of_birth = NaiveDate::from_ymd_opt(2010, 5, 2).unwrap();

    let changes = PendingChanges::stage(&current, &incoming);
    changes.apply(&mut current).unwrap();
    assert_eq!(current, incoming);

    changes.apply(&mut current).unwrap();
    assert_eq!(current, incoming);
    assert!(PendingChanges::stage(&current, &incoming).is_empty());
  }
}
