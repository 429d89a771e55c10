//! Registry queries, outcome classification and accumulated search history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{
  patient::{Demographics, RegistryId},
  step_table::StepName,
};

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// The classification of one executed step.
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
pub enum Outcome {
  NoMatches,
  OneMatch,
  TooManyMatches,
  /// The subject lacks the data this step's widening needs.
  SkipStep,
  /// A transport or server failure talking to the registry.
  Error,
  /// The subject has no postcode; no step can run.
  NoPostcode,
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// Parameters for [`crate::registry::RegistryClient::search`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
  pub family_name:   String,
  pub given_name:    String,
  pub date_of_birth: NaiveDate,
  pub postcode:      String,
  /// Also match against historic demographics.
  pub history:       bool,
  pub fuzzy:         bool,
}

impl SearchQuery {
  /// The exact, history-inclusive query for `demographics`. Returns `None`
  /// when there is no postcode to search on.
  pub fn exact(demographics: &Demographics) -> Option<Self> {
    let postcode = demographics.postcode()?;
    Some(Self {
      family_name:   demographics.family_name.trim().to_owned(),
      given_name:    demographics.given_name.trim().to_owned(),
      date_of_birth: demographics.date_of_birth,
      postcode:      postcode.to_owned(),
      history:       true,
      fuzzy:         false,
    })
  }
}

// ─── History ─────────────────────────────────────────────────────────────────

/// One row of evidence: the outcome of a single executed step.
///
/// Entries are append-only and ordered by creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultEntry {
  pub step:        StepName,
  pub outcome:     Outcome,
  pub registry_id: Option<RegistryId>,
  pub created_at:  DateTime<Utc>,
}

impl SearchResultEntry {
  pub fn new(
    step: StepName,
    outcome: Outcome,
    registry_id: Option<RegistryId>,
  ) -> Self {
    Self { step, outcome, registry_id, created_at: Utc::now() }
  }

  /// Equal in everything but the timestamp.
  pub fn is_equivalent(&self, other: &Self) -> bool {
    self.step == other.step
      && self.outcome == other.outcome
      && self.registry_id == other.registry_id
  }
}

/// Every distinct non-null identifier in `history`, in first-seen order.
pub fn distinct_registry_ids(history: &[SearchResultEntry]) -> Vec<RegistryId> {
  let mut ids: Vec<RegistryId> = Vec::new();
  for id in history.iter().filter_map(|e| e.registry_id.as_ref()) {
    if !ids.contains(id) {
      ids.push(id.clone());
    }
  }
  ids
}

/// The identifier in `history` if exactly one distinct identifier was seen.
pub fn unique_registry_id(history: &[SearchResultEntry]) -> Option<RegistryId> {
  let mut ids = distinct_registry_ids(history);
  if ids.len() == 1 { ids.pop() } else { None }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(id: Option<&str>) -> SearchResultEntry {
    SearchResultEntry::new(
      StepName::new("no_fuzzy_with_history"),
      if id.is_some() { Outcome::OneMatch } else { Outcome::NoMatches },
      id.map(RegistryId::new),
    )
  }

  #[test]
  fn distinct_ids_ignore_nulls_and_repeats() {
    let history = vec![entry(Some("1")), entry(None), entry(Some("1"))];
    assert_eq!(distinct_registry_ids(&history), vec![RegistryId::new("1")]);
    assert_eq!(unique_registry_id(&history), Some(RegistryId::new("1")));
  }

  #[test]
  fn two_ids_are_not_unique() {
    let history = vec![entry(Some("1")), entry(Some("2"))];
    assert_eq!(distinct_registry_ids(&history).len(), 2);
    assert_eq!(unique_registry_id(&history), None);
  }

  #[test]
  fn query_requires_postcode() {
    let demographics = Demographics {
      given_name:    "Jo".into(),
      family_name:   "Smith".into(),
      date_of_birth: NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
      postcode:      Some("  ".into()),
    };
    assert!(SearchQuery::exact(&demographics).is_none());
  }
}
