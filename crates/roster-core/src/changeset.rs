//! Import batches and the finishing pass that runs once every staged row has
//! terminated its search.
//!
//! Rows are searched independently against the batch step table. Nothing is
//! committed until [`ChangesetResolver::finalize`] has checked that no two
//! rows in the batch claim the same registry identifier.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  engine::Resolution,
  patient::{Demographics, RegistryId},
  search::SearchResultEntry,
};

// ─── Imports ─────────────────────────────────────────────────────────────────

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImportStatus {
  /// Rows are still being searched.
  Pending,
  /// Claimed for finalising; exactly one worker gets here.
  Finalizing,
  Committed,
  Rejected,
}

impl ImportStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Committed | Self::Rejected)
  }
}

/// Why a whole import was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
  LowMatchRate { rate: f64, minimum: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
  pub import_id:    Uuid,
  pub status:       ImportStatus,
  pub row_count:    usize,
  /// Share of rows that staged an identifier, set when finalised.
  pub match_rate:   Option<f64>,
  pub rejection:    Option<Rejection>,
  pub created_at:   DateTime<Utc>,
  pub processed_at: Option<DateTime<Utc>>,
}

// ─── Changesets ──────────────────────────────────────────────────────────────

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangesetStatus {
  Pending,
  /// Search terminated; awaiting the rest of the batch.
  Searched,
  /// Accepted for commit, with or without an identifier.
  Staged,
  Invalid,
  Committed,
}

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InvalidReason {
  /// Another row in the same import resolved to the same identifier.
  DuplicateInBatch,
}

/// One uploaded row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChangeset {
  pub row_number:           u32,
  pub demographics:         Demographics,
  /// The identifier the uploader supplied, if any.
  #[serde(default)]
  pub uploaded_registry_id: Option<RegistryId>,
}

/// A staged import row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Changeset {
  pub changeset_id:         Uuid,
  pub import_id:            Uuid,
  pub row_number:           u32,
  pub demographics:         Demographics,
  pub uploaded_registry_id: Option<RegistryId>,
  pub status:               ChangesetStatus,
  pub resolution:           Option<Resolution>,
  pub search_results:       Vec<SearchResultEntry>,
  pub staged_registry_id:   Option<RegistryId>,
  pub invalid_reason:       Option<InvalidReason>,
  /// The patient created when this row was committed.
  pub patient_id:           Option<Uuid>,
}

impl Changeset {
  /// The identifier this row would be committed with: the searched one if
  /// the search found one, otherwise the uploaded one.
  pub fn effective_registry_id(&self) -> Option<&RegistryId> {
    self
      .staged_registry_id
      .as_ref()
      .or(self.uploaded_registry_id.as_ref())
  }

  /// Whether the uploaded and searched identifiers disagree.
  pub fn has_discrepancy(&self) -> bool {
    matches!(
      (&self.uploaded_registry_id, &self.staged_registry_id),
      (Some(uploaded), Some(staged)) if uploaded != staged
    )
  }
}

// ─── Finalising ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPolicy {
  /// Reject the whole import when fewer rows than this (0.0 – 1.0) staged
  /// an identifier.
  pub min_match_rate: Option<f64>,
}

/// First-seen row for each identifier within one batch.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
  seen:       HashMap<RegistryId, Uuid>,
  duplicates: BTreeSet<RegistryId>,
}

impl BatchAccumulator {
  pub fn new() -> Self { Self::default() }

  /// Record that `changeset_id` claims `id`. Returns the row that claimed
  /// it first, if this is a repeat.
  pub fn observe(&mut self, id: &RegistryId, changeset_id: Uuid) -> Option<Uuid> {
    match self.seen.get(id) {
      Some(&first) if first != changeset_id => {
        self.duplicates.insert(id.clone());
        Some(first)
      }
      Some(_) => None,
      None => {
        self.seen.insert(id.clone(), changeset_id);
        None
      }
    }
  }

  pub fn is_duplicate(&self, id: &RegistryId) -> bool {
    self.duplicates.contains(id)
  }
}

/// The finishing decision for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDecision {
  pub changeset_id:   Uuid,
  pub status:         ChangesetStatus,
  pub invalid_reason: Option<InvalidReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVerdict {
  pub import_id:  Uuid,
  pub decisions:  Vec<RowDecision>,
  pub match_rate: f64,
  pub rejection:  Option<Rejection>,
}

impl BatchVerdict {
  pub fn is_rejected(&self) -> bool { self.rejection.is_some() }

  pub fn invalid(&self) -> impl Iterator<Item = &RowDecision> {
    self
      .decisions
      .iter()
      .filter(|d| d.status == ChangesetStatus::Invalid)
  }
}

#[derive(Debug, Clone, Default)]
pub struct ChangesetResolver {
  policy: BatchPolicy,
}

impl ChangesetResolver {
  pub fn new(policy: BatchPolicy) -> Self { Self { policy } }

  /// Decide the fate of every searched row of `import_id`.
  ///
  /// Every row sharing an identifier with another row is marked invalid;
  /// duplicates within one batch are never merged. Rows that already moved
  /// past `searched` are left alone, so re-running the pass is harmless.
  pub fn finalize(
    &self,
    import_id: Uuid,
    rows: &[Changeset],
  ) -> Result<BatchVerdict> {
    if rows.iter().any(|r| r.status == ChangesetStatus::Pending) {
      return Err(Error::BatchIncomplete(import_id));
    }

    let mut accumulator = BatchAccumulator::new();
    for row in rows {
      if row.status == ChangesetStatus::Invalid {
        continue;
      }
      if let Some(id) = row.effective_registry_id()
        && let Some(first) = accumulator.observe(id, row.changeset_id)
      {
        warn!(
          %import_id,
          registry_id = %id,
          first = %first,
          duplicate = %row.changeset_id,
          "identifier claimed by more than one row"
        );
      }
    }

    let decisions: Vec<RowDecision> = rows
      .iter()
      .filter(|r| r.status == ChangesetStatus::Searched)
      .map(|row| {
        let duplicate = row
          .effective_registry_id()
          .is_some_and(|id| accumulator.is_duplicate(id));
        if duplicate {
          RowDecision {
            changeset_id:   row.changeset_id,
            status:         ChangesetStatus::Invalid,
            invalid_reason: Some(InvalidReason::DuplicateInBatch),
          }
        } else {
          RowDecision {
            changeset_id:   row.changeset_id,
            status:         ChangesetStatus::Staged,
            invalid_reason: None,
          }
        }
      })
      .collect();

    let matched =
      rows.iter().filter(|r| r.staged_registry_id.is_some()).count();
    let match_rate = if rows.is_empty() {
      1.0
    } else {
      matched as f64 / rows.len() as f64
    };

    let rejection = self
      .policy
      .min_match_rate
      .filter(|&minimum| match_rate < minimum)
      .map(|minimum| Rejection::LowMatchRate { rate: match_rate, minimum });

    info!(
      %import_id,
      rows = rows.len(),
      matched,
      rejected = rejection.is_some(),
      "import finalised"
    );

    Ok(BatchVerdict { import_id, decisions, match_rate, rejection })
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn row(import_id: Uuid, staged: Option<&str>) -> Changeset {
    Changeset {
      changeset_id: Uuid::new_v4(),
      import_id,
      row_number: 1,
      demographics: Demographics {
        given_name:    "Jo".into(),
        family_name:   "Smith".into(),
        date_of_birth: NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
        postcode:      Some("AB1 2CD".into()),
      },
      uploaded_registry_id: None,
      status: ChangesetStatus::Searched,
      resolution: Some(match staged {
        Some(id) => Resolution::Resolved(RegistryId::new(id)),
        None => Resolution::GaveUp,
      }),
      search_results: Vec::new(),
      staged_registry_id: staged.map(RegistryId::new),
      invalid_reason: None,
      patient_id: None,
    }
  }

  #[test]
  fn refuses_while_rows_are_pending() {
    let import_id = Uuid::new_v4();
    let mut pending = row(import_id, None);
    pending.status = ChangesetStatus::Pending;

    let err = ChangesetResolver::default()
      .finalize(import_id, &[row(import_id, Some("1")), pending])
      .unwrap_err();
    assert!(matches!(err, Error::BatchIncomplete(id) if id == import_id));
  }

  #[test]
  fn duplicate_identifiers_invalidate_every_claiming_row() {
    let import_id = Uuid::new_v4();
    let rows = vec![
      row(import_id, Some("1")),
      row(import_id, Some("1")),
      row(import_id, Some("2")),
      row(import_id, None),
    ];

    let verdict =
      ChangesetResolver::default().finalize(import_id, &rows).unwrap();

    let invalid: Vec<Uuid> = verdict.invalid().map(|d| d.changeset_id).collect();
    assert_eq!(invalid, vec![rows[0].changeset_id, rows[1].changeset_id]);
    assert!(verdict.invalid().all(|d| {
      d.invalid_reason == Some(InvalidReason::DuplicateInBatch)
    }));
    assert_eq!(verdict.decisions.len(), 4);
    assert!(!verdict.is_rejected());
  }

  #[test]
  fn uploaded_identifier_counts_towards_uniqueness() {
    let import_id = Uuid::new_v4();
    let mut uploaded = row(import_id, None);
    uploaded.uploaded_registry_id = Some(RegistryId::new("1"));
    let rows = vec![row(import_id, Some("1")), uploaded];

    let verdict =
      ChangesetResolver::default().finalize(import_id, &rows).unwrap();
    assert_eq!(verdict.invalid().count(), 2);
  }

  #[test]
  fn low_match_rate_rejects_the_import() {
    let import_id = Uuid::new_v4();
    let rows = vec![
      row(import_id, Some("1")),
      row(import_id, None),
      row(import_id, None),
    ];

    let resolver =
      ChangesetResolver::new(BatchPolicy { min_match_rate: Some(0.7) });
    let verdict = resolver.finalize(import_id, &rows).unwrap();
    assert!(verdict.is_rejected());
    assert!(matches!(
      verdict.rejection,
      Some(Rejection::LowMatchRate { minimum, .. }) if minimum == 0.7
    ));
  }

  #[test]
  fn already_decided_rows_are_left_alone() {
    let import_id = Uuid::new_v4();
    let mut committed = row(import_id, Some("1"));
    committed.status = ChangesetStatus::Committed;
    let rows = vec![committed, row(import_id, Some("2"))];

    let verdict =
      ChangesetResolver::default().finalize(import_id, &rows).unwrap();
    assert_eq!(verdict.decisions.len(), 1);
    assert_eq!(verdict.decisions[0].changeset_id, rows[1].changeset_id);
    assert_eq!(verdict.decisions[0].status, ChangesetStatus::Staged);
  }
}
