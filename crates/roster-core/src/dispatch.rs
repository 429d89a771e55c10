//! Units of asynchronous work and the `TaskDispatcher` trait that enqueues
//! them.
//!
//! Every job carries all the state needed to resume: there is no in-process
//! state shared between the steps of one subject. Delivery is assumed to be
//! at-least-once, so every job handler must tolerate re-entry.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::{
  engine::Resolution,
  search::SearchResultEntry,
  step_table::{StepName, TableKind},
};

/// What a search is resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubjectRef {
  Patient(Uuid),
  /// A staged import row.
  Changeset(Uuid),
}

impl std::fmt::Display for SubjectRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Patient(id) => write!(f, "patient#{id}"),
      Self::Changeset(id) => write!(f, "changeset#{id}"),
    }
  }
}

/// Continuation state for one step of the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
  pub subject:  SubjectRef,
  pub table:    TableKind,
  /// `None` means the table's first step.
  pub step:     Option<StepName>,
  pub history:  Vec<SearchResultEntry>,
  /// How many times the cascade has been restarted after a stale
  /// identifier.
  #[serde(default)]
  pub restarts: u32,
  /// Shared by every step of one pass through the cascade, redeliveries
  /// included. A restart starts a new run.
  #[serde(default = "Uuid::new_v4")]
  pub run_id:   Uuid,
}

impl SearchTask {
  pub fn new(subject: SubjectRef, table: TableKind) -> Self {
    Self {
      subject,
      table,
      step: None,
      history: Vec::new(),
      restarts: 0,
      run_id: Uuid::new_v4(),
    }
  }

  /// Start a patient on the direct table.
  pub fn for_patient(patient_id: Uuid) -> Self {
    Self::new(SubjectRef::Patient(patient_id), TableKind::Direct)
  }

  /// Start an import row on the batch table.
  pub fn for_changeset(changeset_id: Uuid) -> Self {
    Self::new(SubjectRef::Changeset(changeset_id), TableKind::Batch)
  }

  pub fn with_restarts(mut self, restarts: u32) -> Self {
    self.restarts = restarts;
    self
  }
}

/// The queue a job runs on. Registry-bound jobs share one queue so that a
/// fixed concurrency cap can be applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Queue {
  Registry,
  Imports,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
  /// Run one step of the cascade.
  Search(SearchTask),
  /// Turn a terminated direct search into an identity decision.
  Reconcile {
    patient_id: Uuid,
    resolution: Resolution,
    #[serde(default)]
    restarts:   u32,
  },
  /// Re-fetch demographics for a patient that already has an identifier.
  Refresh { patient_id: Uuid },
  /// Finalise and commit an import whose rows have all been searched.
  FinalizeImport { import_id: Uuid },
}

impl Job {
  pub fn queue(&self) -> Queue {
    match self {
      Self::Search(_) | Self::Reconcile { .. } | Self::Refresh { .. } => {
        Queue::Registry
      }
      Self::FinalizeImport { .. } => Queue::Imports,
    }
  }
}

/// Fire-and-forget enqueueing of jobs.
pub trait TaskDispatcher: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Enqueue `job`, to run no sooner than `delay` from now.
  fn schedule(
    &self,
    job: Job,
    delay: Option<Duration>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
