//! Error types for `roster-core`.

use thiserror::Error;
use uuid::Uuid;

use crate::{registry::RegistryError, search::Outcome, step_table::StepName};

#[derive(Debug, Error)]
pub enum Error {
  // ── Configuration ───────────────────────────────────────────────────────
  #[error("step {from} references unknown step {to}")]
  UnknownStep { from: StepName, to: StepName },

  #[error("step table has no step named {0}")]
  MissingStep(StepName),

  #[error("step {0} transitions to itself")]
  SelfTransition(StepName),

  #[error("step table contains a cycle through {0}")]
  CyclicTable(StepName),

  #[error("step {step} has no transition for outcome {outcome}")]
  MissingOutcome { step: StepName, outcome: Outcome },

  // ── Domain ──────────────────────────────────────────────────────────────
  #[error("patient not found: {0}")]
  PatientNotFound(Uuid),

  #[error("changeset not found: {0}")]
  ChangesetNotFound(Uuid),

  #[error("import not found: {0}")]
  ImportNotFound(Uuid),

  #[error("cannot merge patient {0} into itself")]
  SelfMerge(Uuid),

  #[error("import {0} still has rows awaiting search")]
  BatchIncomplete(Uuid),

  #[error("invalid value for {attribute}: {value:?}")]
  InvalidAttribute { attribute: String, value: String },

  // ── Collaborators ───────────────────────────────────────────────────────
  #[error("registry error: {0}")]
  Registry(#[from] RegistryError),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("dispatch error: {0}")]
  Dispatch(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Box a backend error from a [`crate::store::PatientStore`] implementation.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }

  /// Box an error from a [`crate::dispatch::TaskDispatcher`] implementation.
  pub fn dispatch<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Dispatch(Box::new(e))
  }

  /// Whether this error indicates a broken step table rather than a runtime
  /// condition. Such errors are never retried.
  pub fn is_configuration(&self) -> bool {
    matches!(
      self,
      Self::UnknownStep { .. }
        | Self::MissingStep(_)
        | Self::SelfTransition(_)
        | Self::CyclicTable(_)
        | Self::MissingOutcome { .. }
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
