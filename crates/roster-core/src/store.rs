//! The `PatientStore` trait.
//!
//! Implemented by storage backends (e.g. `roster-store-sqlite`). The engine,
//! reconciler and pipeline depend on this abstraction, not on any concrete
//! backend.

use std::future::Future;

use uuid::Uuid;

use crate::{
  changeset::{BatchVerdict, Changeset, Import, ImportStatus, NewChangeset},
  engine::Resolution,
  event::DomainEvent,
  merge::{MergeReport, PatientAggregate},
  patient::{NewPatient, Patient, PendingChanges, RegistryId},
  search::SearchResultEntry,
};

/// Error type of a [`PatientStore`] backend.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  /// The write was refused because it would break a uniqueness or
  /// ownership constraint, not because the backend failed.
  fn is_conflict(&self) -> bool;
}

/// Abstraction over a roster store backend.
///
/// Every method that writes more than one row does so in a single
/// transaction. Methods that mutate an existing patient return an error if
/// it does not exist.
pub trait PatientStore: Send + Sync {
  type Error: StoreError;

  // ── Patients ──────────────────────────────────────────────────────────

  fn add_patient(
    &self,
    patient: NewPatient,
  ) -> impl Future<Output = Result<Patient, Self::Error>> + Send + '_;

  fn get_patient(
    &self,
    patient_id: Uuid,
  ) -> impl Future<Output = Result<Option<Patient>, Self::Error>> + Send + '_;

  fn find_by_registry_id<'a>(
    &'a self,
    registry_id: &'a RegistryId,
  ) -> impl Future<Output = Result<Option<Patient>, Self::Error>> + Send + 'a;

  /// Set the patient's identifier and apply `changes`, clearing any
  /// invalidation. Emits `patient.identifier_resolved` when the identifier
  /// actually changed. Fails if another patient holds the identifier.
  fn attach_registry_id(
    &self,
    patient_id: Uuid,
    registry_id: RegistryId,
    changes: PendingChanges,
  ) -> impl Future<Output = Result<Patient, Self::Error>> + Send + '_;

  /// Apply staged demographic changes. A no-op for an empty set.
  fn apply_changes(
    &self,
    patient_id: Uuid,
    changes: PendingChanges,
  ) -> impl Future<Output = Result<Patient, Self::Error>> + Send + '_;

  fn clear_registry_id(
    &self,
    patient_id: Uuid,
  ) -> impl Future<Output = Result<Patient, Self::Error>> + Send + '_;

  /// Flag the patient's identifier as withdrawn by the registry.
  fn invalidate(
    &self,
    patient_id: Uuid,
  ) -> impl Future<Output = Result<Patient, Self::Error>> + Send + '_;

  /// The patient with the ids of every row it owns.
  fn aggregate(
    &self,
    patient_id: Uuid,
  ) -> impl Future<Output = Result<Option<PatientAggregate>, Self::Error>> + Send + '_;

  /// Fold `casualty` into `survivor` and delete `casualty`, all or nothing.
  /// Emits `patient.merged`.
  fn merge_patients(
    &self,
    survivor: Uuid,
    casualty: Uuid,
  ) -> impl Future<Output = Result<MergeReport, Self::Error>> + Send + '_;

  // ── Search history ────────────────────────────────────────────────────

  /// Append a terminated history to the patient's audit trail. Entries are
  /// keyed by `run_id` and their position in the history, so recording the
  /// same run again skips what is already there, even when a redelivered
  /// final step rebuilt its entry. Returns how many were inserted.
  fn record_search_results(
    &self,
    patient_id: Uuid,
    import_id: Option<Uuid>,
    run_id: Uuid,
    entries: Vec<SearchResultEntry>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// The patient's audit trail in creation order.
  fn search_results(
    &self,
    patient_id: Uuid,
  ) -> impl Future<Output = Result<Vec<SearchResultEntry>, Self::Error>> + Send + '_;

  // ── Imports ───────────────────────────────────────────────────────────

  fn create_import(
    &self,
    rows: Vec<NewChangeset>,
  ) -> impl Future<Output = Result<(Import, Vec<Changeset>), Self::Error>> + Send + '_;

  fn get_import(
    &self,
    import_id: Uuid,
  ) -> impl Future<Output = Result<Option<Import>, Self::Error>> + Send + '_;

  fn get_changeset(
    &self,
    changeset_id: Uuid,
  ) -> impl Future<Output = Result<Option<Changeset>, Self::Error>> + Send + '_;

  /// Every row of the import, ordered by row number.
  fn list_changesets(
    &self,
    import_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Changeset>, Self::Error>> + Send + '_;

  /// Record a row's terminated search. Returns `false` if the row had
  /// already left `pending`.
  fn complete_changeset_search(
    &self,
    changeset_id: Uuid,
    resolution: Resolution,
    history: Vec<SearchResultEntry>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Move the import from `pending` to `finalizing` if none of its rows are
  /// still pending. Returns whether this caller won the claim.
  fn claim_import(
    &self,
    import_id: Uuid,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Persist row decisions and the match rate; a rejected verdict moves the
  /// import to `rejected`.
  fn save_verdict(
    &self,
    verdict: BatchVerdict,
  ) -> impl Future<Output = Result<Import, Self::Error>> + Send + '_;

  /// Commit a staged row: link a patient to the row's import, record its
  /// search history and mark the row committed. A row with no staged or
  /// uploaded identifier reuses the one existing patient with the same
  /// names, date of birth and postcode; otherwise a new patient is created.
  /// Returns `None` if the row was already committed.
  fn commit_changeset(
    &self,
    changeset_id: Uuid,
  ) -> impl Future<Output = Result<Option<Patient>, Self::Error>> + Send + '_;

  fn set_import_status(
    &self,
    import_id: Uuid,
    status: ImportStatus,
  ) -> impl Future<Output = Result<Import, Self::Error>> + Send + '_;

  // ── Events ────────────────────────────────────────────────────────────

  /// Remove and return up to `limit` outbox events, oldest first.
  fn drain_events(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<DomainEvent>, Self::Error>> + Send + '_;
}
