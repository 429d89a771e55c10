//! Turning a terminated search into an identity decision.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  dispatch::SearchTask,
  engine::{Resolution, RetryPolicy},
  merge::MergeReport,
  patient::{Patient, PendingChanges, RegistryId},
  registry::{Lookup, RegistryClient, RegistryError},
  store::PatientStore,
};

/// What the reconciler did with a patient.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
  /// The identifier was attached and registry demographics applied.
  Attached {
    registry_id: RegistryId,
    changes:     usize,
  },
  /// Another patient already held the identifier; the subject was merged
  /// into it.
  Merged { survivor: Uuid, report: MergeReport },
  /// No identifier; left for manual resolution.
  Unresolved(Resolution),
  /// The identifier was stale; search again from the first step.
  Restart(SearchTask),
  /// The registry throttled the lookup; try the same decision later.
  RetryLater(Duration),
  /// Restarted too many times.
  Abandoned,
}

pub struct IdentityReconciler<S, R> {
  store:        Arc<S>,
  registry:     Arc<R>,
  retry:        RetryPolicy,
  max_restarts: u32,
}

impl<S, R> IdentityReconciler<S, R>
where
  S: PatientStore,
  R: RegistryClient,
{
  pub fn new(
    store: Arc<S>,
    registry: Arc<R>,
    retry: RetryPolicy,
    max_restarts: u32,
  ) -> Self {
    Self { store, registry, retry, max_restarts }
  }

  /// Act on a terminated direct search for `patient_id`.
  pub async fn resolve(
    &self,
    patient_id: Uuid,
    resolution: Resolution,
    restarts: u32,
  ) -> Result<ReconcileOutcome> {
    let patient = self.patient(patient_id).await?;

    match resolution {
      Resolution::Resolved(id) => self.adopt(patient, id, restarts).await,
      other => {
        if patient.registry_id.is_some() {
          self
            .store
            .clear_registry_id(patient_id)
            .await
            .map_err(Error::store)?;
        }
        info!(patient = %patient_id, resolution = ?other, "left unresolved");
        Ok(ReconcileOutcome::Unresolved(other))
      }
    }
  }

  /// Re-fetch registry demographics for a patient that already has an
  /// identifier. A patient without one is sent back through search.
  pub async fn refresh(
    &self,
    patient_id: Uuid,
    restarts: u32,
  ) -> Result<ReconcileOutcome> {
    let patient = self.patient(patient_id).await?;
    match patient.registry_id.clone() {
      Some(id) => self.adopt(patient, id, restarts).await,
      None => Ok(self.restart(patient_id, restarts)),
    }
  }

  async fn adopt(
    &self,
    patient: Patient,
    id: RegistryId,
    restarts: u32,
  ) -> Result<ReconcileOutcome> {
    let patient_id = patient.patient_id;

    let record = match self.registry.find_by_identifier(&id).await {
      Ok(Lookup::Found(record)) => record,
      Ok(Lookup::NotFound) => {
        warn!(patient = %patient_id, registry_id = %id, "identifier not found");
        if patient.registry_id.is_some() {
          self
            .store
            .clear_registry_id(patient_id)
            .await
            .map_err(Error::store)?;
        }
        return Ok(self.restart(patient_id, restarts));
      }
      Ok(Lookup::Invalidated) => {
        warn!(patient = %patient_id, registry_id = %id, "identifier invalidated");
        self.store.invalidate(patient_id).await.map_err(Error::store)?;
        return Ok(self.restart(patient_id, restarts));
      }
      Err(RegistryError::RateLimited { retry_after }) => {
        return Ok(ReconcileOutcome::RetryLater(
          self.retry.delay_for(retry_after),
        ));
      }
      Err(e) => return Err(e.into()),
    };

    // The registry may answer with a superseding identifier.
    let canonical = record.registry_id;
    if canonical != id {
      info!(
        patient = %patient_id,
        from = %id,
        to = %canonical,
        "registry superseded identifier"
      );
    }

    let holder = self
      .store
      .find_by_registry_id(&canonical)
      .await
      .map_err(Error::store)?;

    match holder {
      Some(survivor) if survivor.patient_id != patient_id => {
        let report = self
          .store
          .merge_patients(survivor.patient_id, patient_id)
          .await
          .map_err(Error::store)?;
        let changes =
          PendingChanges::stage(&survivor.demographics, &record.demographics);
        if !changes.is_empty() {
          self
            .store
            .apply_changes(survivor.patient_id, changes)
            .await
            .map_err(Error::store)?;
        }
        info!(
          survivor = %survivor.patient_id,
          casualty = %patient_id,
          registry_id = %canonical,
          "merged duplicate patient"
        );
        Ok(ReconcileOutcome::Merged { survivor: survivor.patient_id, report })
      }
      _ => {
        let changes =
          PendingChanges::stage(&patient.demographics, &record.demographics);
        let count = changes.len();
        self
          .store
          .attach_registry_id(patient_id, canonical.clone(), changes)
          .await
          .map_err(Error::store)?;
        info!(
          patient = %patient_id,
          registry_id = %canonical,
          changes = count,
          "identifier attached"
        );
        Ok(ReconcileOutcome::Attached { registry_id: canonical, changes: count })
      }
    }
  }

  fn restart(&self, patient_id: Uuid, restarts: u32) -> ReconcileOutcome {
    if restarts >= self.max_restarts {
      warn!(patient = %patient_id, restarts, "giving up after repeated restarts");
      return ReconcileOutcome::Abandoned;
    }
    ReconcileOutcome::Restart(
      SearchTask::for_patient(patient_id).with_restarts(restarts + 1),
    )
  }

  async fn patient(&self, patient_id: Uuid) -> Result<Patient> {
    self
      .store
      .get_patient(patient_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::PatientNotFound(patient_id))
  }
}
