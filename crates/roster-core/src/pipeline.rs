//! The job handler tying the engine, reconciler and batch finaliser to a
//! store and a dispatcher.
//!
//! [`Pipeline::handle`] is what a worker calls for each delivered [`Job`].
//! Every branch tolerates redelivery: a search step for a subject that has
//! moved on is dropped, a finished row is not re-recorded, and a batch is
//! only finalised by the worker that claims it.

use std::{sync::Arc, time::Duration};

use tracing::{Instrument as _, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  changeset::{
    BatchPolicy, ChangesetResolver, ChangesetStatus, Import, ImportStatus,
    NewChangeset,
  },
  dispatch::{Job, SearchTask, SubjectRef, TaskDispatcher},
  engine::{Advance, CascadingSearchEngine, Resolution, RetryPolicy},
  patient::Demographics,
  reconcile::{IdentityReconciler, ReconcileOutcome},
  registry::RegistryClient,
  search::SearchResultEntry,
  store::PatientStore,
};

/// Tuning for the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
  pub retry:        RetryPolicy,
  /// How many times a patient may be sent back through search after a
  /// stale identifier.
  pub max_restarts: u32,
  pub batch:        BatchPolicy,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      retry:        RetryPolicy::default(),
      max_restarts: 2,
      batch:        BatchPolicy::default(),
    }
  }
}

pub struct Pipeline<S, R, D> {
  store:      Arc<S>,
  dispatcher: Arc<D>,
  engine:     CascadingSearchEngine<R>,
  reconciler: IdentityReconciler<S, R>,
  resolver:   ChangesetResolver,
}

impl<S, R, D> Pipeline<S, R, D>
where
  S: PatientStore,
  R: RegistryClient,
  D: TaskDispatcher,
{
  pub fn new(
    store: Arc<S>,
    registry: Arc<R>,
    dispatcher: Arc<D>,
    config: PipelineConfig,
  ) -> Result<Self> {
    let engine = CascadingSearchEngine::new(registry.clone(), config.retry)?;
    let reconciler = IdentityReconciler::new(
      store.clone(),
      registry,
      config.retry,
      config.max_restarts,
    );
    Ok(Self {
      store,
      dispatcher,
      engine,
      reconciler,
      resolver: ChangesetResolver::new(config.batch),
    })
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  // ── Entry points ──────────────────────────────────────────────────────

  pub async fn start_patient_search(&self, patient_id: Uuid) -> Result<()> {
    start_patient_search(self.dispatcher.as_ref(), patient_id).await
  }

  pub async fn start_import(&self, rows: Vec<NewChangeset>) -> Result<Import> {
    start_import(self.store.as_ref(), self.dispatcher.as_ref(), rows).await
  }

  // ── Jobs ──────────────────────────────────────────────────────────────

  pub async fn handle(&self, job: Job) -> Result<()> {
    match job {
      Job::Search(task) => self.run_search(task).await,
      Job::Reconcile { patient_id, resolution, restarts } => {
        let outcome = self
          .reconciler
          .resolve(patient_id, resolution.clone(), restarts)
          .await?;
        self
          .follow_up(outcome, Job::Reconcile { patient_id, resolution, restarts })
          .await
      }
      Job::Refresh { patient_id } => {
        let outcome = self.reconciler.refresh(patient_id, 0).await?;
        self.follow_up(outcome, Job::Refresh { patient_id }).await
      }
      Job::FinalizeImport { import_id } => self.finalize_import(import_id).await,
    }
  }

  async fn run_search(&self, task: SearchTask) -> Result<()> {
    let Some(demographics) = self.subject_demographics(task.subject).await?
    else {
      debug!(subject = %task.subject, "subject gone or already searched, dropping step");
      return Ok(());
    };

    let step = task
      .step
      .clone()
      .unwrap_or_else(|| self.engine.table(task.table).first().clone());
    let span = info_span!("search_step", subject = %task.subject, %step);

    let advance = match self
      .engine
      .advance(&demographics, &task)
      .instrument(span.clone())
      .await
    {
      Ok(advance) => advance,
      Err(e) => {
        span.in_scope(|| error!(error = %e, "search step failed"));
        return Err(e);
      }
    };

    match advance {
      Advance::Continue(next) => self.schedule(Job::Search(next), None).await,
      Advance::RetryLater { task, delay } => {
        self.schedule(Job::Search(task), Some(delay)).await
      }
      Advance::Terminate { resolution, history } => {
        span.in_scope(|| info!(resolution = ?resolution, "search terminated"));
        match task.subject {
          SubjectRef::Patient(patient_id) => {
            self
              .store
              .record_search_results(patient_id, None, task.run_id, history)
              .await
              .map_err(Error::store)?;
            let outcome = self
              .reconciler
              .resolve(patient_id, resolution.clone(), task.restarts)
              .await?;
            self
              .follow_up(outcome, Job::Reconcile {
                patient_id,
                resolution,
                restarts: task.restarts,
              })
              .await
          }
          SubjectRef::Changeset(changeset_id) => {
            self.finish_changeset(changeset_id, resolution, history).await
          }
        }
      }
    }
  }

  async fn subject_demographics(
    &self,
    subject: SubjectRef,
  ) -> Result<Option<Demographics>> {
    Ok(match subject {
      SubjectRef::Patient(id) => self
        .store
        .get_patient(id)
        .await
        .map_err(Error::store)?
        .map(|p| p.demographics),
      SubjectRef::Changeset(id) => {
        match self.store.get_changeset(id).await.map_err(Error::store)? {
          Some(c) if c.status == ChangesetStatus::Pending => Some(c.demographics),
          Some(c) => {
            // A redelivered final step still has to get the batch claimed.
            self.claim_and_finalize(c.import_id).await?;
            None
          }
          None => None,
        }
      }
    })
  }

  async fn finish_changeset(
    &self,
    changeset_id: Uuid,
    resolution: Resolution,
    history: Vec<SearchResultEntry>,
  ) -> Result<()> {
    let changeset = self
      .store
      .get_changeset(changeset_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::ChangesetNotFound(changeset_id))?;

    self
      .store
      .complete_changeset_search(changeset_id, resolution, history)
      .await
      .map_err(Error::store)?;

    self.claim_and_finalize(changeset.import_id).await
  }

  async fn claim_and_finalize(&self, import_id: Uuid) -> Result<()> {
    claim_and_finalize(self.store.as_ref(), self.dispatcher.as_ref(), import_id)
      .await
  }

  async fn finalize_import(&self, import_id: Uuid) -> Result<()> {
    let import = self
      .store
      .get_import(import_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::ImportNotFound(import_id))?;

    match import.status {
      status if status.is_terminal() => {
        debug!(import = %import_id, %status, "import already finalised");
        return Ok(());
      }
      ImportStatus::Pending => return self.claim_and_finalize(import_id).await,
      _ => {}
    }

    let rows = self
      .store
      .list_changesets(import_id)
      .await
      .map_err(Error::store)?;
    let verdict = self.resolver.finalize(import_id, &rows)?;
    let rejection = verdict.rejection.clone();
    self.store.save_verdict(verdict).await.map_err(Error::store)?;

    if let Some(rejection) = rejection {
      warn!(import = %import_id, ?rejection, "import rejected");
      return Ok(());
    }

    let rows = self
      .store
      .list_changesets(import_id)
      .await
      .map_err(Error::store)?;
    for row in rows.iter().filter(|r| r.status == ChangesetStatus::Staged) {
      if row.has_discrepancy() {
        warn!(
          import = %import_id,
          row = row.row_number,
          uploaded = ?row.uploaded_registry_id,
          searched = ?row.staged_registry_id,
          "uploaded identifier differs from search result"
        );
      }

      let Some(patient) = self
        .store
        .commit_changeset(row.changeset_id)
        .await
        .map_err(Error::store)?
      else {
        continue;
      };

      // A row matching a committed patient is merged into it there.
      if let Some(id) = row.effective_registry_id() {
        self
          .schedule(
            Job::Reconcile {
              patient_id: patient.patient_id,
              resolution: Resolution::Resolved(id.clone()),
              restarts:   0,
            },
            None,
          )
          .await?;
      }
    }

    self
      .store
      .set_import_status(import_id, ImportStatus::Committed)
      .await
      .map_err(Error::store)?;
    info!(import = %import_id, "import committed");
    Ok(())
  }

  /// Schedule whatever a reconcile outcome asks for. `retry` is the job to
  /// run again if the registry throttled us.
  async fn follow_up(&self, outcome: ReconcileOutcome, retry: Job) -> Result<()> {
    match outcome {
      ReconcileOutcome::Restart(task) => {
        self.schedule(Job::Search(task), None).await
      }
      ReconcileOutcome::RetryLater(delay) => {
        self.schedule(retry, Some(delay)).await
      }
      ReconcileOutcome::Attached { .. }
      | ReconcileOutcome::Merged { .. }
      | ReconcileOutcome::Unresolved(_)
      | ReconcileOutcome::Abandoned => Ok(()),
    }
  }

  async fn schedule(&self, job: Job, delay: Option<Duration>) -> Result<()> {
    self.dispatcher.schedule(job, delay).await.map_err(Error::dispatch)
  }
}

// ─── Intake ──────────────────────────────────────────────────────────────────

/// Enqueue the first direct search step for a patient.
pub async fn start_patient_search<D: TaskDispatcher>(
  dispatcher: &D,
  patient_id: Uuid,
) -> Result<()> {
  dispatcher
    .schedule(Job::Search(SearchTask::for_patient(patient_id)), None)
    .await
    .map_err(Error::dispatch)
}

/// Enqueue a registry refresh for a patient that already has an identifier.
pub async fn request_refresh<D: TaskDispatcher>(
  dispatcher: &D,
  patient_id: Uuid,
) -> Result<()> {
  dispatcher
    .schedule(Job::Refresh { patient_id }, None)
    .await
    .map_err(Error::dispatch)
}

/// Stage an upload and enqueue a batch search for every row. An empty
/// upload goes straight to finalising.
pub async fn start_import<S, D>(
  store: &S,
  dispatcher: &D,
  rows: Vec<NewChangeset>,
) -> Result<Import>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  let (import, changesets) =
    store.create_import(rows).await.map_err(Error::store)?;
  info!(import = %import.import_id, rows = changesets.len(), "import staged");

  for changeset in &changesets {
    dispatcher
      .schedule(
        Job::Search(SearchTask::for_changeset(changeset.changeset_id)),
        None,
      )
      .await
      .map_err(Error::dispatch)?;
  }
  if changesets.is_empty() {
    claim_and_finalize(store, dispatcher, import.import_id).await?;
  }
  Ok(import)
}

async fn claim_and_finalize<S, D>(
  store: &S,
  dispatcher: &D,
  import_id: Uuid,
) -> Result<()>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  if store.claim_import(import_id).await.map_err(Error::store)? {
    debug!(import = %import_id, "claimed import for finalising");
    dispatcher
      .schedule(Job::FinalizeImport { import_id }, None)
      .await
      .map_err(Error::dispatch)?;
  }
  Ok(())
}
