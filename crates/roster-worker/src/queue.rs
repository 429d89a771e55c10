//! In-process job queue implementing [`TaskDispatcher`], and the worker
//! loops that drain it.
//!
//! Each [`Queue`] gets its own unbounded channel and its own pool of
//! workers, so a slow registry never holds up import finalisation. Delayed
//! jobs sleep on a detached task before being enqueued. Jobs pending in
//! memory are lost if the process exits; every handler is re-entrant, so
//! resubmitting affected work is safe.

use std::{sync::Arc, time::Duration};

use roster_core::{
  dispatch::{Job, Queue, TaskDispatcher},
  pipeline::Pipeline,
  registry::RegistryClient,
  store::PatientStore,
};
use tokio::{
  sync::{
    Mutex,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
  },
  task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{Error, Result};

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// The sending half of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
  registry: UnboundedSender<Job>,
  imports:  UnboundedSender<Job>,
}

/// The receiving halves, handed to [`JobQueue::spawn_workers`].
pub struct JobQueue {
  registry: UnboundedReceiver<Job>,
  imports:  UnboundedReceiver<Job>,
}

impl JobQueue {
  pub fn channel() -> (TokioDispatcher, Self) {
    let (registry_tx, registry_rx) = mpsc::unbounded_channel();
    let (imports_tx, imports_rx) = mpsc::unbounded_channel();
    (
      TokioDispatcher { registry: registry_tx, imports: imports_tx },
      Self { registry: registry_rx, imports: imports_rx },
    )
  }

  /// Start `per_queue` workers on each queue. Workers exit once every
  /// dispatcher clone has been dropped and the queue is empty.
  pub fn spawn_workers<S, R, D>(
    self,
    pipeline: Arc<Pipeline<S, R, D>>,
    per_queue: usize,
  ) -> Vec<JoinHandle<()>>
  where
    S: PatientStore + 'static,
    R: RegistryClient + 'static,
    D: TaskDispatcher + 'static,
  {
    let mut handles = Vec::new();
    for (queue, rx) in [(Queue::Registry, self.registry), (Queue::Imports, self.imports)]
    {
      let rx = Arc::new(Mutex::new(rx));
      for worker in 0..per_queue.max(1) {
        handles.push(tokio::spawn(run_worker(
          queue,
          worker,
          rx.clone(),
          pipeline.clone(),
        )));
      }
    }
    handles
  }
}

impl TokioDispatcher {
  fn sender(&self, queue: Queue) -> &UnboundedSender<Job> {
    match queue {
      Queue::Registry => &self.registry,
      Queue::Imports => &self.imports,
    }
  }
}

impl TaskDispatcher for TokioDispatcher {
  type Error = Error;

  async fn schedule(&self, job: Job, delay: Option<Duration>) -> Result<()> {
    let queue = job.queue();
    let tx = self.sender(queue).clone();

    match delay {
      None => tx.send(job).map_err(|_| Error::QueueClosed(queue)),
      Some(delay) => {
        if tx.is_closed() {
          return Err(Error::QueueClosed(queue));
        }
        debug!(%queue, ?delay, "deferring job");
        tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          if tx.send(job).is_err() {
            warn!(%queue, "queue closed before deferred job was due");
          }
        });
        Ok(())
      }
    }
  }
}

// ─── Workers ──────────────────────────────────────────────────────────────────

async fn run_worker<S, R, D>(
  queue: Queue,
  worker: usize,
  rx: Arc<Mutex<UnboundedReceiver<Job>>>,
  pipeline: Arc<Pipeline<S, R, D>>,
) where
  S: PatientStore,
  R: RegistryClient,
  D: TaskDispatcher,
{
  loop {
    let Some(job) = rx.lock().await.recv().await else {
      debug!(%queue, worker, "queue drained, worker exiting");
      return;
    };
    if let Err(e) = pipeline.handle(job).await {
      error!(%queue, worker, error = %e, "job failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use roster_core::dispatch::SearchTask;
  use uuid::Uuid;

  use super::*;

  #[tokio::test]
  async fn routes_jobs_by_queue() {
    let (dispatcher, mut queue) = JobQueue::channel();
    let patient_id = Uuid::new_v4();
    let import_id = Uuid::new_v4();

    dispatcher
      .schedule(Job::Search(SearchTask::for_patient(patient_id)), None)
      .await
      .unwrap();
    dispatcher.schedule(Job::FinalizeImport { import_id }, None).await.unwrap();

    assert!(matches!(queue.registry.recv().await, Some(Job::Search(_))));
    assert_eq!(
      queue.imports.recv().await,
      Some(Job::FinalizeImport { import_id })
    );
  }

  #[tokio::test]
  async fn delayed_jobs_arrive_later() {
    let (dispatcher, mut queue) = JobQueue::channel();
    let patient_id = Uuid::new_v4();

    let started = tokio::time::Instant::now();
    dispatcher
      .schedule(Job::Refresh { patient_id }, Some(Duration::from_millis(30)))
      .await
      .unwrap();
    assert!(queue.registry.try_recv().is_err());

    assert_eq!(queue.registry.recv().await, Some(Job::Refresh { patient_id }));
    assert!(started.elapsed() >= Duration::from_millis(30));
  }

  #[tokio::test]
  async fn closed_queue_is_an_error() {
    let (dispatcher, queue) = JobQueue::channel();
    drop(queue);
    let err = dispatcher
      .schedule(Job::FinalizeImport { import_id: Uuid::new_v4() }, None)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::QueueClosed(Queue::Imports)));
  }
}
