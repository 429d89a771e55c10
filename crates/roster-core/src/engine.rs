//! The cascading search engine: executes one step of a [`StepTable`] for a
//! subject and decides whether to continue, stop, or retry later.
//!
//! [`CascadingSearchEngine::advance`] is a pure function of its inputs apart
//! from the registry call and the entry timestamp. It never persists or
//! schedules anything itself; the caller acts on the returned [`Advance`].
//! That is what makes redelivered tasks safe to re-run.

use std::{sync::Arc, time::Duration};

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
  Error, Result,
  dispatch::SearchTask,
  patient::{Demographics, RegistryId},
  registry::{RegistryClient, RegistryError, SearchMatch},
  search::{self, Outcome, SearchQuery, SearchResultEntry},
  step_table::{Next, StepTable, TableKind},
};

// ─── Retry policy ────────────────────────────────────────────────────────────

/// Bounds of the uniformly random delay applied before retrying a throttled
/// step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub min_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      min_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  pub fn jittered_delay(&self) -> Duration {
    if self.max_delay <= self.min_delay {
      return self.min_delay;
    }
    rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
  }

  /// The delay before retrying after a rate-limit response, honouring any
  /// `Retry-After` hint from the registry.
  pub fn delay_for(&self, retry_after: Option<Duration>) -> Duration {
    self.jittered_delay().max(retry_after.unwrap_or_default())
  }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// How a terminated cascade resolved its subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "registry_ids", rename_all = "snake_case")]
pub enum Resolution {
  /// Exactly one distinct identifier was seen.
  Resolved(RegistryId),
  /// The table gave up, or nothing was found.
  GaveUp,
  /// Two or more distinct identifiers were seen; needs manual resolution.
  Ambiguous(Vec<RegistryId>),
  /// The registry failed mid-cascade.
  Failed,
  /// The subject lacks the demographics every step needs.
  MissingDemographics,
}

impl Resolution {
  pub fn registry_id(&self) -> Option<&RegistryId> {
    match self {
      Self::Resolved(id) => Some(id),
      _ => None,
    }
  }
}

/// The decision taken by one call to [`CascadingSearchEngine::advance`].
#[derive(Debug, Clone)]
pub enum Advance {
  /// Schedule this task next.
  Continue(SearchTask),
  /// The cascade is over for this subject.
  Terminate {
    resolution: Resolution,
    history:    Vec<SearchResultEntry>,
  },
  /// The registry throttled us; run the same task again after `delay`.
  RetryLater { task: SearchTask, delay: Duration },
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct CascadingSearchEngine<R> {
  registry: Arc<R>,
  direct:   StepTable,
  batch:    StepTable,
  retry:    RetryPolicy,
}

impl<R: RegistryClient> CascadingSearchEngine<R> {
  /// Build an engine over the canonical tables, validating both.
  pub fn new(registry: Arc<R>, retry: RetryPolicy) -> Result<Self> {
    Self::with_tables(registry, StepTable::direct()?, StepTable::batch()?, retry)
  }

  pub fn with_tables(
    registry: Arc<R>,
    direct: StepTable,
    batch: StepTable,
    retry: RetryPolicy,
  ) -> Result<Self> {
    Ok(Self { registry, direct, batch, retry })
  }

  pub fn table(&self, kind: TableKind) -> &StepTable {
    match kind {
      TableKind::Direct => &self.direct,
      TableKind::Batch => &self.batch,
    }
  }

  /// Execute the step named by `task` against `demographics`.
  ///
  /// Configuration errors (an unknown step, a missing transition, a step
  /// transitioning to itself) are returned as `Err` and must not be retried.
  pub async fn advance(
    &self,
    demographics: &Demographics,
    task: &SearchTask,
  ) -> Result<Advance> {
    let table = self.table(task.table);
    let step = task.step.clone().unwrap_or_else(|| table.first().clone());
    let def = table.get(&step).ok_or_else(|| Error::MissingStep(step.clone()))?;

    let mut history = task.history.clone();

    let Some(query) = SearchQuery::exact(demographics) else {
      debug!(%step, "no postcode, not searching");
      history.push(SearchResultEntry::new(step, Outcome::NoPostcode, None));
      return Ok(Advance::Terminate {
        resolution: Resolution::MissingDemographics,
        history,
      });
    };

    let (outcome, registry_id) = if def.transform().applies_to(&query) {
      let query = def.transform().apply(query);
      match self.registry.search(&query).await {
        Ok(SearchMatch::NoMatch) => (Outcome::NoMatches, None),
        Ok(SearchMatch::OneMatch(id)) => (Outcome::OneMatch, Some(id)),
        Ok(SearchMatch::TooManyMatches) => (Outcome::TooManyMatches, None),
        Err(RegistryError::RateLimited { retry_after }) => {
          let delay = self.retry.delay_for(retry_after);
          debug!(%step, ?delay, "rate limited, retrying step later");
          return Ok(Advance::RetryLater { task: task.clone(), delay });
        }
        Err(e) => {
          warn!(%step, error = %e, "registry search failed");
          (Outcome::Error, None)
        }
      }
    } else {
      (Outcome::SkipStep, None)
    };

    debug!(%step, %outcome, registry_id = ?registry_id, "step classified");
    history.push(SearchResultEntry::new(step.clone(), outcome, registry_id));

    if outcome == Outcome::Error {
      return Ok(Advance::Terminate { resolution: Resolution::Failed, history });
    }

    let ids = search::distinct_registry_ids(&history);
    if ids.len() > 1 {
      return Ok(Advance::Terminate {
        resolution: Resolution::Ambiguous(ids),
        history,
      });
    }

    let next = def
      .next(outcome)
      .ok_or_else(|| Error::MissingOutcome { step: step.clone(), outcome })?;

    match next {
      Next::GiveUp => {
        Ok(Advance::Terminate { resolution: Resolution::GaveUp, history })
      }
      Next::SaveIfUnique => {
        let resolution = match search::unique_registry_id(&history) {
          Some(id) => Resolution::Resolved(id),
          None => Resolution::GaveUp,
        };
        Ok(Advance::Terminate { resolution, history })
      }
      Next::Step(next_step) => {
        if *next_step == step {
          return Err(Error::SelfTransition(step));
        }
        Ok(Advance::Continue(SearchTask {
          step: Some(next_step.clone()),
          history,
          ..task.clone()
        }))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use chrono::NaiveDate;

  use super::*;
  use crate::{
    dispatch::SubjectRef,
    registry::Lookup,
    step_table::{
      NO_FUZZY_WITH_HISTORY, NO_FUZZY_WITH_WILDCARD_FAMILY_NAME,
      NO_FUZZY_WITH_WILDCARD_GIVEN_NAME, NO_FUZZY_WITH_WILDCARD_POSTCODE,
      NO_FUZZY_WITHOUT_HISTORY, StepDef, StepName, Transform,
    },
  };
  use uuid::Uuid;

  /// Answers searches from a script, in order; repeats the last answer.
  struct ScriptedRegistry {
    answers: Mutex<Vec<Result<SearchMatch, RegistryError>>>,
    queries: Mutex<Vec<SearchQuery>>,
  }

  impl ScriptedRegistry {
    fn new(answers: Vec<Result<SearchMatch, RegistryError>>) -> Arc<Self> {
      Arc::new(Self {
        answers: Mutex::new(answers.into_iter().rev().collect()),
        queries: Mutex::new(Vec::new()),
      })
    }

    fn always(answer: SearchMatch) -> Arc<Self> { Self::new(vec![Ok(answer)]) }

    fn queries(&self) -> Vec<SearchQuery> {
      self.queries.lock().unwrap().clone()
    }
  }

  impl RegistryClient for ScriptedRegistry {
    async fn search(
      &self,
      query: &SearchQuery,
    ) -> Result<SearchMatch, RegistryError> {
      self.queries.lock().unwrap().push(query.clone());
      let mut answers = self.answers.lock().unwrap();
      if answers.len() > 1 {
        answers.pop().unwrap()
      } else {
        answers.last().cloned().unwrap()
      }
    }

    async fn find_by_identifier(
      &self,
      _id: &RegistryId,
    ) -> Result<Lookup, RegistryError> {
      Ok(Lookup::NotFound)
    }
  }

  fn smith() -> Demographics {
    Demographics {
      given_name:    "Jo".into(),
      family_name:   "Smith".into(),
      date_of_birth: NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
      postcode:      Some("AB1 2CD".into()),
    }
  }

  fn engine(registry: Arc<ScriptedRegistry>) -> CascadingSearchEngine<ScriptedRegistry> {
    CascadingSearchEngine::new(registry, RetryPolicy::default()).unwrap()
  }

  fn task(table: TableKind) -> SearchTask {
    SearchTask::new(SubjectRef::Patient(Uuid::new_v4()), table)
  }

  /// Drive `task` until it stops continuing, returning every decision.
  async fn run_to_end(
    engine: &CascadingSearchEngine<ScriptedRegistry>,
    demographics: &Demographics,
    mut task: SearchTask,
  ) -> (Advance, usize) {
    let mut steps = 0;
    loop {
      steps += 1;
      match engine.advance(demographics, &task).await.unwrap() {
        Advance::Continue(next) => task = next,
        other => return (other, steps),
      }
    }
  }

  #[tokio::test]
  async fn too_many_then_one_match_stages_identifier() {
    let registry = ScriptedRegistry::new(vec![
      Ok(SearchMatch::TooManyMatches),
      Ok(SearchMatch::OneMatch(RegistryId::new("123"))),
    ]);
    let engine = engine(registry.clone());
    let demographics = smith();

    let first = engine.advance(&demographics, &task(TableKind::Direct)).await;
    let Advance::Continue(next) = first.unwrap() else {
      panic!("expected the cascade to continue");
    };
    assert_eq!(next.step, Some(NO_FUZZY_WITHOUT_HISTORY));

    let Advance::Terminate { resolution, history } =
      engine.advance(&demographics, &next).await.unwrap()
    else {
      panic!("expected the cascade to stop");
    };
    assert_eq!(resolution, Resolution::Resolved(RegistryId::new("123")));
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].step, NO_FUZZY_WITH_HISTORY);
    assert_eq!(history[0].outcome, Outcome::TooManyMatches);
    assert_eq!(history[1].step, NO_FUZZY_WITHOUT_HISTORY);
    assert_eq!(history[1].registry_id, Some(RegistryId::new("123")));
    assert!(history[0].created_at <= history[1].created_at);

    let queries = registry.queries();
    assert!(queries[0].history);
    assert!(!queries[1].history);
  }

  #[tokio::test]
  async fn no_matches_everywhere_gives_up_after_every_widening_step() {
    let engine = engine(ScriptedRegistry::always(SearchMatch::NoMatch));
    let mut demographics = smith();
    demographics.given_name = "Joanna".into();

    let (end, steps) =
      run_to_end(&engine, &demographics, task(TableKind::Direct)).await;
    let Advance::Terminate { resolution, history } = end else {
      panic!("expected termination");
    };
    assert_eq!(resolution, Resolution::GaveUp);
    assert_eq!(steps, 4);
    let names: Vec<_> = history.iter().map(|e| e.step.clone()).collect();
    assert_eq!(names, vec![
      NO_FUZZY_WITH_HISTORY,
      NO_FUZZY_WITH_WILDCARD_POSTCODE,
      NO_FUZZY_WITH_WILDCARD_GIVEN_NAME,
      NO_FUZZY_WITH_WILDCARD_FAMILY_NAME,
    ]);
  }

  #[tokio::test]
  async fn batch_table_runs_the_fuzzy_step_last() {
    let registry = ScriptedRegistry::always(SearchMatch::NoMatch);
    let engine = engine(registry.clone());

    let (end, steps) =
      run_to_end(&engine, &smith(), task(TableKind::Batch)).await;
    assert!(matches!(end, Advance::Terminate {
      resolution: Resolution::GaveUp,
      ..
    }));
    assert_eq!(steps, 5);
    // The given name "Jo" is too short to wildcard, so one step is skipped.
    let queries = registry.queries();
    assert_eq!(queries.len(), 4);
    assert!(queries.last().unwrap().fuzzy);
  }

  #[tokio::test]
  async fn short_names_record_skip_step_without_calling_registry() {
    let registry = ScriptedRegistry::always(SearchMatch::NoMatch);
    let engine = engine(registry.clone());
    let mut demographics = smith();
    demographics.family_name = "Li".into();

    let (end, _) =
      run_to_end(&engine, &demographics, task(TableKind::Direct)).await;
    let Advance::Terminate { history, .. } = end else {
      panic!("expected termination");
    };
    let skipped: Vec<_> = history
      .iter()
      .filter(|e| e.outcome == Outcome::SkipStep)
      .map(|e| e.step.clone())
      .collect();
    assert_eq!(skipped, vec![
      NO_FUZZY_WITH_WILDCARD_GIVEN_NAME,
      NO_FUZZY_WITH_WILDCARD_FAMILY_NAME,
    ]);
    assert_eq!(registry.queries().len(), 2);
  }

  #[tokio::test]
  async fn ambiguity_terminates_regardless_of_table() {
    let engine =
      engine(ScriptedRegistry::always(SearchMatch::OneMatch(RegistryId::new("2"))));
    let mut task = task(TableKind::Direct);
    task.step = Some(NO_FUZZY_WITH_WILDCARD_POSTCODE);
    task.history.push(SearchResultEntry::new(
      NO_FUZZY_WITH_HISTORY,
      Outcome::OneMatch,
      Some(RegistryId::new("1")),
    ));

    let Advance::Terminate { resolution, history } =
      engine.advance(&smith(), &task).await.unwrap()
    else {
      panic!("expected termination");
    };
    assert_eq!(
      resolution,
      Resolution::Ambiguous(vec![RegistryId::new("1"), RegistryId::new("2")])
    );
    assert_eq!(history.len(), 2);
  }

  #[tokio::test]
  async fn transport_error_terminates_as_failed() {
    let engine = engine(ScriptedRegistry::new(vec![Err(
      RegistryError::Transport("502 bad gateway".into()),
    )]));

    let Advance::Terminate { resolution, history } =
      engine.advance(&smith(), &task(TableKind::Direct)).await.unwrap()
    else {
      panic!("expected termination");
    };
    assert_eq!(resolution, Resolution::Failed);
    assert_eq!(history[0].outcome, Outcome::Error);
  }

  #[tokio::test]
  async fn rate_limit_retries_the_same_step_without_recording() {
    let engine = engine(ScriptedRegistry::new(vec![Err(
      RegistryError::RateLimited { retry_after: None },
    )]));
    let task = task(TableKind::Direct);

    let Advance::RetryLater { task: retry, delay } =
      engine.advance(&smith(), &task).await.unwrap()
    else {
      panic!("expected a retry");
    };
    assert_eq!(retry, task);
    assert!(retry.history.is_empty());
    let policy = RetryPolicy::default();
    assert!(delay >= policy.min_delay && delay <= policy.max_delay);
  }

  #[tokio::test]
  async fn missing_postcode_terminates_immediately() {
    let registry = ScriptedRegistry::always(SearchMatch::NoMatch);
    let engine = engine(registry.clone());
    let mut demographics = smith();
    demographics.postcode = None;

    let Advance::Terminate { resolution, history } =
      engine.advance(&demographics, &task(TableKind::Batch)).await.unwrap()
    else {
      panic!("expected termination");
    };
    assert_eq!(resolution, Resolution::MissingDemographics);
    assert_eq!(history[0].outcome, Outcome::NoPostcode);
    assert!(registry.queries().is_empty());
  }

  #[tokio::test]
  async fn redelivered_task_makes_the_same_decision() {
    let engine = engine(ScriptedRegistry::always(SearchMatch::NoMatch));
    let task = task(TableKind::Direct);
    let demographics = smith();

    let first = engine.advance(&demographics, &task).await.unwrap();
    let second = engine.advance(&demographics, &task).await.unwrap();
    let (Advance::Continue(a), Advance::Continue(b)) = (first, second) else {
      panic!("expected both runs to continue");
    };
    assert_eq!(a.step, b.step);
    assert_eq!(a.history.len(), 1);
    assert!(a.history[0].is_equivalent(&b.history[0]));
  }

  #[tokio::test]
  async fn missing_transition_is_a_configuration_error() {
    let start = StepName::new("start");
    let table = StepTable::new(TableKind::Direct, start.clone(), [(
      start,
      StepDef::new(Transform::Exact).on(Outcome::OneMatch, Next::GiveUp),
    )])
    .unwrap();
    let engine = CascadingSearchEngine::with_tables(
      ScriptedRegistry::always(SearchMatch::NoMatch),
      table,
      StepTable::batch().unwrap(),
      RetryPolicy::default(),
    )
    .unwrap();

    let err =
      engine.advance(&smith(), &task(TableKind::Direct)).await.unwrap_err();
    assert!(matches!(err, Error::MissingOutcome { outcome: Outcome::NoMatches, .. }));
    assert!(err.is_configuration());
  }
}
