//! Declarative decision tables driving the cascading registry search.
//!
//! A table maps each named step to a query [`Transform`] and to the [`Next`]
//! move for every [`Outcome`] it can produce. Tables are validated once on
//! construction: every referenced step must exist, no step may transition to
//! itself, and the graph must be acyclic so every traversal terminates.

use std::{
  borrow::Cow,
  collections::{BTreeMap, BTreeSet},
  fmt,
};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{
  Error, Result,
  search::{Outcome, SearchQuery},
};

// ─── Step names ──────────────────────────────────────────────────────────────

/// The name of a step; serialised as a plain string in task payloads and
/// stored history.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StepName(Cow<'static, str>);

impl StepName {
  pub fn new(name: impl Into<String>) -> Self { Self(Cow::Owned(name.into())) }

  pub const fn from_static(name: &'static str) -> Self {
    Self(Cow::Borrowed(name))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for StepName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

pub const NO_FUZZY_WITH_HISTORY: StepName =
  StepName::from_static("no_fuzzy_with_history");
pub const NO_FUZZY_WITHOUT_HISTORY: StepName =
  StepName::from_static("no_fuzzy_without_history");
pub const NO_FUZZY_WITH_WILDCARD_POSTCODE: StepName =
  StepName::from_static("no_fuzzy_with_wildcard_postcode");
pub const NO_FUZZY_WITH_WILDCARD_GIVEN_NAME: StepName =
  StepName::from_static("no_fuzzy_with_wildcard_given_name");
pub const NO_FUZZY_WITH_WILDCARD_FAMILY_NAME: StepName =
  StepName::from_static("no_fuzzy_with_wildcard_family_name");
pub const FUZZY_WITH_HISTORY: StepName =
  StepName::from_static("fuzzy_with_history");

// ─── Transforms ──────────────────────────────────────────────────────────────

/// Characters kept before the wildcard when truncating a name.
const NAME_PREFIX_LEN: usize = 3;
/// Characters kept before the wildcard when masking a postcode.
const POSTCODE_PREFIX_LEN: usize = 2;

/// How a step widens (or narrows) the exact query.
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
pub enum Transform {
  /// Exact demographics, history included.
  Exact,
  WithoutHistory,
  WildcardPostcode,
  WildcardGivenName,
  WildcardFamilyName,
  Fuzzy,
}

fn wildcard(value: &str, keep: usize) -> String {
  let mut out: String = value.chars().take(keep).collect();
  out.push('*');
  out
}

impl Transform {
  /// Whether `query` carries enough data for this transform to say anything
  /// the exact search did not. A name of three characters or fewer truncated
  /// to three is just the exact name again.
  pub fn applies_to(self, query: &SearchQuery) -> bool {
    match self {
      Self::WildcardGivenName => {
        query.given_name.chars().count() > NAME_PREFIX_LEN
      }
      Self::WildcardFamilyName => {
        query.family_name.chars().count() > NAME_PREFIX_LEN
      }
      _ => true,
    }
  }

  pub fn apply(self, mut query: SearchQuery) -> SearchQuery {
    match self {
      Self::Exact => {}
      Self::WithoutHistory => query.history = false,
      Self::WildcardPostcode => {
        query.postcode = wildcard(&query.postcode, POSTCODE_PREFIX_LEN);
      }
      Self::WildcardGivenName => {
        query.given_name = wildcard(&query.given_name, NAME_PREFIX_LEN);
      }
      Self::WildcardFamilyName => {
        query.family_name = wildcard(&query.family_name, NAME_PREFIX_LEN);
      }
      Self::Fuzzy => query.fuzzy = true,
    }
    query
  }
}

// ─── Steps ───────────────────────────────────────────────────────────────────

/// Where the cascade goes after a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "step", rename_all = "snake_case")]
pub enum Next {
  Step(StepName),
  /// Stop; nothing is staged.
  GiveUp,
  /// Stop; stage the identifier if exactly one distinct one was seen.
  SaveIfUnique,
}

#[derive(Debug, Clone)]
pub struct StepDef {
  transform: Transform,
  outcomes:  BTreeMap<Outcome, Next>,
}

impl StepDef {
  pub fn new(transform: Transform) -> Self {
    Self { transform, outcomes: BTreeMap::new() }
  }

  pub fn on(mut self, outcome: Outcome, next: Next) -> Self {
    self.outcomes.insert(outcome, next);
    self
  }

  /// Route every search outcome (including `skip_step`) to `next`.
  pub fn always(self, next: Next) -> Self {
    [
      Outcome::NoMatches,
      Outcome::OneMatch,
      Outcome::TooManyMatches,
      Outcome::SkipStep,
    ]
    .into_iter()
    .fold(self, |def, outcome| def.on(outcome, next.clone()))
  }

  pub fn transform(&self) -> Transform { self.transform }

  pub fn next(&self, outcome: Outcome) -> Option<&Next> {
    self.outcomes.get(&outcome)
  }

  fn successors(&self) -> impl Iterator<Item = &StepName> {
    self.outcomes.values().filter_map(|next| match next {
      Next::Step(name) => Some(name),
      _ => None,
    })
  }
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// Which of the canonical tables a task runs against.
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
pub enum TableKind {
  /// Resolving a committed patient record.
  Direct,
  /// Resolving a staged import row.
  Batch,
}

#[derive(Debug, Clone)]
pub struct StepTable {
  kind:  TableKind,
  first: StepName,
  steps: BTreeMap<StepName, StepDef>,
}

impl StepTable {
  /// Build and validate a table.
  pub fn new(
    kind: TableKind,
    first: StepName,
    steps: impl IntoIterator<Item = (StepName, StepDef)>,
  ) -> Result<Self> {
    let table = Self { kind, first, steps: steps.into_iter().collect() };
    table.validate()?;
    Ok(table)
  }

  /// The table used for direct record resolution.
  pub fn direct() -> Result<Self> {
    Self::new(TableKind::Direct, NO_FUZZY_WITH_HISTORY, Self::shared_steps(
      Next::SaveIfUnique,
    ))
  }

  /// The table used for import rows: the direct table plus a final fuzzy
  /// step after the wildcard family name step.
  pub fn batch() -> Result<Self> {
    let mut steps =
      Self::shared_steps(Next::Step(FUZZY_WITH_HISTORY));
    steps.push((
      FUZZY_WITH_HISTORY,
      StepDef::new(Transform::Fuzzy).always(Next::SaveIfUnique),
    ));
    Self::new(TableKind::Batch, NO_FUZZY_WITH_HISTORY, steps)
  }

  pub fn for_kind(kind: TableKind) -> Result<Self> {
    match kind {
      TableKind::Direct => Self::direct(),
      TableKind::Batch => Self::batch(),
    }
  }

  fn shared_steps(after_family_name: Next) -> Vec<(StepName, StepDef)> {
    use Outcome::*;

    vec![
      (
        NO_FUZZY_WITH_HISTORY,
        StepDef::new(Transform::Exact)
          .on(NoMatches, Next::Step(NO_FUZZY_WITH_WILDCARD_POSTCODE))
          .on(OneMatch, Next::SaveIfUnique)
          .on(TooManyMatches, Next::Step(NO_FUZZY_WITHOUT_HISTORY)),
      ),
      (
        NO_FUZZY_WITHOUT_HISTORY,
        StepDef::new(Transform::WithoutHistory)
          .on(NoMatches, Next::GiveUp)
          .on(OneMatch, Next::SaveIfUnique)
          .on(TooManyMatches, Next::GiveUp),
      ),
      (
        NO_FUZZY_WITH_WILDCARD_POSTCODE,
        StepDef::new(Transform::WildcardPostcode)
          .on(NoMatches, Next::Step(NO_FUZZY_WITH_WILDCARD_GIVEN_NAME))
          .on(OneMatch, Next::Step(NO_FUZZY_WITH_WILDCARD_GIVEN_NAME))
          .on(TooManyMatches, Next::Step(NO_FUZZY_WITH_WILDCARD_GIVEN_NAME)),
      ),
      (
        NO_FUZZY_WITH_WILDCARD_GIVEN_NAME,
        StepDef::new(Transform::WildcardGivenName)
          .always(Next::Step(NO_FUZZY_WITH_WILDCARD_FAMILY_NAME)),
      ),
      (
        NO_FUZZY_WITH_WILDCARD_FAMILY_NAME,
        StepDef::new(Transform::WildcardFamilyName).always(after_family_name),
      ),
    ]
  }

  pub fn kind(&self) -> TableKind { self.kind }

  pub fn first(&self) -> &StepName { &self.first }

  pub fn get(&self, name: &StepName) -> Option<&StepDef> {
    self.steps.get(name)
  }

  pub fn len(&self) -> usize { self.steps.len() }

  pub fn is_empty(&self) -> bool { self.steps.is_empty() }

  pub fn iter(&self) -> impl Iterator<Item = (&StepName, &StepDef)> {
    self.steps.iter()
  }

  fn validate(&self) -> Result<()> {
    if !self.steps.contains_key(&self.first) {
      return Err(Error::MissingStep(self.first.clone()));
    }

    for (name, def) in &self.steps {
      for next in def.successors() {
        if next == name {
          return Err(Error::SelfTransition(name.clone()));
        }
        if !self.steps.contains_key(next) {
          return Err(Error::UnknownStep {
            from: name.clone(),
            to:   next.clone(),
          });
        }
      }
    }

    // Depth-first search for back edges.
    let mut done = BTreeSet::new();
    for start in self.steps.keys() {
      let mut path = Vec::new();
      self.visit(start, &mut path, &mut done)?;
    }
    Ok(())
  }

  fn visit<'a>(
    &'a self,
    name: &'a StepName,
    path: &mut Vec<&'a StepName>,
    done: &mut BTreeSet<&'a StepName>,
  ) -> Result<()> {
    if done.contains(name) {
      return Ok(());
    }
    if path.contains(&name) {
      return Err(Error::CyclicTable(name.clone()));
    }
    path.push(name);
    if let Some(def) = self.steps.get(name) {
      for next in def.successors() {
        self.visit(next, path, done)?;
      }
    }
    path.pop();
    done.insert(name);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn query() -> SearchQuery {
    SearchQuery {
      family_name:   "Smith".into(),
      given_name:    "Jo".into(),
      date_of_birth: NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
      postcode:      "AB1 2CD".into(),
      history:       true,
      fuzzy:         false,
    }
  }

  const SEARCH_OUTCOMES: [Outcome; 4] = [
    Outcome::NoMatches,
    Outcome::OneMatch,
    Outcome::TooManyMatches,
    Outcome::SkipStep,
  ];

  #[test]
  fn canonical_tables_never_transition_to_themselves() {
    for table in [StepTable::direct().unwrap(), StepTable::batch().unwrap()] {
      for (name, def) in table.iter() {
        for outcome in SEARCH_OUTCOMES {
          if let Some(Next::Step(next)) = def.next(outcome) {
            assert_ne!(next, name, "{} loops on {outcome}", table.kind());
          }
        }
      }
    }
  }

  #[test]
  fn batch_table_only_adds_the_fuzzy_step() {
    let direct = StepTable::direct().unwrap();
    let batch = StepTable::batch().unwrap();
    assert_eq!(batch.len(), direct.len() + 1);
    assert!(direct.get(&FUZZY_WITH_HISTORY).is_none());
    assert_eq!(
      batch
        .get(&NO_FUZZY_WITH_WILDCARD_FAMILY_NAME)
        .unwrap()
        .next(Outcome::NoMatches),
      Some(&Next::Step(FUZZY_WITH_HISTORY))
    );
  }

  #[test]
  fn rejects_unknown_step() {
    let err = StepTable::new(TableKind::Direct, StepName::new("a"), [(
      StepName::new("a"),
      StepDef::new(Transform::Exact)
        .on(Outcome::NoMatches, Next::Step(StepName::new("b"))),
    )])
    .unwrap_err();
    assert!(matches!(err, Error::UnknownStep { .. }));
    assert!(err.is_configuration());
  }

  #[test]
  fn rejects_self_transition() {
    let err = StepTable::new(TableKind::Direct, StepName::new("a"), [(
      StepName::new("a"),
      StepDef::new(Transform::Exact)
        .on(Outcome::NoMatches, Next::Step(StepName::new("a"))),
    )])
    .unwrap_err();
    assert!(matches!(err, Error::SelfTransition(_)));
  }

  #[test]
  fn rejects_cycles() {
    let err = StepTable::new(TableKind::Direct, StepName::new("a"), [
      (
        StepName::new("a"),
        StepDef::new(Transform::Exact)
          .on(Outcome::NoMatches, Next::Step(StepName::new("b"))),
      ),
      (
        StepName::new("b"),
        StepDef::new(Transform::Fuzzy)
          .on(Outcome::NoMatches, Next::Step(StepName::new("a"))),
      ),
    ])
    .unwrap_err();
    assert!(matches!(err, Error::CyclicTable(_)));
  }

  #[test]
  fn rejects_missing_first_step() {
    let err = StepTable::new(TableKind::Batch, StepName::new("start"), [(
      StepName::new("a"),
      StepDef::new(Transform::Exact).always(Next::GiveUp),
    )])
    .unwrap_err();
    assert!(matches!(err, Error::MissingStep(_)));
  }

  #[test]
  fn wildcard_transforms_truncate() {
    let mut q = query();
    q.given_name = "Joanna".into();

    let given = Transform::WildcardGivenName.apply(q.clone());
    assert_eq!(given.given_name, "Joa*");

    let family = Transform::WildcardFamilyName.apply(q.clone());
    assert_eq!(family.family_name, "Smi*");

    let postcode = Transform::WildcardPostcode.apply(q.clone());
    assert_eq!(postcode.postcode, "AB*");

    assert!(!Transform::WithoutHistory.apply(q.clone()).history);
    assert!(Transform::Fuzzy.apply(q).fuzzy);
  }

  #[test]
  fn short_names_skip_wildcard_steps() {
    let q = query();
    assert!(!Transform::WildcardGivenName.applies_to(&q));
    assert!(Transform::WildcardFamilyName.applies_to(&q));

    let mut short = q;
    short.family_name = "Li".into();
    assert!(!Transform::WildcardFamilyName.applies_to(&short));
    assert!(Transform::WildcardPostcode.applies_to(&short));
  }
}
