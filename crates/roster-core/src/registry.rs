//! The `RegistryClient` trait: the boundary to the national demographics
//! registry.
//!
//! Implementations are expected to bound every call with a timeout and to
//! share a global concurrency cap across all subjects (see
//! `roster-worker::throttle`).

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::{
  patient::{RegistryId, RegistryRecord},
  search::SearchQuery,
};

/// Result of a demographic search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMatch {
  NoMatch,
  OneMatch(RegistryId),
  TooManyMatches,
}

/// Result of looking up a single identifier.
#[derive(Debug, Clone)]
pub enum Lookup {
  Found(RegistryRecord),
  /// The identifier is unknown to the registry.
  NotFound,
  /// The registry holds the identifier but has withdrawn it.
  Invalidated,
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
  /// Throttled by the registry. Never a search outcome: the same step is
  /// retried later.
  #[error("rate limited by registry")]
  RateLimited { retry_after: Option<Duration> },

  #[error("registry transport error: {0}")]
  Transport(String),

  #[error("registry call timed out")]
  Timeout,
}

impl RegistryError {
  pub fn is_rate_limited(&self) -> bool {
    matches!(self, Self::RateLimited { .. })
  }
}

pub trait RegistryClient: Send + Sync {
  fn search<'a>(
    &'a self,
    query: &'a SearchQuery,
  ) -> impl Future<Output = Result<SearchMatch, RegistryError>> + Send + 'a;

  fn find_by_identifier<'a>(
    &'a self,
    id: &'a RegistryId,
  ) -> impl Future<Output = Result<Lookup, RegistryError>> + Send + 'a;
}
