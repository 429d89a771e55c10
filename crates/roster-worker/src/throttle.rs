//! Global admission control for registry calls.
//!
//! The registry rate-limits the whole service, not individual patients, so
//! one [`Throttled`] is shared by every worker. It caps concurrent calls
//! with a semaphore and spaces call starts evenly to stay under the
//! per-second limit.

use std::time::Duration;

use roster_core::{
  patient::RegistryId,
  registry::{Lookup, RegistryClient, RegistryError, SearchMatch},
  search::SearchQuery,
};
use tokio::{
  sync::{Mutex, Semaphore, SemaphorePermit},
  time::Instant,
};

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
  pub max_in_flight:       usize,
  pub requests_per_second: u32,
}

impl Default for ThrottleConfig {
  fn default() -> Self { Self { max_in_flight: 5, requests_per_second: 5 } }
}

pub struct Throttled<R> {
  inner:     R,
  permits:   Semaphore,
  spacing:   Duration,
  next_slot: Mutex<Instant>,
}

impl<R> Throttled<R> {
  pub fn new(inner: R, config: ThrottleConfig) -> Self {
    let spacing = Duration::from_secs(1) / config.requests_per_second.max(1);
    Self {
      inner,
      permits: Semaphore::new(config.max_in_flight.max(1)),
      spacing,
      next_slot: Mutex::new(Instant::now()),
    }
  }

  pub fn inner(&self) -> &R { &self.inner }

  /// Wait for an in-flight slot, then for this call's start time.
  async fn admit(&self) -> Result<SemaphorePermit<'_>, RegistryError> {
    let permit = self
      .permits
      .acquire()
      .await
      .map_err(|_| RegistryError::Transport("registry throttle closed".into()))?;

    let start = {
      let mut next = self.next_slot.lock().await;
      let start = (*next).max(Instant::now());
      *next = start + self.spacing;
      start
    };
    tokio::time::sleep_until(start).await;
    Ok(permit)
  }
}

impl<R: RegistryClient> RegistryClient for Throttled<R> {
  async fn search(&self, query: &SearchQuery) -> Result<SearchMatch, RegistryError> {
    let _permit = self.admit().await?;
    self.inner.search(query).await
  }

  async fn find_by_identifier(&self, id: &RegistryId) -> Result<Lookup, RegistryError> {
    let _permit = self.admit().await?;
    self.inner.find_by_identifier(id).await
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use super::*;

  /// Sleeps on every call and records the peak concurrency it saw.
  #[derive(Default)]
  struct SlowRegistry {
    current: AtomicUsize,
    peak:    AtomicUsize,
  }

  impl RegistryClient for SlowRegistry {
    async fn search(&self, _query: &SearchQuery) -> Result<SearchMatch, RegistryError> {
      let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.current.fetch_sub(1, Ordering::SeqCst);
      Ok(SearchMatch::NoMatch)
    }

    async fn find_by_identifier(&self, _id: &RegistryId) -> Result<Lookup, RegistryError> {
      Ok(Lookup::NotFound)
    }
  }

  fn query() -> SearchQuery {
    SearchQuery {
      family_name:   "Smith".into(),
      given_name:    "Jo".into(),
      date_of_birth: chrono::NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
      postcode:      "AB1 2CD".into(),
      history:       true,
      fuzzy:         false,
    }
  }

  #[tokio::test]
  async fn caps_calls_in_flight() {
    let throttled = Arc::new(Throttled::new(SlowRegistry::default(), ThrottleConfig {
      max_in_flight:       2,
      requests_per_second: 1000,
    }));

    let calls = (0..8).map(|_| {
      let throttled = throttled.clone();
      tokio::spawn(async move { throttled.search(&query()).await })
    });
    for call in calls.collect::<Vec<_>>() {
      assert_eq!(call.await.unwrap().unwrap(), SearchMatch::NoMatch);
    }
    assert_eq!(throttled.inner().peak.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn spaces_call_starts() {
    let throttled = Throttled::new(SlowRegistry::default(), ThrottleConfig {
      max_in_flight:       10,
      requests_per_second: 20,
    });

    let started = Instant::now();
    for _ in 0..3 {
      throttled.find_by_identifier(&RegistryId::new("1")).await.unwrap();
    }
    // Three starts at 50ms spacing: the third waits at least 100ms.
    assert!(started.elapsed() >= Duration::from_millis(100));
  }
}
