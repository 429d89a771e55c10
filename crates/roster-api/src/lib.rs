//! JSON REST API for the roster.
//!
//! Exposes an axum [`Router`] backed by any
//! [`roster_core::store::PatientStore`]. Requests that need the registry
//! never call it inline: they enqueue a job through the
//! [`roster_core::dispatch::TaskDispatcher`] and return `202 Accepted`.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", roster_api::api_router(store.clone(), dispatcher.clone()))
//! ```

pub mod error;
pub mod imports;
pub mod patients;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use roster_core::{dispatch::TaskDispatcher, store::PatientStore};

pub use error::ApiError;

/// Shared handler state.
pub struct ApiState<S, D> {
  pub store:      Arc<S>,
  pub dispatcher: Arc<D>,
}

impl<S, D> Clone for ApiState<S, D> {
  fn clone(&self) -> Self {
    Self { store: self.store.clone(), dispatcher: self.dispatcher.clone() }
  }
}

/// Build a fully-materialised API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S, D>(store: Arc<S>, dispatcher: Arc<D>) -> Router<()>
where
  S: PatientStore + 'static,
  D: TaskDispatcher + 'static,
{
  Router::new()
    // Patients
    .route("/patients", post(patients::create::<S, D>))
    .route("/patients/{id}", get(patients::get_one::<S, D>))
    .route(
      "/patients/{id}/search-results",
      get(patients::search_results::<S, D>),
    )
    .route("/patients/{id}/resolve", post(patients::resolve::<S, D>))
    .route("/patients/{id}/refresh", post(patients::refresh::<S, D>))
    .route("/patients/{id}/merge", post(patients::merge::<S, D>))
    // Imports
    .route("/imports", post(imports::create::<S, D>))
    .route("/imports/{id}", get(imports::get_one::<S, D>))
    .with_state(ApiState { store, dispatcher })
}
