//! Handlers for `/patients` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/patients` | 409 if the identifier is already held |
//! | `GET`  | `/patients/:id` | 404 if not found |
//! | `GET`  | `/patients/:id/search-results` | Audit trail, oldest first |
//! | `POST` | `/patients/:id/resolve` | 202; enqueues a direct search |
//! | `POST` | `/patients/:id/refresh` | 202; enqueues a registry refresh |
//! | `POST` | `/patients/:id/merge` | Body: `{"casualty":"<uuid>"}` |

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use roster_core::{
  dispatch::TaskDispatcher,
  merge::MergeReport,
  patient::{Demographics, NewPatient, Patient, RegistryId},
  pipeline,
  search::SearchResultEntry,
  store::PatientStore,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

async fn require<S: PatientStore>(store: &S, id: Uuid) -> Result<Patient, ApiError> {
  store
    .get_patient(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("patient {id} not found")))
}

// ─── Create ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  #[serde(flatten)]
  pub demographics: Demographics,
  #[serde(default)]
  pub registry_id:  Option<RegistryId>,
}

/// `POST /patients`
pub async fn create<S, D>(
  State(state): State<ApiState<S, D>>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  if let Some(registry_id) = &body.registry_id {
    let holder = state
      .store
      .find_by_registry_id(registry_id)
      .await
      .map_err(ApiError::store)?;
    if let Some(holder) = holder {
      return Err(ApiError::Conflict(format!(
        "registry id {registry_id} is held by patient {}",
        holder.patient_id
      )));
    }
  }

  let patient = state
    .store
    .add_patient(NewPatient {
      registry_id:  body.registry_id,
      demographics: body.demographics,
    })
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(patient)))
}

// ─── Read ─────────────────────────────────────────────────────────────────────

/// `GET /patients/:id`
pub async fn get_one<S, D>(
  State(state): State<ApiState<S, D>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Patient>, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  Ok(Json(require(state.store.as_ref(), id).await?))
}

/// `GET /patients/:id/search-results`
pub async fn search_results<S, D>(
  State(state): State<ApiState<S, D>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<SearchResultEntry>>, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  require(state.store.as_ref(), id).await?;
  let results = state.store.search_results(id).await.map_err(ApiError::store)?;
  Ok(Json(results))
}

// ─── Registry work ────────────────────────────────────────────────────────────

/// `POST /patients/:id/resolve`
pub async fn resolve<S, D>(
  State(state): State<ApiState<S, D>>,
  Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  require(state.store.as_ref(), id).await?;
  pipeline::start_patient_search(state.dispatcher.as_ref(), id).await?;
  Ok((StatusCode::ACCEPTED, Json(json!({ "patient_id": id }))))
}

/// `POST /patients/:id/refresh`; 400 if the patient has no identifier yet.
pub async fn refresh<S, D>(
  State(state): State<ApiState<S, D>>,
  Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  let patient = require(state.store.as_ref(), id).await?;
  if patient.registry_id.is_none() {
    return Err(ApiError::BadRequest(format!(
      "patient {id} has no registry id to refresh"
    )));
  }
  pipeline::request_refresh(state.dispatcher.as_ref(), id).await?;
  Ok((StatusCode::ACCEPTED, Json(json!({ "patient_id": id }))))
}

// ─── Merge ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MergeBody {
  pub casualty: Uuid,
}

/// `POST /patients/:id/merge`: folds `casualty` into `:id`.
pub async fn merge<S, D>(
  State(state): State<ApiState<S, D>>,
  Path(id): Path<Uuid>,
  Json(body): Json<MergeBody>,
) -> Result<Json<MergeReport>, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  if id == body.casualty {
    return Err(ApiError::BadRequest(format!(
      "cannot merge patient {id} into itself"
    )));
  }
  require(state.store.as_ref(), id).await?;
  require(state.store.as_ref(), body.casualty).await?;

  let report = state
    .store
    .merge_patients(id, body.casualty)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(report))
}
