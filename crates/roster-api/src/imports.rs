//! Handlers for `/imports` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/imports` | Body: `{"rows":[...]}`; 202 |
//! | `GET`  | `/imports/:id` | Import with its rows; 404 if not found |

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use roster_core::{
  changeset::{Changeset, Import, NewChangeset},
  dispatch::TaskDispatcher,
  pipeline,
  store::PatientStore,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

// ─── Create ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  pub rows: Vec<NewChangeset>,
}

/// `POST /imports`
pub async fn create<S, D>(
  State(state): State<ApiState<S, D>>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  let mut seen = std::collections::HashSet::new();
  if let Some(row) = body.rows.iter().find(|r| !seen.insert(r.row_number)) {
    return Err(ApiError::BadRequest(format!(
      "row number {} appears more than once",
      row.row_number
    )));
  }

  let import =
    pipeline::start_import(state.store.as_ref(), state.dispatcher.as_ref(), body.rows)
      .await?;
  Ok((StatusCode::ACCEPTED, Json(import)))
}

// ─── Get one ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ImportView {
  #[serde(flatten)]
  pub import: Import,
  pub rows:   Vec<Changeset>,
}

/// `GET /imports/:id`
pub async fn get_one<S, D>(
  State(state): State<ApiState<S, D>>,
  Path(id): Path<Uuid>,
) -> Result<Json<ImportView>, ApiError>
where
  S: PatientStore,
  D: TaskDispatcher,
{
  let import = state
    .store
    .get_import(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("import {id} not found")))?;
  let rows = state.store.list_changesets(id).await.map_err(ApiError::store)?;
  Ok(Json(ImportView { import, rows }))
}
