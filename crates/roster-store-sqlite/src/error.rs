//! Error type for `roster-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] roster_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored enum column held an unknown value.
  #[error("cannot decode {column}: {value:?}")]
  Decode { column: &'static str, value: String },

  #[error("patient not found: {0}")]
  PatientNotFound(uuid::Uuid),

  #[error("changeset not found: {0}")]
  ChangesetNotFound(uuid::Uuid),

  #[error("import not found: {0}")]
  ImportNotFound(uuid::Uuid),

  #[error("registry id {registry_id} is already held by patient {holder}")]
  DuplicateRegistryId { registry_id: String, holder: uuid::Uuid },

  /// A merge step touched an unexpected number of rows; the transaction
  /// was rolled back.
  #[error("merge conflict: {0}")]
  MergeConflict(String),
}

impl roster_core::store::StoreError for Error {
  fn is_conflict(&self) -> bool {
    match self {
      Error::DuplicateRegistryId { .. } | Error::MergeConflict(_) => true,
      Error::Sqlite(e) | Error::Database(tokio_rusqlite::Error::Rusqlite(e)) => {
        e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
      }
      _ => false,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
