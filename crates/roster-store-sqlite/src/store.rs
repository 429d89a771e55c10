//! [`SqliteStore`]: the SQLite implementation of [`PatientStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use roster_core::{
  changeset::{
    BatchVerdict, Changeset, ChangesetStatus, Import, ImportStatus, NewChangeset,
  },
  engine::Resolution,
  event::{DomainEvent, EventKind},
  merge::{MergeReport, PatientAggregate},
  patient::{Demographics, NewPatient, Patient, PendingChanges, RegistryId},
  search::SearchResultEntry,
  store::PatientStore,
};
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    CHANGESET_COLUMNS, IMPORT_COLUMNS, PATIENT_COLUMNS, RawChangeset, RawEvent,
    RawImport, RawPatient, RawSearchResult, decode_uuid, encode_date, encode_dt,
    encode_json, encode_uuid,
  },
  merge,
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A roster store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run `f` on the database thread. Domain errors raised inside `f` come
  /// back as they are rather than wrapped in a connection error.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    self.conn.call(move |conn| Ok(f(conn))).await?
  }

  #[cfg(test)]
  pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
    self
      .with_conn(move |conn| {
        conn.execute_batch(sql)?;
        Ok(())
      })
      .await
  }

  // ── Dependent entities ────────────────────────────────────────────────────

  /// Enrol a patient in a group for a period. Fails if they are already
  /// enrolled.
  pub async fn add_membership(
    &self,
    patient_id: Uuid,
    group_id: Uuid,
    period: i32,
  ) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let params = (encode_uuid(id), encode_uuid(patient_id), encode_uuid(group_id));
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO group_memberships (membership_id, patient_id, group_id, period)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![params.0, params.1, params.2, period],
        )?;
        Ok(id)
      })
      .await
  }

  /// Record a decision (e.g. an assessment) against a membership.
  pub async fn add_membership_decision(
    &self,
    membership_id: Uuid,
    kind: &str,
  ) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let params = (
      encode_uuid(id),
      encode_uuid(membership_id),
      kind.to_owned(),
      encode_dt(Utc::now()),
    );
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO membership_decisions (decision_id, membership_id, kind, recorded_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![params.0, params.1, params.2, params.3],
        )?;
        Ok(id)
      })
      .await
  }

  pub async fn add_consent(&self, patient_id: Uuid, response: &str) -> Result<Uuid> {
    self
      .insert_owned(
        "INSERT INTO consents (consent_id, patient_id, response, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        patient_id,
        response,
      )
      .await
  }

  pub async fn add_triage(&self, patient_id: Uuid, status: &str) -> Result<Uuid> {
    self
      .insert_owned(
        "INSERT INTO triages (triage_id, patient_id, status, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        patient_id,
        status,
      )
      .await
  }

  pub async fn add_vaccination_record(
    &self,
    patient_id: Uuid,
    vaccine: &str,
  ) -> Result<Uuid> {
    self
      .insert_owned(
        "INSERT INTO vaccination_records (record_id, patient_id, vaccine, administered_at)
         VALUES (?1, ?2, ?3, ?4)",
        patient_id,
        vaccine,
      )
      .await
  }

  pub async fn add_guardian_relationship(
    &self,
    patient_id: Uuid,
    guardian_id: Uuid,
  ) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let params = (encode_uuid(id), encode_uuid(patient_id), encode_uuid(guardian_id));
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO guardian_relationships (relationship_id, patient_id, guardian_id)
           VALUES (?1, ?2, ?3)",
          rusqlite::params![params.0, params.1, params.2],
        )?;
        Ok(id)
      })
      .await
  }

  /// Insert a `(id, patient_id, text, timestamp)` row.
  async fn insert_owned(
    &self,
    sql: &'static str,
    patient_id: Uuid,
    value: &str,
  ) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let params = (
      encode_uuid(id),
      encode_uuid(patient_id),
      value.to_owned(),
      encode_dt(Utc::now()),
    );
    self
      .with_conn(move |conn| {
        conn.execute(
          sql,
          rusqlite::params![params.0, params.1, params.2, params.3],
        )?;
        Ok(id)
      })
      .await
  }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

pub(crate) fn load_patient(conn: &Connection, id: Uuid) -> Result<Option<Patient>> {
  let raw = conn
    .query_row(
      &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE patient_id = ?1"),
      rusqlite::params![encode_uuid(id)],
      RawPatient::from_row,
    )
    .optional()?;
  raw.map(RawPatient::into_patient).transpose()
}

fn require_patient(conn: &Connection, id: Uuid) -> Result<Patient> {
  load_patient(conn, id)?.ok_or(Error::PatientNotFound(id))
}

fn insert_patient(
  conn: &Connection,
  registry_id: Option<&RegistryId>,
  demographics: &Demographics,
) -> Result<Patient> {
  let now = Utc::now();
  let patient = Patient {
    patient_id:     Uuid::new_v4(),
    registry_id:    registry_id.cloned(),
    demographics:   demographics.clone(),
    invalidated_at: None,
    created_at:     now,
    updated_at:     now,
  };

  if let Some(id) = registry_id {
    ensure_unclaimed(conn, id, patient.patient_id)?;
  }

  conn.execute(
    "INSERT INTO patients (
       patient_id, registry_id, given_name, family_name, date_of_birth,
       postcode, invalidated_at, created_at, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)",
    rusqlite::params![
      encode_uuid(patient.patient_id),
      registry_id.map(RegistryId::as_str),
      demographics.given_name,
      demographics.family_name,
      encode_date(demographics.date_of_birth),
      demographics.postcode,
      encode_dt(now),
    ],
  )?;
  Ok(patient)
}

/// Fail unless `registry_id` is free or already held by `patient_id`.
fn ensure_unclaimed(
  conn: &Connection,
  registry_id: &RegistryId,
  patient_id: Uuid,
) -> Result<()> {
  let holder: Option<String> = conn
    .query_row(
      "SELECT patient_id FROM patients WHERE registry_id = ?1 AND patient_id != ?2",
      rusqlite::params![registry_id.as_str(), encode_uuid(patient_id)],
      |r| r.get(0),
    )
    .optional()?;
  match holder {
    Some(holder) => Err(Error::DuplicateRegistryId {
      registry_id: registry_id.to_string(),
      holder:      decode_uuid(&holder)?,
    }),
    None => Ok(()),
  }
}

fn write_demographics(
  conn: &Connection,
  patient_id: Uuid,
  demographics: &Demographics,
  now: DateTime<Utc>,
) -> Result<()> {
  conn.execute(
    "UPDATE patients
     SET given_name = ?2, family_name = ?3, date_of_birth = ?4, postcode = ?5,
         updated_at = ?6
     WHERE patient_id = ?1",
    rusqlite::params![
      encode_uuid(patient_id),
      demographics.given_name,
      demographics.family_name,
      encode_date(demographics.date_of_birth),
      demographics.postcode,
      encode_dt(now),
    ],
  )?;
  Ok(())
}

pub(crate) fn insert_event(conn: &Connection, event: &DomainEvent) -> Result<()> {
  conn.execute(
    "INSERT INTO events (event_id, kind, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)",
    rusqlite::params![
      encode_uuid(event.event_id),
      event.kind.as_ref(),
      event.payload.to_string(),
      encode_dt(event.recorded_at),
    ],
  )?;
  Ok(())
}

fn insert_search_results(
  conn: &Connection,
  patient_id: Uuid,
  import_id: Option<Uuid>,
  run_id: Uuid,
  entries: &[SearchResultEntry],
) -> Result<usize> {
  let mut stmt = conn.prepare(
    "INSERT OR IGNORE INTO search_results (
       result_id, patient_id, import_id, step, outcome, registry_id, created_at,
       run_id, position
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
  )?;
  let patient_id = encode_uuid(patient_id);
  let import_id = import_id.map(encode_uuid);
  let run_id = encode_uuid(run_id);
  let mut inserted = 0;
  for (position, entry) in entries.iter().enumerate() {
    inserted += stmt.execute(rusqlite::params![
      encode_uuid(Uuid::new_v4()),
      patient_id,
      import_id,
      entry.step.as_str(),
      entry.outcome.as_ref(),
      entry.registry_id.as_ref().map(RegistryId::as_str),
      encode_dt(entry.created_at),
      run_id,
      position as i64,
    ])?;
  }
  Ok(inserted)
}

/// The one patient whose names, date of birth and postcode all match
/// `demographics`. Names compare case-insensitively and postcodes ignore
/// case and spacing. `None` when nothing matches or the match is ambiguous.
fn find_existing(conn: &Connection, demographics: &Demographics) -> Result<Option<Patient>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {PATIENT_COLUMNS} FROM patients
     WHERE lower(given_name) = lower(?1)
       AND lower(family_name) = lower(?2)
       AND date_of_birth = ?3
       AND upper(replace(COALESCE(postcode, ''), ' ', ''))
         = upper(replace(COALESCE(?4, ''), ' ', ''))
     LIMIT 2"
  ))?;
  let mut raws = stmt
    .query_map(
      rusqlite::params![
        demographics.given_name.trim(),
        demographics.family_name.trim(),
        encode_date(demographics.date_of_birth),
        demographics.postcode(),
      ],
      RawPatient::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  if raws.len() != 1 {
    return Ok(None);
  }
  raws.pop().map(RawPatient::into_patient).transpose()
}

fn load_import(conn: &Connection, id: Uuid) -> Result<Option<Import>> {
  let raw = conn
    .query_row(
      &format!("SELECT {IMPORT_COLUMNS} FROM imports WHERE import_id = ?1"),
      rusqlite::params![encode_uuid(id)],
      RawImport::from_row,
    )
    .optional()?;
  raw.map(RawImport::into_import).transpose()
}

fn load_changeset(conn: &Connection, id: Uuid) -> Result<Option<Changeset>> {
  let raw = conn
    .query_row(
      &format!("SELECT {CHANGESET_COLUMNS} FROM changesets WHERE changeset_id = ?1"),
      rusqlite::params![encode_uuid(id)],
      RawChangeset::from_row,
    )
    .optional()?;
  raw.map(RawChangeset::into_changeset).transpose()
}

// ─── PatientStore impl ───────────────────────────────────────────────────────

impl PatientStore for SqliteStore {
  type Error = Error;

  // ── Patients ──────────────────────────────────────────────────────────────

  async fn add_patient(&self, patient: NewPatient) -> Result<Patient> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created =
          insert_patient(&tx, patient.registry_id.as_ref(), &patient.demographics)?;
        tx.commit()?;
        Ok(created)
      })
      .await
  }

  async fn get_patient(&self, patient_id: Uuid) -> Result<Option<Patient>> {
    self.with_conn(move |conn| load_patient(conn, patient_id)).await
  }

  async fn find_by_registry_id(
    &self,
    registry_id: &RegistryId,
  ) -> Result<Option<Patient>> {
    let id = registry_id.as_str().to_owned();
    self
      .with_conn(move |conn| {
        let raw = conn
          .query_row(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE registry_id = ?1"),
            rusqlite::params![id],
            RawPatient::from_row,
          )
          .optional()?;
        raw.map(RawPatient::into_patient).transpose()
      })
      .await
  }

  async fn attach_registry_id(
    &self,
    patient_id: Uuid,
    registry_id: RegistryId,
    changes: PendingChanges,
  ) -> Result<Patient> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let patient = require_patient(&tx, patient_id)?;
        ensure_unclaimed(&tx, &registry_id, patient_id)?;

        let now = Utc::now();
        let mut demographics = patient.demographics.clone();
        changes.apply(&mut demographics)?;
        write_demographics(&tx, patient_id, &demographics, now)?;
        tx.execute(
          "UPDATE patients SET registry_id = ?2, invalidated_at = NULL
           WHERE patient_id = ?1",
          rusqlite::params![encode_uuid(patient_id), registry_id.as_str()],
        )?;

        if patient.registry_id.as_ref() != Some(&registry_id) {
          insert_event(
            &tx,
            &DomainEvent::new(
              EventKind::IdentifierResolved,
              json!({
                "patient_id":  patient_id,
                "registry_id": registry_id,
                "previous":    patient.registry_id,
              }),
            ),
          )?;
        }

        let updated = require_patient(&tx, patient_id)?;
        tx.commit()?;
        Ok(updated)
      })
      .await
  }

  async fn apply_changes(
    &self,
    patient_id: Uuid,
    changes: PendingChanges,
  ) -> Result<Patient> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut patient = require_patient(&tx, patient_id)?;
        if changes.is_empty() {
          return Ok(patient);
        }
        changes.apply(&mut patient.demographics)?;
        patient.updated_at = Utc::now();
        write_demographics(&tx, patient_id, &patient.demographics, patient.updated_at)?;
        tx.commit()?;
        Ok(patient)
      })
      .await
  }

  async fn clear_registry_id(&self, patient_id: Uuid) -> Result<Patient> {
    self
      .with_conn(move |conn| {
        conn.execute(
          "UPDATE patients SET registry_id = NULL, updated_at = ?2 WHERE patient_id = ?1",
          rusqlite::params![encode_uuid(patient_id), encode_dt(Utc::now())],
        )?;
        require_patient(conn, patient_id)
      })
      .await
  }

  async fn invalidate(&self, patient_id: Uuid) -> Result<Patient> {
    self
      .with_conn(move |conn| {
        let now = encode_dt(Utc::now());
        conn.execute(
          "UPDATE patients SET invalidated_at = ?2, updated_at = ?2 WHERE patient_id = ?1",
          rusqlite::params![encode_uuid(patient_id), now],
        )?;
        require_patient(conn, patient_id)
      })
      .await
  }

  async fn aggregate(&self, patient_id: Uuid) -> Result<Option<PatientAggregate>> {
    self
      .with_conn(move |conn| merge::load_aggregate(conn, patient_id))
      .await
  }

  async fn merge_patients(&self, survivor: Uuid, casualty: Uuid) -> Result<MergeReport> {
    self
      .with_conn(move |conn| merge::merge_patients(conn, survivor, casualty))
      .await
  }

  // ── Search history ────────────────────────────────────────────────────────

  async fn record_search_results(
    &self,
    patient_id: Uuid,
    import_id: Option<Uuid>,
    run_id: Uuid,
    entries: Vec<SearchResultEntry>,
  ) -> Result<usize> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        let inserted =
          insert_search_results(&tx, patient_id, import_id, run_id, &entries)?;
        tx.commit()?;
        Ok(inserted)
      })
      .await
  }

  async fn search_results(&self, patient_id: Uuid) -> Result<Vec<SearchResultEntry>> {
    self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT step, outcome, registry_id, created_at
           FROM search_results
           WHERE patient_id = ?1
           ORDER BY created_at, rowid",
        )?;
        let raws = stmt
          .query_map(rusqlite::params![encode_uuid(patient_id)], |row| {
            Ok(RawSearchResult {
              step:        row.get(0)?,
              outcome:     row.get(1)?,
              registry_id: row.get(2)?,
              created_at:  row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSearchResult::into_entry).collect()
      })
      .await
  }

  // ── Imports ───────────────────────────────────────────────────────────────

  async fn create_import(
    &self,
    rows: Vec<NewChangeset>,
  ) -> Result<(Import, Vec<Changeset>)> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let import = Import {
          import_id:    Uuid::new_v4(),
          status:       ImportStatus::Pending,
          row_count:    rows.len(),
          match_rate:   None,
          rejection:    None,
          created_at:   Utc::now(),
          processed_at: None,
        };
        let import_id = encode_uuid(import.import_id);
        tx.execute(
          "INSERT INTO imports (import_id, status, row_count, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![
            import_id,
            import.status.as_ref(),
            rows.len() as i64,
            encode_dt(import.created_at),
          ],
        )?;

        let mut changesets = Vec::with_capacity(rows.len());
        {
          let mut stmt = tx.prepare(
            "INSERT INTO changesets (
               changeset_id, import_id, row_number, given_name, family_name,
               date_of_birth, postcode, uploaded_registry_id, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          )?;
          for row in rows {
            let changeset = Changeset {
              changeset_id:         Uuid::new_v4(),
              import_id:            import.import_id,
              row_number:           row.row_number,
              demographics:         row.demographics,
              uploaded_registry_id: row.uploaded_registry_id,
              status:               ChangesetStatus::Pending,
              resolution:           None,
              search_results:       Vec::new(),
              staged_registry_id:   None,
              invalid_reason:       None,
              patient_id:           None,
            };
            stmt.execute(rusqlite::params![
              encode_uuid(changeset.changeset_id),
              import_id,
              changeset.row_number,
              changeset.demographics.given_name,
              changeset.demographics.family_name,
              encode_date(changeset.demographics.date_of_birth),
              changeset.demographics.postcode,
              changeset.uploaded_registry_id.as_ref().map(RegistryId::as_str),
              changeset.status.as_ref(),
            ])?;
            changesets.push(changeset);
          }
        }

        tx.commit()?;
        Ok((import, changesets))
      })
      .await
  }

  async fn get_import(&self, import_id: Uuid) -> Result<Option<Import>> {
    self.with_conn(move |conn| load_import(conn, import_id)).await
  }

  async fn get_changeset(&self, changeset_id: Uuid) -> Result<Option<Changeset>> {
    self
      .with_conn(move |conn| load_changeset(conn, changeset_id))
      .await
  }

  async fn list_changesets(&self, import_id: Uuid) -> Result<Vec<Changeset>> {
    self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CHANGESET_COLUMNS} FROM changesets
           WHERE import_id = ?1
           ORDER BY row_number"
        ))?;
        let raws = stmt
          .query_map(rusqlite::params![encode_uuid(import_id)], RawChangeset::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawChangeset::into_changeset).collect()
      })
      .await
  }

  async fn complete_changeset_search(
    &self,
    changeset_id: Uuid,
    resolution: Resolution,
    history: Vec<SearchResultEntry>,
  ) -> Result<bool> {
    let staged = resolution.registry_id().map(|id| id.as_str().to_owned());
    let resolution = encode_json(&resolution)?;
    let history = encode_json(&history)?;

    self
      .with_conn(move |conn| {
        let updated = conn.execute(
          "UPDATE changesets
           SET status = ?2, resolution = ?3, search_results = ?4,
               staged_registry_id = ?5
           WHERE changeset_id = ?1 AND status = ?6",
          rusqlite::params![
            encode_uuid(changeset_id),
            ChangesetStatus::Searched.as_ref(),
            resolution,
            history,
            staged,
            ChangesetStatus::Pending.as_ref(),
          ],
        )?;
        if updated == 0 && load_changeset(conn, changeset_id)?.is_none() {
          return Err(Error::ChangesetNotFound(changeset_id));
        }
        Ok(updated == 1)
      })
      .await
  }

  async fn claim_import(&self, import_id: Uuid) -> Result<bool> {
    self
      .with_conn(move |conn| {
        let claimed = conn.execute(
          "UPDATE imports SET status = ?2
           WHERE import_id = ?1 AND status = ?3
             AND NOT EXISTS (
               SELECT 1 FROM changesets WHERE import_id = ?1 AND status = ?4
             )",
          rusqlite::params![
            encode_uuid(import_id),
            ImportStatus::Finalizing.as_ref(),
            ImportStatus::Pending.as_ref(),
            ChangesetStatus::Pending.as_ref(),
          ],
        )?;
        Ok(claimed == 1)
      })
      .await
  }

  async fn save_verdict(&self, verdict: BatchVerdict) -> Result<Import> {
    let rejection = verdict.rejection.as_ref().map(encode_json).transpose()?;

    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let import_id = encode_uuid(verdict.import_id);

        {
          let mut stmt = tx.prepare(
            "UPDATE changesets SET status = ?2, invalid_reason = ?3
             WHERE changeset_id = ?1 AND status = ?4",
          )?;
          for decision in &verdict.decisions {
            stmt.execute(rusqlite::params![
              encode_uuid(decision.changeset_id),
              decision.status.as_ref(),
              decision.invalid_reason.map(|r| r.to_string()),
              ChangesetStatus::Searched.as_ref(),
            ])?;
          }
        }

        let (status, processed_at) = if verdict.is_rejected() {
          (ImportStatus::Rejected, Some(encode_dt(Utc::now())))
        } else {
          (ImportStatus::Finalizing, None)
        };
        let updated = tx.execute(
          "UPDATE imports
           SET status = ?2, match_rate = ?3, rejection = ?4,
               processed_at = COALESCE(?5, processed_at)
           WHERE import_id = ?1",
          rusqlite::params![
            import_id,
            status.as_ref(),
            verdict.match_rate,
            rejection,
            processed_at,
          ],
        )?;
        if updated == 0 {
          return Err(Error::ImportNotFound(verdict.import_id));
        }

        let import =
          load_import(&tx, verdict.import_id)?.ok_or(Error::ImportNotFound(verdict.import_id))?;
        tx.commit()?;
        Ok(import)
      })
      .await
  }

  async fn commit_changeset(&self, changeset_id: Uuid) -> Result<Option<Patient>> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changeset =
          load_changeset(&tx, changeset_id)?.ok_or(Error::ChangesetNotFound(changeset_id))?;
        if changeset.status != ChangesetStatus::Staged {
          debug!(changeset = %changeset_id, status = %changeset.status, "not committing");
          return Ok(None);
        }

        let existing = match changeset.effective_registry_id() {
          Some(_) => None,
          None => find_existing(&tx, &changeset.demographics)?,
        };
        let patient = match existing {
          Some(patient) => {
            debug!(
              changeset = %changeset_id,
              patient = %patient.patient_id,
              "row matches an existing patient"
            );
            patient
          }
          None => insert_patient(&tx, None, &changeset.demographics)?,
        };
        tx.execute(
          "INSERT OR IGNORE INTO import_patients (import_id, patient_id) VALUES (?1, ?2)",
          rusqlite::params![
            encode_uuid(changeset.import_id),
            encode_uuid(patient.patient_id),
          ],
        )?;
        insert_search_results(
          &tx,
          patient.patient_id,
          Some(changeset.import_id),
          changeset_id,
          &changeset.search_results,
        )?;
        tx.execute(
          "UPDATE changesets SET status = ?2, patient_id = ?3 WHERE changeset_id = ?1",
          rusqlite::params![
            encode_uuid(changeset_id),
            ChangesetStatus::Committed.as_ref(),
            encode_uuid(patient.patient_id),
          ],
        )?;

        tx.commit()?;
        Ok(Some(patient))
      })
      .await
  }

  async fn set_import_status(
    &self,
    import_id: Uuid,
    status: ImportStatus,
  ) -> Result<Import> {
    self
      .with_conn(move |conn| {
        let processed_at = status.is_terminal().then(|| encode_dt(Utc::now()));
        conn.execute(
          "UPDATE imports SET status = ?2, processed_at = COALESCE(?3, processed_at)
           WHERE import_id = ?1",
          rusqlite::params![encode_uuid(import_id), status.as_ref(), processed_at],
        )?;
        load_import(conn, import_id)?.ok_or(Error::ImportNotFound(import_id))
      })
      .await
  }

  // ── Events ────────────────────────────────────────────────────────────────

  async fn drain_events(&self, limit: usize) -> Result<Vec<DomainEvent>> {
    self
      .with_conn(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows: Vec<(i64, RawEvent)> = {
          let mut stmt = tx.prepare(
            "SELECT seq, event_id, kind, payload, recorded_at
             FROM events ORDER BY seq LIMIT ?1",
          )?;
          stmt
            .query_map(rusqlite::params![limit as i64], |row| {
              Ok((row.get(0)?, RawEvent {
                event_id:    row.get(1)?,
                kind:        row.get(2)?,
                payload:     row.get(3)?,
                recorded_at: row.get(4)?,
              }))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        if let Some((last, _)) = rows.last() {
          tx.execute("DELETE FROM events WHERE seq <= ?1", rusqlite::params![last])?;
        }
        let events = rows
          .into_iter()
          .map(|(_, raw)| raw.into_event())
          .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(events)
      })
      .await
  }
}
