//! The single-transaction merge and the aggregate loader it is built on.

use roster_core::{
  event::{DomainEvent, EventKind},
  merge::{
    Collapse, EntityKind, GuardianLink, MergePlan, MergeReport, Membership,
    PatientAggregate, Reassignment,
  },
};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{decode_uuid, encode_dt, encode_uuid},
  store::{insert_event, load_patient},
};

// ─── Loading ─────────────────────────────────────────────────────────────────

fn ids(conn: &Connection, sql: &str, owner: Uuid) -> Result<Vec<Uuid>> {
  let mut stmt = conn.prepare(sql)?;
  let raws = stmt
    .query_map(rusqlite::params![encode_uuid(owner)], |r| r.get::<_, String>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.iter().map(|s| decode_uuid(s)).collect()
}

pub(crate) fn load_aggregate(
  conn: &Connection,
  patient_id: Uuid,
) -> Result<Option<PatientAggregate>> {
  let Some(patient) = load_patient(conn, patient_id)? else {
    return Ok(None);
  };
  let mut aggregate = PatientAggregate::new(patient);

  let memberships: Vec<(String, String, i32)> = {
    let mut stmt = conn.prepare(
      "SELECT membership_id, group_id, period FROM group_memberships
       WHERE patient_id = ?1 ORDER BY rowid",
    )?;
    stmt
      .query_map(rusqlite::params![encode_uuid(patient_id)], |r| {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  for (membership_id, group_id, period) in memberships {
    let membership_id = decode_uuid(&membership_id)?;
    aggregate.memberships.push(Membership {
      membership_id,
      group_id: decode_uuid(&group_id)?,
      period,
      decisions: ids(
        conn,
        "SELECT decision_id FROM membership_decisions
         WHERE membership_id = ?1 ORDER BY rowid",
        membership_id,
      )?,
    });
  }

  aggregate.consents = ids(
    conn,
    "SELECT consent_id FROM consents WHERE patient_id = ?1 ORDER BY rowid",
    patient_id,
  )?;
  aggregate.triages = ids(
    conn,
    "SELECT triage_id FROM triages WHERE patient_id = ?1 ORDER BY rowid",
    patient_id,
  )?;
  aggregate.vaccination_records = ids(
    conn,
    "SELECT record_id FROM vaccination_records WHERE patient_id = ?1 ORDER BY rowid",
    patient_id,
  )?;
  aggregate.imports = ids(
    conn,
    "SELECT import_id FROM import_patients WHERE patient_id = ?1",
    patient_id,
  )?;
  aggregate.changesets = ids(
    conn,
    "SELECT changeset_id FROM changesets WHERE patient_id = ?1",
    patient_id,
  )?;
  aggregate.search_results = ids(
    conn,
    "SELECT result_id FROM search_results WHERE patient_id = ?1 ORDER BY rowid",
    patient_id,
  )?;

  let guardians: Vec<(String, String)> = {
    let mut stmt = conn.prepare(
      "SELECT relationship_id, guardian_id FROM guardian_relationships
       WHERE patient_id = ?1 ORDER BY rowid",
    )?;
    stmt
      .query_map(rusqlite::params![encode_uuid(patient_id)], |r| {
        Ok((r.get(0)?, r.get(1)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  for (relationship_id, guardian_id) in guardians {
    aggregate.guardians.push(GuardianLink {
      relationship_id: decode_uuid(&relationship_id)?,
      guardian_id:     decode_uuid(&guardian_id)?,
    });
  }

  Ok(Some(aggregate))
}

// ─── Applying a plan ─────────────────────────────────────────────────────────

/// `UPDATE` for one reassignment. Parameters: `?1` new parent, `?2` row id,
/// `?3` casualty. Every statement is scoped to the casualty so a row that
/// changed owner since the plan was computed is caught.
fn reassign_sql(kind: EntityKind) -> &'static str {
  match kind {
    EntityKind::GroupMembership => {
      "UPDATE group_memberships SET patient_id = ?1
       WHERE membership_id = ?2 AND patient_id = ?3"
    }
    EntityKind::MembershipDecision => {
      "UPDATE membership_decisions SET membership_id = ?1
       WHERE decision_id = ?2 AND membership_id IN (
         SELECT membership_id FROM group_memberships WHERE patient_id = ?3
       )"
    }
    EntityKind::Consent => {
      "UPDATE consents SET patient_id = ?1 WHERE consent_id = ?2 AND patient_id = ?3"
    }
    EntityKind::Triage => {
      "UPDATE triages SET patient_id = ?1 WHERE triage_id = ?2 AND patient_id = ?3"
    }
    EntityKind::VaccinationRecord => {
      "UPDATE vaccination_records SET patient_id = ?1
       WHERE record_id = ?2 AND patient_id = ?3"
    }
    EntityKind::GuardianRelationship => {
      "UPDATE guardian_relationships SET patient_id = ?1
       WHERE relationship_id = ?2 AND patient_id = ?3"
    }
    EntityKind::ImportLink => {
      "UPDATE import_patients SET patient_id = ?1
       WHERE import_id = ?2 AND patient_id = ?3"
    }
    EntityKind::Changeset => {
      "UPDATE changesets SET patient_id = ?1
       WHERE changeset_id = ?2 AND patient_id = ?3"
    }
    EntityKind::SearchResult => {
      "UPDATE search_results SET patient_id = ?1
       WHERE result_id = ?2 AND patient_id = ?3"
    }
  }
}

/// `DELETE` for one collapse. Parameters: `?1` row id, `?2` casualty.
fn collapse_sql(kind: EntityKind) -> Option<&'static str> {
  match kind {
    EntityKind::GroupMembership => Some(
      "DELETE FROM group_memberships WHERE membership_id = ?1 AND patient_id = ?2",
    ),
    EntityKind::GuardianRelationship => Some(
      "DELETE FROM guardian_relationships
       WHERE relationship_id = ?1 AND patient_id = ?2",
    ),
    EntityKind::ImportLink => {
      Some("DELETE FROM import_patients WHERE import_id = ?1 AND patient_id = ?2")
    }
    _ => None,
  }
}

fn apply_reassignment(conn: &Connection, casualty: Uuid, r: &Reassignment) -> Result<()> {
  let changed = conn.execute(
    reassign_sql(r.entity),
    rusqlite::params![
      encode_uuid(r.new_parent),
      encode_uuid(r.id),
      encode_uuid(casualty)
    ],
  )?;
  if changed != 1 {
    return Err(Error::MergeConflict(format!(
      "{} {} changed owner during merge",
      r.entity, r.id
    )));
  }
  Ok(())
}

fn apply_collapse(conn: &Connection, casualty: Uuid, c: &Collapse) -> Result<()> {
  let sql = collapse_sql(c.entity).ok_or_else(|| {
    Error::MergeConflict(format!("{} rows cannot be collapsed", c.entity))
  })?;
  let changed =
    conn.execute(sql, rusqlite::params![encode_uuid(c.id), encode_uuid(casualty)])?;
  if changed != 1 {
    return Err(Error::MergeConflict(format!(
      "{} {} changed owner during merge",
      c.entity, c.id
    )));
  }
  Ok(())
}

/// Fold `casualty` into `survivor` inside one immediate transaction.
///
/// Any error drops the transaction before commit, which rolls every
/// statement back; both patients are then exactly as they were.
pub(crate) fn merge_patients(
  conn: &mut Connection,
  survivor: Uuid,
  casualty: Uuid,
) -> Result<MergeReport> {
  if survivor == casualty {
    return Err(roster_core::Error::SelfMerge(survivor).into());
  }

  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let survivor_agg =
    load_aggregate(&tx, survivor)?.ok_or(Error::PatientNotFound(survivor))?;
  let casualty_agg =
    load_aggregate(&tx, casualty)?.ok_or(Error::PatientNotFound(casualty))?;
  let plan = MergePlan::compute(&survivor_agg, &casualty_agg)?;
  debug!(
    %survivor,
    %casualty,
    reassignments = plan.reassignments.len(),
    collapses = plan.collapses.len(),
    "applying merge plan"
  );

  for reassignment in &plan.reassignments {
    apply_reassignment(&tx, casualty, reassignment)?;
  }
  for collapse in &plan.collapses {
    apply_collapse(&tx, casualty, collapse)?;
  }

  // A survivor without an identifier inherits the casualty's.
  let inherited = match (
    &survivor_agg.patient.registry_id,
    &casualty_agg.patient.registry_id,
  ) {
    (None, Some(id)) => Some(id.clone()),
    _ => None,
  };

  tx.execute(
    "DELETE FROM patients WHERE patient_id = ?1",
    rusqlite::params![encode_uuid(casualty)],
  )?;

  if let Some(id) = &inherited {
    tx.execute(
      "UPDATE patients SET registry_id = ?2, updated_at = ?3 WHERE patient_id = ?1",
      rusqlite::params![
        encode_uuid(survivor),
        id.as_str(),
        encode_dt(chrono::Utc::now())
      ],
    )?;
  }

  let report = plan.report();
  insert_event(
    &tx,
    &DomainEvent::new(EventKind::PatientMerged, serde_json::to_value(&report)?),
  )?;
  tx.commit()?;

  info!(%survivor, %casualty, inherited = ?inherited, "patients merged");
  Ok(report)
}
