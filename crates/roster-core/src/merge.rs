//! Merge planning: folding a casualty patient into a survivor.
//!
//! [`MergePlan::compute`] is pure. Store backends load both
//! [`PatientAggregate`]s inside their merge transaction, compute the plan,
//! apply every reassignment and collapse, and finally delete the casualty.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator as _};
use uuid::Uuid;

use crate::{Error, Result, patient::Patient};

// ─── Dependent entities ──────────────────────────────────────────────────────

/// Every kind of row owned by a patient.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
  /// Unique per patient, group and period.
  GroupMembership,
  /// Child rows of a membership (assessments, pre-screenings).
  MembershipDecision,
  Consent,
  Triage,
  VaccinationRecord,
  /// Unique per patient and guardian.
  GuardianRelationship,
  /// Unique per patient and import.
  ImportLink,
  Changeset,
  SearchResult,
}

/// A group membership and the ids of the decisions recorded against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
  pub membership_id: Uuid,
  pub group_id:      Uuid,
  pub period:        i32,
  pub decisions:     Vec<Uuid>,
}

impl Membership {
  fn key(&self) -> (Uuid, i32) { (self.group_id, self.period) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianLink {
  pub relationship_id: Uuid,
  pub guardian_id:     Uuid,
}

/// A patient together with the ids of every row it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientAggregate {
  pub patient:             Patient,
  pub memberships:         Vec<Membership>,
  pub consents:            Vec<Uuid>,
  pub triages:             Vec<Uuid>,
  pub vaccination_records: Vec<Uuid>,
  pub guardians:           Vec<GuardianLink>,
  /// Ids of the imports this patient is linked to.
  pub imports:             Vec<Uuid>,
  pub changesets:          Vec<Uuid>,
  pub search_results:      Vec<Uuid>,
}

impl PatientAggregate {
  pub fn new(patient: Patient) -> Self {
    Self {
      patient,
      memberships: Vec::new(),
      consents: Vec::new(),
      triages: Vec::new(),
      vaccination_records: Vec::new(),
      guardians: Vec::new(),
      imports: Vec::new(),
      changesets: Vec::new(),
      search_results: Vec::new(),
    }
  }

  pub fn patient_id(&self) -> Uuid { self.patient.patient_id }

  pub fn count(&self, kind: EntityKind) -> usize {
    match kind {
      EntityKind::GroupMembership => self.memberships.len(),
      EntityKind::MembershipDecision => {
        self.memberships.iter().map(|m| m.decisions.len()).sum()
      }
      EntityKind::Consent => self.consents.len(),
      EntityKind::Triage => self.triages.len(),
      EntityKind::VaccinationRecord => self.vaccination_records.len(),
      EntityKind::GuardianRelationship => self.guardians.len(),
      EntityKind::ImportLink => self.imports.len(),
      EntityKind::Changeset => self.changesets.len(),
      EntityKind::SearchResult => self.search_results.len(),
    }
  }

  /// Row counts for every entity kind.
  pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
    EntityKind::iter().map(|kind| (kind, self.count(kind))).collect()
  }
}

// ─── Plan ────────────────────────────────────────────────────────────────────

/// Move a row to a new parent. The parent is the survivor patient for
/// patient-owned rows, or the survivor's membership for membership
/// decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
  pub entity:     EntityKind,
  pub id:         Uuid,
  pub new_parent: Uuid,
}

/// Drop a casualty row because the survivor already has its equivalent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collapse {
  pub entity: EntityKind,
  pub id:     Uuid,
  /// The survivor row it duplicates.
  pub into:   Uuid,
}

#[derive(Debug, Clone)]
pub struct MergePlan {
  pub survivor:      Uuid,
  pub casualty:      Uuid,
  /// Applied before `collapses`, so children of a collapsed row have
  /// already moved by the time it is dropped.
  pub reassignments: Vec<Reassignment>,
  pub collapses:     Vec<Collapse>,
}

impl MergePlan {
  pub fn compute(
    survivor: &PatientAggregate,
    casualty: &PatientAggregate,
  ) -> Result<Self> {
    let survivor_id = survivor.patient_id();
    let casualty_id = casualty.patient_id();
    if survivor_id == casualty_id {
      return Err(Error::SelfMerge(survivor_id));
    }

    let mut plan = Self {
      survivor:      survivor_id,
      casualty:      casualty_id,
      reassignments: Vec::new(),
      collapses:     Vec::new(),
    };

    let existing: HashMap<(Uuid, i32), Uuid> = survivor
      .memberships
      .iter()
      .map(|m| (m.key(), m.membership_id))
      .collect();
    for membership in &casualty.memberships {
      match existing.get(&membership.key()) {
        Some(&target) => {
          for &decision in &membership.decisions {
            plan.reassign(EntityKind::MembershipDecision, decision, target);
          }
          plan.collapses.push(Collapse {
            entity: EntityKind::GroupMembership,
            id:     membership.membership_id,
            into:   target,
          });
        }
        None => plan.reassign(
          EntityKind::GroupMembership,
          membership.membership_id,
          survivor_id,
        ),
      }
    }

    for (kind, ids) in [
      (EntityKind::Consent, &casualty.consents),
      (EntityKind::Triage, &casualty.triages),
      (EntityKind::VaccinationRecord, &casualty.vaccination_records),
      (EntityKind::Changeset, &casualty.changesets),
      (EntityKind::SearchResult, &casualty.search_results),
    ] {
      for &id in ids {
        plan.reassign(kind, id, survivor_id);
      }
    }

    let guardians: HashMap<Uuid, Uuid> = survivor
      .guardians
      .iter()
      .map(|g| (g.guardian_id, g.relationship_id))
      .collect();
    for link in &casualty.guardians {
      match guardians.get(&link.guardian_id) {
        Some(&into) => plan.collapses.push(Collapse {
          entity: EntityKind::GuardianRelationship,
          id: link.relationship_id,
          into,
        }),
        None => plan.reassign(
          EntityKind::GuardianRelationship,
          link.relationship_id,
          survivor_id,
        ),
      }
    }

    // Import links are keyed by the import itself.
    for &import_id in &casualty.imports {
      if survivor.imports.contains(&import_id) {
        plan.collapses.push(Collapse {
          entity: EntityKind::ImportLink,
          id:     import_id,
          into:   import_id,
        });
      } else {
        plan.reassign(EntityKind::ImportLink, import_id, survivor_id);
      }
    }

    Ok(plan)
  }

  fn reassign(&mut self, entity: EntityKind, id: Uuid, new_parent: Uuid) {
    self.reassignments.push(Reassignment { entity, id, new_parent });
  }

  pub fn report(&self) -> MergeReport {
    let mut moved = BTreeMap::new();
    for r in &self.reassignments {
      *moved.entry(r.entity).or_default() += 1;
    }
    let mut collapsed = BTreeMap::new();
    for c in &self.collapses {
      *collapsed.entry(c.entity).or_default() += 1;
    }
    MergeReport {
      survivor: self.survivor,
      casualty: self.casualty,
      moved,
      collapsed,
    }
  }
}

/// Summary of a committed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
  pub survivor:  Uuid,
  pub casualty:  Uuid,
  pub moved:     BTreeMap<EntityKind, usize>,
  pub collapsed: BTreeMap<EntityKind, usize>,
}

impl MergeReport {
  pub fn moved(&self, kind: EntityKind) -> usize {
    self.moved.get(&kind).copied().unwrap_or(0)
  }

  pub fn collapsed(&self, kind: EntityKind) -> usize {
    self.collapsed.get(&kind).copied().unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use chrono::{NaiveDate, Utc};

  use super::*;
  use crate::patient::Demographics;

  fn aggregate() -> PatientAggregate {
    let now = Utc::now();
    PatientAggregate::new(Patient {
      patient_id:     Uuid::new_v4(),
      registry_id:    None,
      demographics:   Demographics {
        given_name:    "Jo".into(),
        family_name:   "Smith".into(),
        date_of_birth: NaiveDate::from_ymd_opt(2010, 5, 1).unwrap(),
        postcode:      Some("AB1 2CD".into()),
      },
      invalidated_at: None,
      created_at:     now,
      updated_at:     now,
    })
  }

  fn membership(group_id: Uuid, decisions: usize) -> Membership {
    Membership {
      membership_id: Uuid::new_v4(),
      group_id,
      period: 2025,
      decisions: (0..decisions).map(|_| Uuid::new_v4()).collect(),
    }
  }

  #[test]
  fn colliding_membership_moves_decisions_and_collapses() {
    let g1 = Uuid::new_v4();
    let g2 = Uuid::new_v4();

    let mut survivor = aggregate();
    survivor.memberships.push(membership(g1, 1));
    let survivor_g1 = survivor.memberships[0].membership_id;

    let mut casualty = aggregate();
    casualty.memberships.push(membership(g1, 2));
    casualty.memberships.push(membership(g2, 0));
    let casualty_g1 = casualty.memberships[0].clone();
    let casualty_g2 = casualty.memberships[1].membership_id;

    let plan = MergePlan::compute(&survivor, &casualty).unwrap();

    for decision in &casualty_g1.decisions {
      assert!(plan.reassignments.contains(&Reassignment {
        entity:     EntityKind::MembershipDecision,
        id:         *decision,
        new_parent: survivor_g1,
      }));
    }
    assert!(plan.reassignments.contains(&Reassignment {
      entity:     EntityKind::GroupMembership,
      id:         casualty_g2,
      new_parent: survivor.patient_id(),
    }));
    assert_eq!(plan.collapses, vec![Collapse {
      entity: EntityKind::GroupMembership,
      id:     casualty_g1.membership_id,
      into:   survivor_g1,
    }]);
  }

  #[test]
  fn report_satisfies_completeness() {
    let shared_import = Uuid::new_v4();
    let shared_guardian = Uuid::new_v4();

    let mut survivor = aggregate();
    survivor.consents.push(Uuid::new_v4());
    survivor.imports.push(shared_import);
    survivor.guardians.push(GuardianLink {
      relationship_id: Uuid::new_v4(),
      guardian_id:     shared_guardian,
    });

    let mut casualty = aggregate();
    casualty.consents.extend([Uuid::new_v4(), Uuid::new_v4()]);
    casualty.triages.push(Uuid::new_v4());
    casualty.vaccination_records.push(Uuid::new_v4());
    casualty.imports.extend([shared_import, Uuid::new_v4()]);
    casualty.guardians.extend([
      GuardianLink {
        relationship_id: Uuid::new_v4(),
        guardian_id:     shared_guardian,
      },
      GuardianLink {
        relationship_id: Uuid::new_v4(),
        guardian_id:     Uuid::new_v4(),
      },
    ]);
    casualty.search_results.push(Uuid::new_v4());

    let report = MergePlan::compute(&survivor, &casualty).unwrap().report();

    for kind in EntityKind::iter() {
      assert_eq!(
        report.moved(kind) + report.collapsed(kind),
        casualty.count(kind),
        "{kind}"
      );
    }
    assert_eq!(report.moved(EntityKind::Consent), 2);
    assert_eq!(report.collapsed(EntityKind::ImportLink), 1);
    assert_eq!(report.moved(EntityKind::ImportLink), 1);
    assert_eq!(report.collapsed(EntityKind::GuardianRelationship), 1);
  }

  #[test]
  fn refuses_self_merge() {
    let patient = aggregate();
    let err = MergePlan::compute(&patient, &patient).unwrap_err();
    assert!(matches!(err, Error::SelfMerge(_)));
  }
}
