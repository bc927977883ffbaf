//! Mirror consistency checks against the authorization-layer copies.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use roster_core::{DocumentPath, MembershipRecord, MirrorRecord, Role};
use roster_storage::{RecordStore, StoreError};
use tracing::{debug, warn};

use crate::classify::AnomalyKind;
use crate::RecordOutcome;

/// One mirror document and the record it must agree with.
#[derive(Debug, Clone)]
pub struct MirrorTarget<'a> {
    pub organization_id: &'a str,
    pub user_id: &'a str,
    /// The record whose role/active the mirror must match.
    pub representative: &'a MembershipRecord,
    /// How many records point at this mirror.
    pub sharing: usize,
}

impl MirrorTarget<'_> {
    pub fn path(&self) -> DocumentPath {
        DocumentPath::Mirror {
            organization_id: self.organization_id.to_string(),
            user_id: self.user_id.to_string(),
        }
    }

    pub fn subject(&self) -> String {
        let mut subject = format!(
            "organizations/{}/members/{} (from {})",
            self.organization_id, self.user_id, self.representative.id
        );
        if self.sharing > 1 {
            subject.push_str(&format!(", shared by {} records", self.sharing));
        }
        subject
    }
}

/// Active records beat inactive ones; otherwise duplicate-resolution order.
fn outranks(candidate: &MembershipRecord, current: &MembershipRecord) -> bool {
    match (candidate.active, current.active) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.resolution_cmp(current).is_lt(),
    }
}

/// Distinct (organization, account) pairs in first-seen record order.
pub fn mirror_targets(records: &[MembershipRecord]) -> Vec<MirrorTarget<'_>> {
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut targets: Vec<MirrorTarget<'_>> = Vec::new();

    for record in records {
        let (Some(organization_id), Some(user_id)) = (record.organization(), record.account()) else {
            continue;
        };
        match index.entry((organization_id, user_id)) {
            Entry::Occupied(slot) => {
                let target = &mut targets[*slot.get()];
                target.sharing += 1;
                if outranks(record, target.representative) {
                    target.representative = record;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(targets.len());
                targets.push(MirrorTarget {
                    organization_id,
                    user_id,
                    representative: record,
                    sharing: 1,
                });
            }
        }
    }
    targets
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorDrift {
    Missing { intended_role: Role },
    RoleMismatch { expected: Role, found: Role },
    ActiveMismatch { expected: bool, found: Option<bool> },
}

impl MirrorDrift {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Self::Missing { .. } => AnomalyKind::MirrorMissing,
            Self::RoleMismatch { .. } => AnomalyKind::MirrorRoleMismatch,
            Self::ActiveMismatch { .. } => AnomalyKind::MirrorActiveMismatch,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Missing { intended_role } => format!("no mirror; should carry role {intended_role}"),
            Self::RoleMismatch { expected, found } => {
                format!("mirror role {found}, record role {expected}")
            }
            Self::ActiveMismatch { expected, found } => match found {
                Some(found) => format!("mirror active={found}, record active={expected}"),
                None => format!("mirror has no active flag, record active={expected}"),
            },
        }
    }
}

pub fn compare(record: &MembershipRecord, mirror: Option<&MirrorRecord>) -> Vec<MirrorDrift> {
    let Some(mirror) = mirror else {
        return vec![MirrorDrift::Missing {
            intended_role: record.role.clone(),
        }];
    };
    let mut drift = Vec::new();
    if mirror.role != record.role {
        drift.push(MirrorDrift::RoleMismatch {
            expected: record.role.clone(),
            found: mirror.role.clone(),
        });
    }
    if mirror.active != Some(record.active) {
        drift.push(MirrorDrift::ActiveMismatch {
            expected: record.active,
            found: mirror.active,
        });
    }
    drift
}

pub async fn lookup(
    store: &dyn RecordStore,
    target: &MirrorTarget<'_>,
) -> RecordOutcome<Option<MirrorRecord>> {
    store
        .get_mirror(target.organization_id, target.user_id)
        .await
        .into()
}

#[derive(Debug, Clone)]
pub struct MirrorObservation<'a> {
    pub target: MirrorTarget<'a>,
    /// `Err` carries the lookup failure detail.
    pub lookup: Result<Option<MirrorRecord>, String>,
}

impl MirrorObservation<'_> {
    pub fn drift(&self) -> Vec<MirrorDrift> {
        match &self.lookup {
            Ok(mirror) => compare(self.target.representative, mirror.as_ref()),
            Err(_) => Vec::new(),
        }
    }
}

/// Look up every mirror, one at a time, in record order. Only fatal store
/// errors abort.
pub async fn observe_mirrors<'a>(
    store: &dyn RecordStore,
    records: &'a [MembershipRecord],
) -> Result<Vec<MirrorObservation<'a>>, StoreError> {
    let targets = mirror_targets(records);
    debug!(targets = targets.len(), "checking mirrors");
    let mut observations = Vec::with_capacity(targets.len());
    for target in targets {
        let result = match lookup(store, &target).await {
            RecordOutcome::Success(mirror) => Ok(mirror),
            RecordOutcome::Recoverable(detail) => {
                warn!(subject = %target.subject(), %detail, "mirror lookup failed");
                Err(detail)
            }
            RecordOutcome::Fatal(err) => return Err(err),
        };
        observations.push(MirrorObservation {
            target,
            lookup: result,
        });
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use roster_core::RecordTime;

    fn linked(id: &str, user: &str, role: Role, created: i64) -> MembershipRecord {
        let mut record = MembershipRecord::new(id, role);
        record.organization_id = Some("org1".into());
        record.user_id = Some(user.into());
        record.created_at = Some(RecordTime::Instant(
            Utc.timestamp_opt(created, 0).single().unwrap(),
        ));
        record
    }

    #[test]
    fn unlinked_records_have_no_mirror_target() {
        let mut unlinked = MembershipRecord::new("m1", Role::Admin);
        unlinked.organization_id = Some("org1".into());
        let mut orphan = MembershipRecord::new("m2", Role::Admin);
        orphan.user_id = Some("u1".into());
        assert!(mirror_targets(&[unlinked, orphan]).is_empty());
    }

    #[test]
    fn shared_mirrors_follow_the_active_earliest_record() {
        let mut retired = linked("a", "u1", Role::Admin, 1);
        retired.active = false;
        let records = vec![
            retired,
            linked("c", "u1", Role::Viewer, 30),
            linked("b", "u1", Role::Technician, 20),
            linked("d", "u2", Role::Owner, 5),
        ];
        let targets = mirror_targets(&records);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].user_id, "u1");
        assert_eq!(targets[0].representative.id, "b");
        assert_eq!(targets[0].sharing, 3);
        assert_eq!(targets[1].representative.id, "d");
    }

    #[test]
    fn compare_reports_role_and_active_drift() {
        let record = linked("a", "u1", Role::Admin, 1);
        assert_eq!(
            compare(&record, None),
            vec![MirrorDrift::Missing {
                intended_role: Role::Admin
            }]
        );

        let mirror = MirrorRecord {
            role: Role::Viewer,
            active: None,
            created_at: None,
            updated_at: None,
        };
        let drift = compare(&record, Some(&mirror));
        assert_eq!(
            drift.iter().map(MirrorDrift::kind).collect::<Vec<_>>(),
            vec![AnomalyKind::MirrorRoleMismatch, AnomalyKind::MirrorActiveMismatch]
        );

        let in_sync = MirrorRecord {
            role: Role::Admin,
            active: Some(true),
            ..mirror
        };
        assert!(compare(&record, Some(&in_sync)).is_empty());
    }
}
