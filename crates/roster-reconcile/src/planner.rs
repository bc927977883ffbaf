//! Minimal field-level repairs, one planner per fix category.
//!
//! A planner returns `None` (or nothing) for a record that is already
//! correct; that is what makes repeated fix runs converge.

use roster_core::{fields, FieldValue, MembershipRecord, MirrorRecord, Mutation, Role};

use crate::duplicates::DuplicateSet;

pub fn plan_role(record: &MembershipRecord) -> Option<Mutation> {
    (record.role == Role::Legacy).then(|| {
        Mutation::update(record.member_path())
            .set(
                fields::ROLE,
                FieldValue::Text(Role::LEGACY_REPLACEMENT.as_str().to_string()),
            )
            .touch(fields::UPDATED_AT)
    })
}

/// Fills only the missing timestamps; present values are never replaced.
pub fn plan_timestamps(record: &MembershipRecord) -> Option<Mutation> {
    let mut mutation = Mutation::update(record.member_path());
    if record.created_at.is_none() {
        mutation = mutation.touch(fields::CREATED_AT);
    }
    if record.updated_at.is_none() {
        mutation = mutation.touch(fields::UPDATED_AT);
    }
    (!mutation.is_empty()).then_some(mutation)
}

/// Clears permissions on any non-viewer, freelance included.
pub fn plan_viewer_permissions(record: &MembershipRecord) -> Option<Mutation> {
    (record.role != Role::Viewer && !record.viewer_permissions.is_empty()).then(|| {
        Mutation::update(record.member_path())
            .set(fields::VIEWER_PERMISSIONS, FieldValue::List(Vec::new()))
            .touch(fields::UPDATED_AT)
    })
}

/// Create a missing mirror, or update only the drifted fields of an existing one.
pub fn plan_mirror(record: &MembershipRecord, mirror: Option<&MirrorRecord>) -> Option<Mutation> {
    let path = record.mirror_path()?;
    let role = FieldValue::Text(record.role.as_str().to_string());
    let active = FieldValue::Flag(record.active);

    let Some(mirror) = mirror else {
        return Some(
            Mutation::create(path)
                .set(fields::ROLE, role)
                .set(fields::ACTIVE, active)
                .touch(fields::CREATED_AT)
                .touch(fields::UPDATED_AT),
        );
    };

    let mut mutation = Mutation::update(path);
    if mirror.role != record.role {
        mutation = mutation.set(fields::ROLE, role);
    }
    if mirror.active != Some(record.active) {
        mutation = mutation.set(fields::ACTIVE, active);
    }
    (!mutation.is_empty()).then(|| mutation.touch(fields::UPDATED_AT))
}

/// Deactivate every non-primary member of a duplicate set.
pub fn plan_dedupe<'a>(set: &DuplicateSet<'a>) -> Vec<(&'a MembershipRecord, Mutation)> {
    set.duplicates
        .iter()
        .copied()
        .map(|record| {
            let mutation = Mutation::update(record.member_path())
                .set(fields::ACTIVE, FieldValue::Flag(false))
                .set(fields::DUPLICATE_OF, FieldValue::Text(set.primary.id.clone()))
                .touch(fields::UPDATED_AT);
            (record, mutation)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roster_core::{DocumentPath, RecordTime, WriteKind};

    fn stamped(role: Role) -> MembershipRecord {
        let mut record = MembershipRecord::new("m1", role);
        record.organization_id = Some("org1".into());
        record.created_at = Some(RecordTime::Instant(Utc::now()));
        record.updated_at = Some(RecordTime::Instant(Utc::now()));
        record
    }

    #[test]
    fn legacy_role_maps_to_technician() {
        let mutation = plan_role(&stamped(Role::Legacy)).expect("planned");
        assert_eq!(
            mutation.fields.get(fields::ROLE),
            Some(&FieldValue::Text("technician".into()))
        );
        assert_eq!(
            mutation.fields.get(fields::UPDATED_AT),
            Some(&FieldValue::ServerTimestamp)
        );
        assert!(plan_role(&stamped(Role::Admin)).is_none());
        assert!(plan_role(&stamped(Role::parse("superuser"))).is_none());
    }

    #[test]
    fn timestamps_fill_only_what_is_missing() {
        let mut record = stamped(Role::Admin);
        assert!(plan_timestamps(&record).is_none());

        record.created_at = None;
        let mutation = plan_timestamps(&record).expect("planned");
        assert_eq!(mutation.fields.len(), 1);
        assert!(mutation.fields.contains_key(fields::CREATED_AT));

        record.updated_at = Some(RecordTime::Opaque("garbled".into()));
        assert!(!plan_timestamps(&record)
            .expect("planned")
            .fields
            .contains_key(fields::UPDATED_AT));
    }

    #[test]
    fn viewer_permissions_are_cleared_on_non_viewers_only() {
        let mut freelance = stamped(Role::Freelance);
        freelance.viewer_permissions = vec!["reports".into()];
        let mutation = plan_viewer_permissions(&freelance).expect("planned");
        assert_eq!(
            mutation.fields.get(fields::VIEWER_PERMISSIONS),
            Some(&FieldValue::List(vec![]))
        );

        let mut viewer = stamped(Role::Viewer);
        viewer.viewer_permissions = vec!["reports".into()];
        assert!(plan_viewer_permissions(&viewer).is_none());
        assert!(plan_viewer_permissions(&stamped(Role::Admin)).is_none());
    }

    #[test]
    fn mirror_plans_create_update_or_nothing() {
        let mut record = stamped(Role::Admin);
        assert!(plan_mirror(&record, None).is_none(), "no account, no mirror");

        record.user_id = Some("u1".into());
        let create = plan_mirror(&record, None).expect("create");
        assert_eq!(create.kind, WriteKind::Create);
        assert_eq!(
            create.path,
            DocumentPath::Mirror {
                organization_id: "org1".into(),
                user_id: "u1".into()
            }
        );
        assert_eq!(create.fields.len(), 4);

        let stale = MirrorRecord {
            role: Role::Admin,
            active: Some(false),
            created_at: None,
            updated_at: None,
        };
        let update = plan_mirror(&record, Some(&stale)).expect("update");
        assert_eq!(update.kind, WriteKind::Update);
        assert!(update.fields.contains_key(fields::ACTIVE));
        assert!(!update.fields.contains_key(fields::ROLE));

        let current = MirrorRecord {
            active: Some(true),
            ..stale
        };
        assert!(plan_mirror(&record, Some(&current)).is_none());
    }
}
