#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use roster_core::{MembershipRecord, MirrorRecord, RecordTime, Role};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

/// A record with every field populated and nothing to repair.
pub fn member(id: &str, org: &str, email: &str, role: &str) -> MembershipRecord {
    let mut record = MembershipRecord::new(id, Role::parse(role));
    record.organization_id = Some(org.into());
    record.email = Some(email.into());
    record.created_at = Some(RecordTime::Instant(at(0)));
    record.updated_at = Some(RecordTime::Instant(at(0)));
    record
}

pub fn linked(id: &str, org: &str, user: &str, role: &str) -> MembershipRecord {
    let mut record = member(id, org, &format!("{user}@example.com"), role);
    record.user_id = Some(user.into());
    record
}

pub fn mirror_of(record: &MembershipRecord) -> MirrorRecord {
    MirrorRecord {
        role: record.role.clone(),
        active: Some(record.active),
        created_at: record.created_at.clone(),
        updated_at: record.updated_at.clone(),
    }
}

/// One of everything the engine knows how to repair.
pub fn messy_roster() -> Vec<MembershipRecord> {
    let mut legacy = linked("m01", "org1", "u1", "member");
    legacy.updated_at = None;

    let mut unstamped = linked("m02", "org1", "u2", "admin");
    unstamped.created_at = None;
    unstamped.updated_at = None;

    let mut freelance = member("m03", "org1", "free@x.com", "freelance");
    freelance.viewer_permissions = vec!["reports".into(), "billing".into()];

    let mut viewer = linked("m04", "org2", "u4", "viewer");
    viewer.viewer_permissions = vec!["reports".into()];

    let mut first = linked("m05", "org2", "u5", "technician");
    first.email = Some("A@X.com".into());
    first.created_at = Some(RecordTime::Instant(at(10)));
    let mut second = linked("m06", "org2", "u6", "technician");
    second.email = Some(" a@x.com".into());
    second.created_at = Some(RecordTime::Instant(at(20)));
    let mut third = linked("m07", "org2", "u7", "owner");
    third.email = Some("a@X.COM".into());
    third.created_at = None;

    let odd = linked("m08", "org3", "u8", "superuser");
    let mut orphan = member("m09", "", "orphan@x.com", "admin");
    orphan.organization_id = None;

    vec![legacy, unstamped, freelance, viewer, first, second, third, odd, orphan]
}
