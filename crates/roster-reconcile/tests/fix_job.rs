mod common;

use common::{at, linked, member, messy_roster, mirror_of};
use roster_core::{DocumentPath, MembershipRecord, RecordTime, Role};
use roster_reconcile::{run_audit, run_fix, AnomalyKind, AuditOptions, FixCategory, FixOptions, RunMode};
use roster_storage::MemoryStore;

fn apply(categories: impl IntoIterator<Item = FixCategory>) -> FixOptions {
    FixOptions::new(RunMode::Apply, categories)
}

async fn frozen(records: impl IntoIterator<Item = MembershipRecord>) -> MemoryStore {
    let store = MemoryStore::with_members(records);
    store.freeze_clock(at(100)).await;
    store
}

#[tokio::test]
async fn legacy_role_becomes_technician() {
    let store = frozen([member("m1", "org1", "a@x.com", "member")]).await;
    let report = run_fix(&store, &apply([FixCategory::Roles])).await.expect("fix");

    let fixed = store.member("m1").await.expect("m1");
    assert_eq!(fixed.role, Role::Technician);
    assert_eq!(fixed.updated_at.and_then(|t| t.instant()), Some(at(100)));
    assert_eq!(report.applied(), 1);
}

#[tokio::test]
async fn later_duplicate_is_deactivated() {
    let mut first = member("t1", "org1", "A@X.com", "technician");
    first.created_at = Some(RecordTime::Instant(at(1)));
    let mut second = member("t2", "org1", "a@x.com", "technician");
    second.created_at = Some(RecordTime::Instant(at(2)));
    let store = frozen([second, first]).await;

    run_fix(&store, &apply([FixCategory::DedupeEmails])).await.expect("fix");

    let kept = store.member("t1").await.expect("t1");
    assert!(kept.active);
    assert_eq!(kept.duplicate_of, None);
    let retired = store.member("t2").await.expect("t2");
    assert!(!retired.active);
    assert_eq!(retired.duplicate_of.as_deref(), Some("t1"));
}

#[tokio::test]
async fn reinvited_member_keeps_access() {
    let mut old = member("old", "org1", "a@x.com", "technician");
    old.active = false;
    old.created_at = Some(RecordTime::Instant(at(1)));
    let mut new = member("new", "org1", "A@x.com", "technician");
    new.created_at = Some(RecordTime::Instant(at(50)));
    let store = frozen([old, new]).await;

    let report = run_fix(&store, &apply([FixCategory::DedupeEmails])).await.expect("fix");
    assert_eq!(report.planned(), 0);
    let kept = store.member("new").await.expect("new");
    assert!(kept.active);
    assert_eq!(kept.duplicate_of, None);

    let audit = run_audit(&store, &AuditOptions::default()).await.expect("audit");
    assert_eq!(audit.count(AnomalyKind::DuplicateEmail), 0);
}

#[tokio::test]
async fn missing_mirror_is_created() {
    let store = frozen([linked("m1", "org1", "u1", "admin")]).await;
    run_fix(&store, &apply([FixCategory::Mirrors])).await.expect("fix");

    let mirror = store.mirror("org1", "u1").await.expect("mirror created");
    assert_eq!(mirror.role, Role::Admin);
    assert_eq!(mirror.active, Some(true));
    assert_eq!(mirror.created_at.and_then(|t| t.instant()), Some(at(100)));
}

#[tokio::test]
async fn freelance_permissions_are_cleared() {
    let mut freelance = member("m1", "org1", "f@x.com", "freelance");
    freelance.viewer_permissions = vec!["reports".into()];
    let store = frozen([freelance]).await;

    run_fix(&store, &apply([FixCategory::ViewerPermissions])).await.expect("fix");
    assert!(store.member("m1").await.expect("m1").viewer_permissions.is_empty());
}

#[tokio::test]
async fn full_fix_converges_in_one_pass() {
    let store = frozen(messy_roster()).await;
    let first = run_fix(&store, &apply(FixCategory::ALL)).await.expect("first fix");

    let planned: Vec<_> = FixCategory::ALL
        .iter()
        .map(|c| first.tally(*c).map_or(0, |t| t.planned))
        .collect();
    assert_eq!(planned, vec![1, 2, 1, 2, 7]);
    assert_eq!(first.errors(), 0);
    assert_eq!(first.applied(), 13);

    // Mirrors pick up the flags dedupe just cleared.
    assert_eq!(store.mirror("org2", "u6").await.expect("u6").active, Some(false));
    assert_eq!(store.mirror("org2", "u7").await.expect("u7").active, Some(false));
    assert_eq!(store.mirror("org2", "u5").await.expect("u5").active, Some(true));

    let second = run_fix(&store, &apply(FixCategory::ALL)).await.expect("second fix");
    assert_eq!(second.planned(), 0);

    let audit = run_audit(&store, &AuditOptions::default()).await.expect("audit");
    for kind in [
        AnomalyKind::LegacyRole,
        AnomalyKind::MissingCreatedAt,
        AnomalyKind::MissingUpdatedAt,
        AnomalyKind::ViewerPermissionsOnNonViewer,
        AnomalyKind::FreelanceWithPermissions,
        AnomalyKind::MirrorMissing,
        AnomalyKind::MirrorRoleMismatch,
        AnomalyKind::MirrorActiveMismatch,
    ] {
        assert_eq!(audit.count(kind), 0, "{kind} after fix");
    }
    // Left for manual review.
    assert_eq!(audit.count(AnomalyKind::InvalidRole), 1);
    assert_eq!(audit.count(AnomalyKind::MissingOrganization), 1);
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
    let store = frozen(messy_roster()).await;
    let before = store.members().await;

    let report = run_fix(&store, &FixOptions::new(RunMode::DryRun, FixCategory::ALL))
        .await
        .expect("dry run");

    assert_eq!(report.planned(), 13);
    assert_eq!(report.applied(), 0);
    assert_eq!(store.members().await, before);
    assert_eq!(store.mirror_count().await, 0);
    assert!(store.commit_sizes().await.is_empty());
    let roles = report.tally(FixCategory::Roles).expect("roles");
    assert!(roles.lines[0].starts_with("would fix m01"));
    assert!(report.render().contains("nothing written"));
}

#[tokio::test]
async fn writes_are_batched_under_the_ceiling() {
    let store = frozen((0..7).map(|i| member(&format!("m{i}"), "org1", &format!("{i}@x.com"), "member"))).await;
    let mut options = apply([FixCategory::Roles]);
    options.batch_ceiling = 3;

    let report = run_fix(&store, &options).await.expect("fix");
    assert_eq!(store.commit_sizes().await, vec![3, 3, 1]);
    assert_eq!(report.tally(FixCategory::Roles).expect("roles").batches, 3);
}

#[tokio::test]
async fn failed_commit_does_not_stop_the_category() {
    let store = frozen((0..4).map(|i| member(&format!("m{i}"), "org1", &format!("{i}@x.com"), "member"))).await;
    store
        .fail_writes_to(DocumentPath::Member { id: "m1".into() })
        .await;
    let mut options = apply([FixCategory::Roles, FixCategory::Timestamps]);
    options.batch_ceiling = 2;

    let report = run_fix(&store, &options).await.expect("fix");
    let roles = report.tally(FixCategory::Roles).expect("roles");
    assert_eq!(roles.planned, 4);
    assert_eq!(roles.errors, 2, "m0 and m1 shared the rejected batch");
    assert_eq!(roles.applied, 2);
    assert_eq!(store.member("m0").await.expect("m0").role, Role::Legacy);
    assert_eq!(store.member("m3").await.expect("m3").role, Role::Technician);
    assert!(report.tally(FixCategory::Timestamps).is_some());
}

#[tokio::test]
async fn failed_dedupe_write_is_not_copied_into_the_mirror() {
    let mut first = linked("t1", "org1", "u1", "technician");
    first.email = Some("a@x.com".into());
    first.created_at = Some(RecordTime::Instant(at(1)));
    let mut second = linked("t2", "org1", "u2", "technician");
    second.email = Some("A@x.com".into());
    second.created_at = Some(RecordTime::Instant(at(2)));
    let store = frozen([first, second]).await;
    store
        .fail_writes_to(DocumentPath::Member { id: "t2".into() })
        .await;

    let report = run_fix(&store, &apply([FixCategory::DedupeEmails, FixCategory::Mirrors]))
        .await
        .expect("fix");
    assert_eq!(report.tally(FixCategory::DedupeEmails).expect("dedupe").errors, 1);
    assert_eq!(report.tally(FixCategory::Mirrors).expect("mirrors").applied, 2);

    let stored = store.member("t2").await.expect("t2");
    assert!(stored.active);
    let mirror = store.mirror("org1", "u2").await.expect("u2 mirror");
    assert_eq!(mirror.active, Some(stored.active));

    let audit = run_audit(&store, &AuditOptions::default()).await.expect("audit");
    assert_eq!(audit.count(AnomalyKind::MirrorActiveMismatch), 0);
    assert_eq!(audit.count(AnomalyKind::MirrorMissing), 0);
    // Still a duplicate; the next run retries it.
    assert_eq!(audit.count(AnomalyKind::DuplicateEmail), 1);
}

#[tokio::test]
async fn failed_role_write_is_not_copied_into_the_mirror() {
    let store = frozen([linked("m1", "org1", "u1", "member")]).await;
    store
        .fail_writes_to(DocumentPath::Member { id: "m1".into() })
        .await;

    let report = run_fix(&store, &apply([FixCategory::Roles, FixCategory::Mirrors]))
        .await
        .expect("fix");
    assert_eq!(report.tally(FixCategory::Roles).expect("roles").errors, 1);

    let stored = store.member("m1").await.expect("m1");
    assert_eq!(stored.role, Role::Legacy);
    let mirror = store.mirror("org1", "u1").await.expect("mirror");
    assert_eq!(mirror.role, stored.role);
}

#[tokio::test]
async fn mirror_lookup_failure_skips_instead_of_creating() {
    let store = frozen([
        linked("m1", "org1", "u1", "admin"),
        linked("m2", "org1", "u2", "viewer"),
    ])
    .await;
    store.fail_lookup("org1", "u1").await;

    let report = run_fix(&store, &apply([FixCategory::Mirrors])).await.expect("fix");
    let mirrors = report.tally(FixCategory::Mirrors).expect("mirrors");
    assert_eq!(mirrors.errors, 1);
    assert_eq!(mirrors.skipped, 1);
    assert_eq!(mirrors.applied, 1);
    assert!(store.mirror("org1", "u1").await.is_none());
    assert!(store.mirror("org1", "u2").await.is_some());
    assert!(report.render().contains("re-run `audit` to recheck them"));
}

#[tokio::test]
async fn drifted_mirror_gets_only_the_differing_fields() {
    let record = linked("m1", "org1", "u1", "technician");
    let store = frozen([record.clone()]).await;
    let mut stale = mirror_of(&record);
    stale.role = Role::Viewer;
    store.insert_mirror("org1", "u1", stale.clone()).await;

    run_fix(&store, &apply([FixCategory::Mirrors])).await.expect("fix");
    let mirror = store.mirror("org1", "u1").await.expect("mirror");
    assert_eq!(mirror.role, Role::Technician);
    assert_eq!(mirror.created_at, stale.created_at);
    assert_eq!(mirror.updated_at.and_then(|t| t.instant()), Some(at(100)));
}

#[tokio::test]
async fn revoked_credentials_are_fatal() {
    let store = frozen([member("m1", "org1", "a@x.com", "member")]).await;
    store.revoke_credentials().await;
    assert!(run_fix(&store, &apply([FixCategory::Roles])).await.is_err());
}
