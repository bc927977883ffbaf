//! Membership reconciliation: the read-only audit job and the repairing fix job.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use roster_core::{DocumentPath, MembershipRecord, Mutation};
use roster_storage::{load_service_account, FirestoreClient, RecordStore, StoreError};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod batch;
pub mod classify;
pub mod config;
pub mod duplicates;
pub mod mirror;
pub mod planner;
pub mod report;

pub use batch::{BatchCommitter, BatchOutcome, CategoryTally};
pub use classify::AnomalyKind;
pub use config::{ConfigError, ReconcileConfig};
pub use report::{write_report, AuditReport, FixReport};

pub const CRATE_NAME: &str = "roster-reconcile";

/// Result of one per-record store operation.
#[derive(Debug)]
pub enum RecordOutcome<T> {
    Success(T),
    /// Counted against the record; the run continues.
    Recoverable(String),
    /// Aborts the run.
    Fatal(StoreError),
}

impl<T> From<Result<T, StoreError>> for RecordOutcome<T> {
    fn from(result: Result<T, StoreError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_fatal() => Self::Fatal(err),
            Err(err) => Self::Recoverable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    DryRun,
    Apply,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DryRun => "dry-run",
            Self::Apply => "apply",
        })
    }
}

/// Repair categories. Declaration order is execution order: dedupe settles
/// `active` flags before mirrors copy them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixCategory {
    Roles,
    Timestamps,
    ViewerPermissions,
    DedupeEmails,
    Mirrors,
}

impl FixCategory {
    pub const ALL: [FixCategory; 5] = [
        FixCategory::Roles,
        FixCategory::Timestamps,
        FixCategory::ViewerPermissions,
        FixCategory::DedupeEmails,
        FixCategory::Mirrors,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Roles => "roles",
            Self::Timestamps => "timestamps",
            Self::ViewerPermissions => "viewer-permissions",
            Self::DedupeEmails => "dedupe-emails",
            Self::Mirrors => "mirrors",
        }
    }
}

impl fmt::Display for FixCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub example_limit: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            example_limit: config::DEFAULT_EXAMPLE_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixOptions {
    pub mode: RunMode,
    pub categories: BTreeSet<FixCategory>,
    pub batch_ceiling: usize,
}

impl FixOptions {
    pub fn new(mode: RunMode, categories: impl IntoIterator<Item = FixCategory>) -> Self {
        Self {
            mode,
            categories: categories.into_iter().collect(),
            batch_ceiling: config::DEFAULT_BATCH_CEILING,
        }
    }
}

/// Load credentials and open an authenticated Firestore client.
pub async fn connect(config: &ReconcileConfig) -> Result<FirestoreClient> {
    let key = load_service_account(&config.credentials_path).context("loading credentials")?;
    let firestore = config
        .firestore_config(&key)
        .context("resolving Firestore project")?;
    info!(
        project = %firestore.project_id,
        collection = %firestore.collection,
        emulator = firestore.emulator_host.is_some(),
        "connecting to Firestore"
    );
    FirestoreClient::connect(firestore, key)
        .await
        .context("authenticating with Firestore")
}

/// Snapshot of the primary collection, ordered by document id.
async fn read_snapshot(store: &dyn RecordStore) -> Result<Vec<MembershipRecord>> {
    let mut records = store
        .list_members()
        .await
        .with_context(|| format!("reading membership records from {}", store.describe()))?;
    records.sort_by(|a, b| a.id.cmp(&b.id));
    info!(records = records.len(), "read membership snapshot");
    Ok(records)
}

/// Read-only pass: classify every record, group duplicates, compare mirrors.
pub async fn run_audit(store: &dyn RecordStore, options: &AuditOptions) -> Result<AuditReport> {
    let mut report = AuditReport::new(
        Uuid::new_v4(),
        Utc::now(),
        store.describe(),
        options.example_limit,
    );
    let span = info_span!("audit", run_id = %report.run_id);

    async {
        let records = read_snapshot(store).await?;
        report.total_records = records.len();
        report.active_records = records.iter().filter(|r| r.active).count();

        for record in &records {
            for kind in classify::classify(record) {
                report.record(kind, &record.id, classify::explain(kind, record));
            }
        }

        let sets = duplicates::find_duplicate_sets(&records);
        report.duplicate_sets = sets.len();
        for set in &sets {
            let duplicate_ids: Vec<&str> = set.duplicates.iter().map(|r| r.id.as_str()).collect();
            report.record(
                AnomalyKind::DuplicateEmail,
                &set.primary.id,
                format!(
                    "{} active records share {}; primary {}, duplicates {:?}",
                    set.member_count(),
                    set.key,
                    set.primary.id,
                    duplicate_ids
                ),
            );
        }

        let observations = mirror::observe_mirrors(store, &records)
            .await
            .context("checking mirrors")?;
        report.mirror_lookups = observations.len();
        for observation in &observations {
            let record_id = &observation.target.representative.id;
            let path = observation.target.path().relative("");
            match &observation.lookup {
                Err(detail) => {
                    report.lookup_errors += 1;
                    report.record(
                        AnomalyKind::MirrorMissing,
                        record_id,
                        format!("{path}: lookup failed: {detail}"),
                    );
                }
                Ok(_) => {
                    for drift in observation.drift() {
                        report.record(drift.kind(), record_id, format!("{path}: {}", drift.describe()));
                    }
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .instrument(span)
    .await?;

    report.finished_at = Utc::now();
    info!(
        run_id = %report.run_id,
        findings = report.total_findings(),
        lookup_errors = report.lookup_errors,
        "audit complete"
    );
    Ok(report)
}

/// Repair pass over the enabled categories, in `FixCategory` order.
pub async fn run_fix(store: &dyn RecordStore, options: &FixOptions) -> Result<FixReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let mut records = read_snapshot(store).await?;
    let mut report = FixReport {
        run_id,
        started_at,
        finished_at: started_at,
        store: store.describe(),
        mode: options.mode,
        total_records: records.len(),
        categories: Vec::with_capacity(options.categories.len()),
    };

    for category in options.categories.iter().copied() {
        let span = info_span!("fix", %run_id, %category, mode = %options.mode);
        let tally = fix_category(store, &mut records, category, options)
            .instrument(span)
            .await
            .with_context(|| format!("fixing {category}"))?;
        info!(
            %category,
            planned = tally.planned,
            applied = tally.applied,
            errors = tally.errors,
            "category finished"
        );
        report.categories.push(tally);
    }

    report.finished_at = Utc::now();
    Ok(report)
}

async fn fix_category(
    store: &dyn RecordStore,
    records: &mut [MembershipRecord],
    category: FixCategory,
    options: &FixOptions,
) -> Result<CategoryTally, StoreError> {
    let mut committer = BatchCommitter::new(store, category, options.mode, options.batch_ceiling);
    let now = Utc::now();

    let plan: fn(&MembershipRecord) -> Option<Mutation> = match category {
        FixCategory::Roles => planner::plan_role,
        FixCategory::Timestamps => planner::plan_timestamps,
        FixCategory::ViewerPermissions => planner::plan_viewer_permissions,
        FixCategory::DedupeEmails => {
            fix_duplicates(records, &mut committer).await?;
            return settle(records, committer, now).await;
        }
        FixCategory::Mirrors => {
            fix_mirrors(store, records, &mut committer).await?;
            return settle(records, committer, now).await;
        }
    };

    for record in records.iter() {
        if let Some(mutation) = plan(record) {
            committer.push(record.label(), mutation).await?;
        }
    }
    settle(records, committer, now).await
}

/// Flush the category and fold the writes that landed into the snapshot, so
/// later categories plan against what the store actually holds.
async fn settle(
    records: &mut [MembershipRecord],
    committer: BatchCommitter<'_>,
    now: DateTime<Utc>,
) -> Result<CategoryTally, StoreError> {
    let outcome = committer.finish().await?;
    for mutation in &outcome.landed {
        let DocumentPath::Member { id } = &mutation.path else {
            continue;
        };
        if let Ok(index) = records.binary_search_by(|r| r.id.as_str().cmp(id)) {
            records[index].apply(mutation, now);
        }
    }
    Ok(outcome.tally)
}

async fn fix_duplicates(
    records: &[MembershipRecord],
    committer: &mut BatchCommitter<'_>,
) -> Result<(), StoreError> {
    let planned: Vec<(String, Mutation)> = duplicates::find_duplicate_sets(records)
        .iter()
        .flat_map(|set| {
            planner::plan_dedupe(set).into_iter().map(move |(record, mutation)| {
                let subject = format!("{} duplicate of {} ({})", record.label(), set.primary.id, set.key);
                (subject, mutation)
            })
        })
        .collect();

    for (subject, mutation) in planned {
        committer.push(subject, mutation).await?;
    }
    Ok(())
}

/// A failed lookup skips the mirror rather than risking a blind create; the
/// report tells the operator to re-audit.
async fn fix_mirrors(
    store: &dyn RecordStore,
    records: &[MembershipRecord],
    committer: &mut BatchCommitter<'_>,
) -> Result<(), StoreError> {
    for target in mirror::mirror_targets(records) {
        match mirror::lookup(store, &target).await {
            RecordOutcome::Success(current) => {
                if let Some(mutation) = planner::plan_mirror(target.representative, current.as_ref()) {
                    committer.push(target.subject(), mutation).await?;
                }
            }
            RecordOutcome::Recoverable(detail) => {
                committer.record_error(&target.subject(), &format!("mirror lookup failed: {detail}"));
            }
            RecordOutcome::Fatal(err) => return Err(err),
        }
    }
    Ok(())
}
