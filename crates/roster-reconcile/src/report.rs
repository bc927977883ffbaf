//! Audit and fix reports: plain-text rendering and JSON persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::batch::CategoryTally;
use crate::classify::AnomalyKind;
use crate::RunMode;

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub record_id: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryFindings {
    pub count: usize,
    /// First findings in record order, capped at the report's example limit.
    pub examples: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store: String,
    pub total_records: usize,
    pub active_records: usize,
    pub duplicate_sets: usize,
    pub mirror_lookups: usize,
    pub lookup_errors: usize,
    pub example_limit: usize,
    pub categories: BTreeMap<AnomalyKind, CategoryFindings>,
}

impl AuditReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, store: String, example_limit: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            store,
            total_records: 0,
            active_records: 0,
            duplicate_sets: 0,
            mirror_lookups: 0,
            lookup_errors: 0,
            example_limit,
            categories: AnomalyKind::ALL
                .iter()
                .map(|kind| (*kind, CategoryFindings::default()))
                .collect(),
        }
    }

    pub fn record(&mut self, kind: AnomalyKind, record_id: &str, detail: String) {
        let limit = self.example_limit;
        let findings = self.categories.entry(kind).or_default();
        findings.count += 1;
        if findings.examples.len() < limit {
            findings.examples.push(Finding {
                record_id: record_id.to_string(),
                detail,
            });
        }
    }

    pub fn count(&self, kind: AnomalyKind) -> usize {
        self.categories.get(&kind).map_or(0, |f| f.count)
    }

    pub fn total_findings(&self) -> usize {
        self.categories.values().map(|f| f.count).sum()
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Membership audit {}", self.run_id),
            format!("store: {}", self.store),
            format!(
                "records: {} ({} active), duplicate sets: {}, mirror lookups: {} ({} failed)",
                self.total_records,
                self.active_records,
                self.duplicate_sets,
                self.mirror_lookups,
                self.lookup_errors
            ),
            String::new(),
            format!("{:<36} {:>7}  {}", "category", "count", "remedy"),
        ];
        for (kind, findings) in &self.categories {
            lines.push(format!(
                "{:<36} {:>7}  {}",
                kind.label(),
                findings.count,
                kind.remedy()
            ));
        }

        for (kind, findings) in self.categories.iter().filter(|(_, f)| f.count > 0) {
            lines.push(String::new());
            lines.push(format!("== {} ({}) ==", kind.label(), findings.count));
            for finding in &findings.examples {
                lines.push(format!("  {}: {}", finding.record_id, finding.detail));
            }
            let hidden = findings.count - findings.examples.len();
            if hidden > 0 {
                lines.push(format!("  ... and {hidden} more"));
            }
        }

        lines.push(String::new());
        lines.push(if self.total_findings() == 0 {
            "No anomalies found.".to_string()
        } else {
            format!("{} findings. Run `fix` to preview repairs.", self.total_findings())
        });
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store: String,
    pub mode: RunMode,
    pub total_records: usize,
    pub categories: Vec<CategoryTally>,
}

impl FixReport {
    pub fn planned(&self) -> usize {
        self.categories.iter().map(|c| c.planned).sum()
    }

    pub fn applied(&self) -> usize {
        self.categories.iter().map(|c| c.applied).sum()
    }

    pub fn errors(&self) -> usize {
        self.categories.iter().map(|c| c.errors).sum()
    }

    /// Records counted as errors without a write attempt (failed lookups).
    pub fn skipped(&self) -> usize {
        self.categories.iter().map(|c| c.skipped).sum()
    }

    pub fn tally(&self, category: crate::FixCategory) -> Option<&CategoryTally> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Membership fix {} ({})", self.run_id, self.mode),
            format!("store: {}", self.store),
            format!("records: {}", self.total_records),
        ];
        for tally in &self.categories {
            lines.push(String::new());
            lines.push(format!("== {} ==", tally.category));
            lines.extend(tally.lines.iter().map(|line| format!("  {line}")));
            lines.push(match self.mode {
                RunMode::DryRun => format!(
                    "{}: would fix {} in {} batch(es), {} error(s)",
                    tally.category, tally.planned, tally.batches, tally.errors
                ),
                RunMode::Apply => format!(
                    "{}: fixed {} of {} in {} batch(es), {} error(s)",
                    tally.category, tally.applied, tally.planned, tally.batches, tally.errors
                ),
            });
        }
        lines.push(String::new());
        lines.push(match self.mode {
            RunMode::DryRun => format!(
                "Dry run: {} change(s) planned, nothing written. Re-run with --apply to write.",
                self.planned()
            ),
            RunMode::Apply => format!(
                "Applied {} of {} change(s), {} error(s).",
                self.applied(),
                self.planned(),
                self.errors()
            ),
        });
        if self.skipped() > 0 {
            lines.push(format!(
                "{} record(s) skipped after failed lookups and not repaired; re-run `audit` to recheck them.",
                self.skipped()
            ));
        }
        lines.join("\n")
    }
}

/// Write `report` as pretty JSON to `<dir>/<run_id>/<file_name>`.
pub async fn write_report(
    dir: &Path,
    run_id: Uuid,
    file_name: &str,
    report: &impl Serialize,
) -> Result<PathBuf> {
    let run_dir = dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join(file_name);
    let bytes = serde_json::to_vec_pretty(report).with_context(|| format!("serializing {file_name}"))?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
