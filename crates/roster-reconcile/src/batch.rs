//! Bounded write batching for one fix category.

use roster_core::Mutation;
use roster_storage::{RecordStore, StoreError, MAX_WRITES_PER_COMMIT};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{FixCategory, RunMode};

/// Outcome of one fix category.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryTally {
    pub category: FixCategory,
    pub planned: usize,
    pub applied: usize,
    pub errors: usize,
    /// Errors counted for records that never reached a commit.
    pub skipped: usize,
    /// Commits issued, or that would be issued in dry-run.
    pub batches: usize,
    pub lines: Vec<String>,
}

impl CategoryTally {
    pub(crate) fn new(category: FixCategory) -> Self {
        Self {
            category,
            planned: 0,
            applied: 0,
            errors: 0,
            skipped: 0,
            batches: 0,
            lines: Vec::new(),
        }
    }
}

/// What a finished category did, plus the writes the snapshot may now assume.
#[derive(Debug)]
pub struct BatchOutcome {
    pub tally: CategoryTally,
    /// Committed writes, or every planned write in dry-run. Writes from a
    /// rejected batch are never here.
    pub landed: Vec<Mutation>,
}

/// Accumulates writes and commits them in batches of at most `ceiling`.
///
/// A failed commit counts an error for every write it carried and the
/// category keeps going; only fatal store errors are returned.
pub struct BatchCommitter<'s> {
    store: &'s dyn RecordStore,
    mode: RunMode,
    ceiling: usize,
    subjects: Vec<String>,
    writes: Vec<Mutation>,
    landed: Vec<Mutation>,
    tally: CategoryTally,
}

impl<'s> BatchCommitter<'s> {
    pub fn new(store: &'s dyn RecordStore, category: FixCategory, mode: RunMode, ceiling: usize) -> Self {
        let ceiling = ceiling.clamp(1, MAX_WRITES_PER_COMMIT);
        Self {
            store,
            mode,
            ceiling,
            subjects: Vec::with_capacity(ceiling),
            writes: Vec::with_capacity(ceiling),
            landed: Vec::new(),
            tally: CategoryTally::new(category),
        }
    }

    pub async fn push(&mut self, subject: String, write: Mutation) -> Result<(), StoreError> {
        self.tally.planned += 1;
        self.subjects.push(subject);
        self.writes.push(write);
        if self.writes.len() >= self.ceiling {
            self.flush().await?;
        }
        Ok(())
    }

    /// Count a per-record failure that never reached a commit.
    pub fn record_error(&mut self, subject: &str, detail: &str) {
        warn!(category = %self.tally.category, subject, detail, "skipping record");
        self.tally.errors += 1;
        self.tally.skipped += 1;
        self.tally.lines.push(format!("error {subject}: {detail}"));
    }

    pub async fn finish(mut self) -> Result<BatchOutcome, StoreError> {
        self.flush().await?;
        Ok(BatchOutcome {
            tally: self.tally,
            landed: self.landed,
        })
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let subjects = std::mem::take(&mut self.subjects);
        let writes = std::mem::take(&mut self.writes);
        self.tally.batches += 1;

        match self.mode {
            RunMode::DryRun => {
                for (subject, write) in subjects.iter().zip(&writes) {
                    debug!(category = %self.tally.category, subject, "would fix");
                    self.tally
                        .lines
                        .push(format!("would fix {subject}: {}", write.describe()));
                }
                self.landed.extend(writes);
            }
            RunMode::Apply => match self.store.commit(&writes).await {
                Ok(()) => {
                    info!(category = %self.tally.category, writes = writes.len(), "committed batch");
                    self.tally.applied += writes.len();
                    for (subject, write) in subjects.iter().zip(&writes) {
                        self.tally
                            .lines
                            .push(format!("fixed {subject}: {}", write.describe()));
                    }
                    self.landed.extend(writes);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(category = %self.tally.category, writes = writes.len(), error = %err, "batch commit failed");
                    self.tally.errors += writes.len();
                    for subject in &subjects {
                        self.tally.lines.push(format!("failed {subject}: {err}"));
                    }
                }
            },
        }
        Ok(())
    }
}
