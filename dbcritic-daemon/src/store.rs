//! Async access to the metrics database.
//!
//! `rusqlite` calls block, so the daemon reaches the database through
//! `spawn_blocking`. This wrapper mirrors the part of [`MetricsDb`] the
//! scheduler needs; the dashboard CLI reads [`MetricsDb`] directly.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use dbcritic_core::CommitSha;

use crate::db::{AttemptId, AttemptOutcome, AttemptUsage, MetricsDb, ProcessedPr};

/// Cloneable async handle to the store. All daemon writes go through one
/// of these.
#[derive(Clone)]
pub struct MetricsStore {
    db: Arc<MetricsDb>,
}

impl MetricsStore {
    /// Wrap an already-open database.
    pub fn new(db: Arc<MetricsDb>) -> Self {
        Self { db }
    }

    /// Open (creating if necessary) the database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let db = tokio::task::spawn_blocking(move || MetricsDb::new(&path))
            .await
            .context("spawn_blocking panicked")??;
        Ok(Self::new(Arc::new(db)))
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(MetricsDb::new_in_memory()?)))
    }

    pub async fn get_processed_pr(&self, pr_number: u64) -> Result<Option<ProcessedPr>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.get_processed_pr(pr_number))
            .await
            .context("spawn_blocking panicked")?
    }

    pub async fn begin_attempt(&self, pr_number: u64, head_sha: CommitSha) -> Result<AttemptId> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.begin_attempt(pr_number, &head_sha))
            .await
            .context("spawn_blocking panicked")?
    }

    pub async fn finalize_attempt(
        &self,
        attempt_id: AttemptId,
        outcome: AttemptOutcome,
        usage: AttemptUsage,
        diff_size: Option<u64>,
    ) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.finalize_attempt(attempt_id, &outcome, &usage, diff_size)
        })
        .await
        .context("spawn_blocking panicked")?
    }

    pub async fn record_review(
        &self,
        pr_number: u64,
        head_sha: CommitSha,
        body: String,
        comment_id: u64,
    ) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.record_review(pr_number, &head_sha, &body, comment_id)
        })
        .await
        .context("spawn_blocking panicked")?
    }

    pub async fn mark_stale_attempts_failed(&self, reason: String) -> Result<usize> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.mark_stale_attempts_failed(&reason))
            .await
            .context("spawn_blocking panicked")?
    }
}
