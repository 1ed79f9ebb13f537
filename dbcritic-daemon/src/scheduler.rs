//! The poll loop: lists open PRs, decides which revisions need review, and
//! drives each through diff fetch, inference and publish, settling the
//! metrics row at the end.
//!
//! # Critical Invariant
//!
//! Cycles never overlap. The loop runs in one task and only ticks again
//! after the previous cycle returns; a cycle that overruns the interval
//! delays the next tick instead of stacking up. Within a cycle, work items
//! run strictly sequentially in ascending PR order.
//!
//! Error handling per work item: transient failures settle the attempt as
//! `failed` and leave the revision eligible for retry next cycle;
//! permanent API failures settle it as `skipped`, which retires the
//! revision. Store failures are different: they propagate out of the loop
//! and stop the daemon, because running without durable state would
//! silently break deduplication.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use dbcritic_core::diff::chunk_diff;
use dbcritic_core::findings::{parse_model_output, ChunkOutcome, Finding};
use dbcritic_core::review::{chunk_budget, create_chunk_prompt, get_system_prompt};
use dbcritic_core::CommitSha;

use crate::db::{AttemptOutcome, AttemptUsage, ProcessedPr};
use crate::github::{ApiError, PostedComment, PullRequest};
use crate::inference::InferenceError;
use crate::publisher::{PublishError, ReviewPublisher};
use crate::AppState;

/// One (PR, revision) pair selected for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub pr_number: u64,
    pub head_sha: CommitSha,
}

/// A classified failure of one work item. Store failures are deliberately
/// not represented here; they abort the daemon instead.
#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("GitHub API request failed: {0}")]
    Api(#[from] ApiError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("{0}")]
    Publish(#[from] PublishError),
    #[error("work item timed out after {0}s")]
    Timeout(u64),
}

impl WorkItemError {
    /// Permanent failures retire the revision instead of retrying it.
    fn is_permanent(&self) -> bool {
        match self {
            WorkItemError::Api(e) => !e.is_retryable(),
            WorkItemError::Publish(PublishError::Api(e)) => !e.is_retryable(),
            _ => false,
        }
    }
}

/// Partial results that must survive a work item failing halfway: usage is
/// billed for completions that ran even when a later stage fails.
#[derive(Debug, Default)]
struct StageReport {
    usage: AttemptUsage,
    diff_size: Option<u64>,
}

/// Run the poll loop until shutdown is signalled.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let publisher = ReviewPublisher::new(state.github.clone(), state.store.clone());

    let mut ticker = interval(Duration::from_secs(state.config.check_interval_secs));
    // A slow cycle must delay the next tick, not cause a catch-up burst.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("Shutdown signal received, stopping poll loop");
                return Ok(());
            }
        }

        if let Err(e) = poll_cycle(&state, &publisher, &shutdown).await {
            // Only store failures reach here. Stop rather than keep
            // reviewing without durable state.
            error!("Poll cycle failed fatally: {:#}", e);
            return Err(e);
        }
    }
}

/// A PR needs review when its head revision differs from the last one that
/// reached a terminal outcome. Failed attempts never store a revision, so
/// those PRs stay eligible.
fn select_work_item(pr: &PullRequest, stored: Option<&ProcessedPr>) -> Option<WorkItem> {
    let reviewed = stored.and_then(|p| p.last_reviewed_sha.as_ref());
    if reviewed.map(|sha| sha.0.as_str()) == Some(pr.head.sha.as_str()) {
        return None;
    }
    Some(WorkItem {
        pr_number: pr.number,
        head_sha: CommitSha::from(pr.head.sha.as_str()),
    })
}

/// One poll cycle. Failing to list PRs skips the cycle; everything else is
/// handled per item.
async fn poll_cycle(
    state: &AppState,
    publisher: &ReviewPublisher,
    shutdown: &watch::Receiver<bool>,
) -> Result<()> {
    let prs = match state.github.list_open_prs().await {
        Ok(prs) => prs,
        Err(e) => {
            error!("Failed to list open pull requests: {}", e);
            return Ok(());
        }
    };

    let mut items = Vec::new();
    for pr in &prs {
        let stored = state.store.get_processed_pr(pr.number).await?;
        if let Some(item) = select_work_item(pr, stored.as_ref()) {
            items.push(item);
        }
    }
    items.sort_by_key(|item| item.pr_number);

    info!("Poll cycle: {} open PRs, {} need review", prs.len(), items.len());

    for item in items {
        if *shutdown.borrow() {
            info!("Shutdown requested, leaving remaining work for the next start");
            return Ok(());
        }
        process_work_item(state, publisher, &item).await?;
    }

    Ok(())
}

/// Process one work item end to end. Always settles the attempt it opens;
/// the only errors returned are store failures.
async fn process_work_item(
    state: &AppState,
    publisher: &ReviewPublisher,
    item: &WorkItem,
) -> Result<()> {
    info!("Processing PR #{} at {}", item.pr_number, item.head_sha.short());
    let attempt_id = state
        .store
        .begin_attempt(item.pr_number, item.head_sha.clone())
        .await
        .context("Failed to open attempt")?;

    let mut report = StageReport::default();
    let budget = Duration::from_secs(state.config.work_item_timeout_secs);
    let staged = match timeout(budget, review_revision(state, publisher, item, &mut report)).await {
        Ok(result) => result,
        Err(_) => Err(WorkItemError::Timeout(state.config.work_item_timeout_secs)),
    };

    let outcome = match staged {
        Ok(comment) => AttemptOutcome::Succeeded {
            review_url: comment.html_url,
        },
        Err(WorkItemError::Publish(PublishError::History(e))) => {
            return Err(e.context("Failed to record review history"));
        }
        Err(e) if e.is_permanent() => {
            warn!(
                "PR #{} at {} failed permanently, retiring this revision: {}",
                item.pr_number,
                item.head_sha.short(),
                e
            );
            AttemptOutcome::Skipped { error: e.to_string() }
        }
        Err(e) => {
            warn!("PR #{} failed, will retry next cycle: {}", item.pr_number, e);
            AttemptOutcome::Failed { error: e.to_string() }
        }
    };

    state
        .store
        .finalize_attempt(attempt_id, outcome, report.usage, report.diff_size)
        .await
        .context("Failed to finalize attempt")
}

/// The review stages for one revision: fetch diff, chunk it, run each
/// chunk through the gate, publish. Fills `report` as it goes so partial
/// usage survives an error return.
async fn review_revision(
    state: &AppState,
    publisher: &ReviewPublisher,
    item: &WorkItem,
    report: &mut StageReport,
) -> Result<PostedComment, WorkItemError> {
    let diff = state.github.get_diff(item.pr_number).await?;
    report.diff_size = Some(diff.len() as u64);

    let chunks = chunk_diff(&diff, chunk_budget(state.config.engine.context_size));
    info!("PR #{}: diff split into {} chunk(s)", item.pr_number, chunks.len());

    let system_prompt = get_system_prompt();
    let mut findings: Vec<Finding> = Vec::new();
    let mut unparsed_chunks = 0usize;

    let chunk_count = chunks.len();
    for chunk in &chunks {
        let prompt = format!("{}\n{}", system_prompt, create_chunk_prompt(chunk, chunk_count));
        let started = Instant::now();
        let completion = state.gate.submit(&prompt).await?;
        report.usage.completions += 1;
        report.usage.tokens_in += completion.tokens_in;
        report.usage.tokens_out += completion.tokens_out;
        report.usage.inference_seconds += started.elapsed().as_secs_f64();

        match parse_model_output(&completion.text) {
            ChunkOutcome::Findings(mut chunk_findings) => findings.append(&mut chunk_findings),
            ChunkOutcome::ParseFailure { note } => {
                warn!(
                    "PR #{} chunk {}: model output had no recognisable findings: {}",
                    item.pr_number, chunk.index, note
                );
                unparsed_chunks += 1;
            }
        }
    }

    let comment = publisher
        .publish(item.pr_number, &item.head_sha, &findings, unparsed_chunks)
        .await?;
    Ok(comment)
}
