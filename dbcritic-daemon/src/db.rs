//! SQLite persistence for review state and metrics.
//!
//! One `MetricsDb` owns the only connection the daemon writes through. The
//! dashboard CLI opens the same file with [`MetricsDb::open_read_only`];
//! WAL journaling keeps those readers from ever blocking the daemon's
//! writes.
//!
//! Attempt lifecycle: [`MetricsDb::begin_attempt`] inserts an
//! `in_progress` metrics row before any work happens, and
//! [`MetricsDb::finalize_attempt`] settles it in a single transaction
//! that also updates the per-PR row, the aggregate counters and the daily
//! rollup. A crash in between leaves the `in_progress` row visible, which
//! is exactly what startup reconciliation looks for.
//!
//! # Schema Versioning
//!
//! The schema version is stored in SQLite's `user_version` pragma.
//! On startup we check the version and run any pending migrations.
//! Opening a database from a newer version fails rather than guessing.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};

use dbcritic_core::CommitSha;

const SCHEMA_VERSION: i32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier of one row in `pr_metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptId(pub i64);

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status recorded on the per-PR row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrStatus::Pending => "pending",
            PrStatus::Succeeded => "succeeded",
            PrStatus::Failed => "failed",
            PrStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PrStatus::Pending),
            "succeeded" => Ok(PrStatus::Succeeded),
            "failed" => Ok(PrStatus::Failed),
            "skipped" => Ok(PrStatus::Skipped),
            other => Err(anyhow!("Unknown PR status: {}", other)),
        }
    }
}

/// Status recorded on one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(AttemptStatus::InProgress),
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "skipped" => Ok(AttemptStatus::Skipped),
            other => Err(anyhow!("Unknown attempt status: {}", other)),
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded { review_url: String },
    /// Transient failure. The revision stays eligible for retry.
    Failed { error: String },
    /// Permanent failure. The revision is recorded as consumed so it is
    /// never attempted again.
    Skipped { error: String },
}

impl AttemptOutcome {
    fn attempt_status(&self) -> AttemptStatus {
        match self {
            AttemptOutcome::Succeeded { .. } => AttemptStatus::Succeeded,
            AttemptOutcome::Failed { .. } => AttemptStatus::Failed,
            AttemptOutcome::Skipped { .. } => AttemptStatus::Skipped,
        }
    }

    fn pr_status(&self) -> PrStatus {
        match self {
            AttemptOutcome::Succeeded { .. } => PrStatus::Succeeded,
            AttemptOutcome::Failed { .. } => PrStatus::Failed,
            AttemptOutcome::Skipped { .. } => PrStatus::Skipped,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Succeeded { .. } => None,
            AttemptOutcome::Failed { error } | AttemptOutcome::Skipped { error } => Some(error),
        }
    }

    fn review_url(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Succeeded { review_url } => Some(review_url),
            _ => None,
        }
    }

    /// Terminal outcomes consume the attempted revision; failures leave it
    /// unstored so the same revision is retried next cycle.
    fn reviewed_sha<'a>(&self, attempted: &'a str) -> Option<&'a str> {
        match self {
            AttemptOutcome::Succeeded { .. } | AttemptOutcome::Skipped { .. } => Some(attempted),
            AttemptOutcome::Failed { .. } => None,
        }
    }
}

/// Token and latency totals accumulated over one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttemptUsage {
    pub completions: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub inference_seconds: f64,
}

/// One row of `processed_prs`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedPr {
    pub pr_number: u64,
    /// Last revision that reached a terminal outcome. `None` until the
    /// first success or skip.
    pub last_reviewed_sha: Option<CommitSha>,
    pub status: PrStatus,
    pub last_attempt_at: DateTime<Utc>,
    pub review_url: Option<String>,
}

/// One row of `pr_metrics`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRow {
    pub id: AttemptId,
    pub pr_number: u64,
    pub head_sha: CommitSha,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub diff_size: Option<u64>,
    pub duration_seconds: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub error_message: Option<String>,
}

/// One row of `daily_metrics`.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRow {
    pub day: NaiveDate,
    pub prs_processed: u64,
    pub successful_reviews: u64,
    pub failed_reviews: u64,
    pub total_duration_seconds: f64,
    pub total_tokens_used: u64,
}

impl DailyRow {
    pub fn avg_duration_seconds(&self) -> f64 {
        if self.prs_processed == 0 {
            0.0
        } else {
            self.total_duration_seconds / self.prs_processed as f64
        }
    }
}

/// Process-lifetime aggregate counters from `llm_metrics`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LlmTotals {
    pub total_completions: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_inference_seconds: f64,
}

impl LlmTotals {
    pub fn avg_latency_seconds(&self) -> f64 {
        if self.total_completions == 0 {
            0.0
        } else {
            self.total_inference_seconds / self.total_completions as f64
        }
    }
}

/// One published review from `review_history`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRow {
    pub pr_number: u64,
    pub head_sha: CommitSha,
    pub sequence: u32,
    pub reviewed_at: DateTime<Utc>,
    pub body: String,
    pub comment_id: u64,
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {:?}", s))
}

#[derive(Debug)]
pub struct MetricsDb {
    conn: Mutex<Connection>,
}

impl MetricsDb {
    /// Open (creating if necessary) the database at the given path and
    /// bring its schema up to date.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    /// Open an existing store without write access (the dashboard side).
    /// Fails if the file does not exist or its schema is not the version
    /// this build understands.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open database at {} read-only", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .context("Failed to read schema version")?;
        if version > SCHEMA_VERSION {
            bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                version,
                SCHEMA_VERSION
            );
        }
        if version < SCHEMA_VERSION {
            bail!(
                "Database at {} has schema version {} (expected {}). \
                 Run the daemon once to initialise or migrate it.",
                path.display(),
                version,
                SCHEMA_VERSION
            );
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.configure_connection()?;
        db.init_schema()?;
        Ok(db)
    }

    fn configure_connection(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        // WAL lets the read-only dashboard read while the daemon writes.
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal mode")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        Ok(())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .context("Failed to read schema version")?;

        if current_version > SCHEMA_VERSION {
            bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("Failed to update schema version")?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        // Future migrations go here:
        // if from_version < 2 {
        //     Self::migrate_v1_to_v2(conn)?;
        // }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Review deduplication state, one row per pull request.
            CREATE TABLE IF NOT EXISTS processed_prs (
                pr_number INTEGER PRIMARY KEY,
                -- Last revision with a terminal outcome. NULL until the first
                -- success or skip; failed attempts leave it untouched so the
                -- same revision is retried.
                last_reviewed_sha TEXT,
                status TEXT NOT NULL CHECK (status IN ('pending', 'succeeded', 'failed', 'skipped')),
                last_attempt_at TEXT NOT NULL,
                review_url TEXT
            );

            -- Every review comment ever published.
            CREATE TABLE IF NOT EXISTS review_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pr_number INTEGER NOT NULL,
                head_sha TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                reviewed_at TEXT NOT NULL,
                body TEXT NOT NULL,
                comment_id INTEGER NOT NULL,
                UNIQUE (pr_number, head_sha, sequence)
            );

            -- One row per processing attempt, opened before any work starts.
            CREATE TABLE IF NOT EXISTS pr_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pr_number INTEGER NOT NULL,
                head_sha TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL CHECK (status IN ('in_progress', 'succeeded', 'failed', 'skipped')),
                diff_size INTEGER,
                duration_seconds REAL,
                input_tokens INTEGER,
                output_tokens INTEGER,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_pr_metrics_pr_number ON pr_metrics (pr_number);
            CREATE INDEX IF NOT EXISTS idx_pr_metrics_in_progress
                ON pr_metrics (status) WHERE status = 'in_progress';

            -- Process-lifetime inference counters, kept as a single row.
            CREATE TABLE IF NOT EXISTS llm_metrics (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_completions INTEGER NOT NULL,
                total_input_tokens INTEGER NOT NULL,
                total_output_tokens INTEGER NOT NULL,
                total_inference_seconds REAL NOT NULL
            );

            INSERT OR IGNORE INTO llm_metrics
                (id, total_completions, total_input_tokens, total_output_tokens, total_inference_seconds)
            VALUES (1, 0, 0, 0, 0.0);

            -- Per-UTC-day rollup, updated incrementally at finalize time.
            CREATE TABLE IF NOT EXISTS daily_metrics (
                day TEXT PRIMARY KEY,
                prs_processed INTEGER NOT NULL,
                successful_reviews INTEGER NOT NULL,
                failed_reviews INTEGER NOT NULL,
                total_duration_seconds REAL NOT NULL,
                total_tokens_used INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;
        Ok(())
    }

    /// Open a new attempt: insert the `in_progress` metrics row and make
    /// sure the per-PR row exists, `pending` on first sighting. One
    /// transaction, so a crash cannot leave one without the other.
    pub fn begin_attempt(&self, pr_number: u64, head_sha: &CommitSha) -> Result<AttemptId> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let started_at = now_timestamp();
        tx.execute(
            "INSERT INTO pr_metrics (pr_number, head_sha, started_at, status)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                pr_number,
                head_sha.0,
                started_at,
                AttemptStatus::InProgress.as_str()
            ],
        )
        .context("Failed to insert attempt row")?;
        let attempt_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO processed_prs (pr_number, status, last_attempt_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (pr_number) DO UPDATE SET
                 status = excluded.status,
                 last_attempt_at = excluded.last_attempt_at",
            rusqlite::params![pr_number, PrStatus::Pending.as_str(), started_at],
        )
        .context("Failed to upsert processed PR row")?;

        tx.commit().context("Failed to commit attempt start")?;
        Ok(AttemptId(attempt_id))
    }

    /// Settle an open attempt. Everything the outcome implies happens in
    /// one transaction: the metrics row flips out of `in_progress`, the
    /// per-PR row is upserted, the aggregate counters grow by this
    /// attempt's usage, and the daily rollup for the attempt's start day
    /// is bumped. Fails if the attempt is unknown or already settled.
    pub fn finalize_attempt(
        &self,
        attempt_id: AttemptId,
        outcome: &AttemptOutcome,
        usage: &AttemptUsage,
        diff_size: Option<u64>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let (pr_number, head_sha, started_at): (u64, String, String) = tx
            .query_row(
                "SELECT pr_number, head_sha, started_at FROM pr_metrics WHERE id = ?1",
                [attempt_id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .with_context(|| format!("Failed to load attempt {} for finalize", attempt_id))?;

        let started = parse_timestamp(&started_at)?;
        let finished = Utc::now();
        let duration_seconds = (finished - started).num_milliseconds() as f64 / 1000.0;
        let finished_at = format_timestamp(finished);

        let updated = tx
            .execute(
                "UPDATE pr_metrics
                 SET finished_at = ?2,
                     status = ?3,
                     diff_size = ?4,
                     duration_seconds = ?5,
                     input_tokens = ?6,
                     output_tokens = ?7,
                     error_message = ?8
                 WHERE id = ?1 AND status = 'in_progress'",
                rusqlite::params![
                    attempt_id.0,
                    finished_at,
                    outcome.attempt_status().as_str(),
                    diff_size,
                    duration_seconds,
                    usage.tokens_in,
                    usage.tokens_out,
                    outcome.error_message()
                ],
            )
            .context("Failed to finalize attempt row")?;
        if updated == 0 {
            bail!("Attempt {} is not in progress", attempt_id);
        }

        tx.execute(
            "INSERT INTO processed_prs
                 (pr_number, last_reviewed_sha, status, last_attempt_at, review_url)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (pr_number) DO UPDATE SET
                 last_reviewed_sha = COALESCE(excluded.last_reviewed_sha, processed_prs.last_reviewed_sha),
                 status = excluded.status,
                 last_attempt_at = excluded.last_attempt_at,
                 review_url = COALESCE(excluded.review_url, processed_prs.review_url)",
            rusqlite::params![
                pr_number,
                outcome.reviewed_sha(&head_sha),
                outcome.pr_status().as_str(),
                finished_at,
                outcome.review_url()
            ],
        )
        .context("Failed to update processed PR row")?;

        if usage.completions > 0 {
            tx.execute(
                "UPDATE llm_metrics
                 SET total_completions = total_completions + ?1,
                     total_input_tokens = total_input_tokens + ?2,
                     total_output_tokens = total_output_tokens + ?3,
                     total_inference_seconds = total_inference_seconds + ?4
                 WHERE id = 1",
                rusqlite::params![
                    usage.completions,
                    usage.tokens_in,
                    usage.tokens_out,
                    usage.inference_seconds
                ],
            )
            .context("Failed to update aggregate inference counters")?;
        }

        let day = started.date_naive().to_string();
        let succeeded = matches!(outcome, AttemptOutcome::Succeeded { .. }) as i64;
        let failed = matches!(outcome, AttemptOutcome::Failed { .. }) as i64;
        let total_tokens = usage.tokens_in + usage.tokens_out;
        tx.execute(
            "INSERT INTO daily_metrics
                 (day, prs_processed, successful_reviews, failed_reviews,
                  total_duration_seconds, total_tokens_used)
             VALUES (?1, 1, ?2, ?3, ?4, ?5)
             ON CONFLICT (day) DO UPDATE SET
                 prs_processed = prs_processed + 1,
                 successful_reviews = successful_reviews + excluded.successful_reviews,
                 failed_reviews = failed_reviews + excluded.failed_reviews,
                 total_duration_seconds = total_duration_seconds + excluded.total_duration_seconds,
                 total_tokens_used = total_tokens_used + excluded.total_tokens_used",
            rusqlite::params![day, succeeded, failed, duration_seconds, total_tokens],
        )
        .context("Failed to update daily rollup")?;

        tx.commit().context("Failed to commit finalize")?;
        Ok(())
    }

    /// Append one published review to the history. The sequence number
    /// restarts at 1 for every (PR, revision) pair.
    pub fn record_review(
        &self,
        pr_number: u64,
        head_sha: &CommitSha,
        body: &str,
        comment_id: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO review_history
                 (pr_number, head_sha, sequence, reviewed_at, body, comment_id)
             VALUES (
                 ?1, ?2,
                 (SELECT COALESCE(MAX(sequence), 0) + 1
                    FROM review_history
                   WHERE pr_number = ?1 AND head_sha = ?2),
                 ?3, ?4, ?5
             )",
            rusqlite::params![pr_number, head_sha.0, now_timestamp(), body, comment_id],
        )
        .context("Failed to record review history")?;
        Ok(())
    }

    /// Flip attempts a previous process left `in_progress` to `failed`.
    /// Returns how many rows were touched. Deliberately leaves
    /// `processed_prs` alone: those rows never stored the revision, so the
    /// affected PRs are retried on the next cycle anyway.
    pub fn mark_stale_attempts_failed(&self, reason: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let updated = conn
            .execute(
                "UPDATE pr_metrics
                 SET status = 'failed', finished_at = ?1, error_message = ?2
                 WHERE status = 'in_progress'",
                rusqlite::params![now_timestamp(), reason],
            )
            .context("Failed to mark stale attempts as failed")?;
        Ok(updated)
    }

    pub fn get_processed_pr(&self, pr_number: u64) -> Result<Option<ProcessedPr>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let result = conn.query_row(
            "SELECT pr_number, last_reviewed_sha, status, last_attempt_at, review_url
             FROM processed_prs WHERE pr_number = ?1",
            [pr_number],
            |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        );
        match result {
            Ok((pr_number, sha, status, last_attempt_at, review_url)) => Ok(Some(ProcessedPr {
                pr_number,
                last_reviewed_sha: sha.map(CommitSha),
                status: PrStatus::parse(&status)?,
                last_attempt_at: parse_timestamp(&last_attempt_at)?,
                review_url,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to query processed PR"),
        }
    }

    /// Most recent attempts first.
    pub fn recent_attempts(&self, limit: u32) -> Result<Vec<AttemptRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, pr_number, head_sha, started_at, finished_at, status,
                        diff_size, duration_seconds, input_tokens, output_tokens, error_message
                 FROM pr_metrics ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare attempt query")?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<u64>>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                    row.get::<_, Option<u64>>(8)?,
                    row.get::<_, Option<u64>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .context("Failed to query attempts")?;

        let mut attempts = Vec::new();
        for row in rows {
            let (
                id,
                pr_number,
                head_sha,
                started_at,
                finished_at,
                status,
                diff_size,
                duration_seconds,
                input_tokens,
                output_tokens,
                error_message,
            ) = row.context("Failed to read attempt row")?;
            attempts.push(AttemptRow {
                id: AttemptId(id),
                pr_number,
                head_sha: CommitSha(head_sha),
                started_at: parse_timestamp(&started_at)?,
                finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
                status: AttemptStatus::parse(&status)?,
                diff_size,
                duration_seconds,
                input_tokens,
                output_tokens,
                error_message,
            });
        }
        Ok(attempts)
    }

    /// Daily rollups, most recent day first.
    pub fn daily_metrics(&self, days: u32) -> Result<Vec<DailyRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT day, prs_processed, successful_reviews, failed_reviews,
                        total_duration_seconds, total_tokens_used
                 FROM daily_metrics ORDER BY day DESC LIMIT ?1",
            )
            .context("Failed to prepare daily metrics query")?;
        let rows = stmt
            .query_map([days], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, u64>(5)?,
                ))
            })
            .context("Failed to query daily metrics")?;

        let mut days_out = Vec::new();
        for row in rows {
            let (day, prs_processed, successful, failed, duration, tokens) =
                row.context("Failed to read daily metrics row")?;
            days_out.push(DailyRow {
                day: NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                    .with_context(|| format!("Invalid day in database: {:?}", day))?,
                prs_processed,
                successful_reviews: successful,
                failed_reviews: failed,
                total_duration_seconds: duration,
                total_tokens_used: tokens,
            });
        }
        Ok(days_out)
    }

    pub fn llm_totals(&self) -> Result<LlmTotals> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT total_completions, total_input_tokens, total_output_tokens,
                    total_inference_seconds
             FROM llm_metrics WHERE id = 1",
            [],
            |row| {
                Ok(LlmTotals {
                    total_completions: row.get(0)?,
                    total_input_tokens: row.get(1)?,
                    total_output_tokens: row.get(2)?,
                    total_inference_seconds: row.get(3)?,
                })
            },
        )
        .context("Failed to query aggregate inference counters")
    }

    /// Reviews published for one PR, newest first.
    pub fn review_history(&self, pr_number: u64) -> Result<Vec<ReviewRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT pr_number, head_sha, sequence, reviewed_at, body, comment_id
                 FROM review_history WHERE pr_number = ?1
                 ORDER BY id DESC",
            )
            .context("Failed to prepare review history query")?;
        let rows = stmt
            .query_map([pr_number], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u64>(5)?,
                ))
            })
            .context("Failed to query review history")?;

        let mut reviews = Vec::new();
        for row in rows {
            let (pr_number, head_sha, sequence, reviewed_at, body, comment_id) =
                row.context("Failed to read review history row")?;
            reviews.push(ReviewRow {
                pr_number,
                head_sha: CommitSha(head_sha),
                sequence,
                reviewed_at: parse_timestamp(&reviewed_at)?,
                body,
                comment_id,
            });
        }
        Ok(reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn succeeded(url: &str) -> AttemptOutcome {
        AttemptOutcome::Succeeded {
            review_url: url.to_string(),
        }
    }

    fn usage(completions: u64, tokens_in: u64, tokens_out: u64) -> AttemptUsage {
        AttemptUsage {
            completions,
            tokens_in,
            tokens_out,
            inference_seconds: completions as f64 * 1.5,
        }
    }

    #[test]
    fn test_fresh_database_is_empty() {
        let db = MetricsDb::new_in_memory().expect("should create in-memory db");
        assert!(db.get_processed_pr(1).expect("query should work").is_none());
        assert!(db.recent_attempts(10).expect("query should work").is_empty());
        let totals = db.llm_totals().expect("totals row should exist");
        assert_eq!(totals.total_completions, 0);
        assert_eq!(totals.avg_latency_seconds(), 0.0);
    }

    #[test]
    fn test_begin_attempt_creates_pending_pr_and_open_attempt() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let sha = CommitSha::from("abc123def456");

        let id = db.begin_attempt(42, &sha).expect("begin should work");
        assert!(id.0 > 0);

        let pr = db
            .get_processed_pr(42)
            .expect("query should work")
            .expect("PR row should exist after begin");
        assert_eq!(pr.status, PrStatus::Pending);
        assert_eq!(pr.last_reviewed_sha, None, "nothing reviewed yet");

        let attempts = db.recent_attempts(10).expect("query should work");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::InProgress);
        assert_eq!(attempts[0].head_sha, sha);
        assert!(attempts[0].finished_at.is_none());
    }

    #[test]
    fn test_finalize_success_settles_everything() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let sha = CommitSha::from("abc123def456");

        let id = db.begin_attempt(42, &sha).expect("begin should work");
        db.finalize_attempt(
            id,
            &succeeded("https://example.com/pr/42#c1"),
            &usage(2, 800, 120),
            Some(3500),
        )
        .expect("finalize should work");

        let attempt = &db.recent_attempts(1).expect("query should work")[0];
        assert_eq!(attempt.status, AttemptStatus::Succeeded);
        assert_eq!(attempt.diff_size, Some(3500));
        assert_eq!(attempt.input_tokens, Some(800));
        assert_eq!(attempt.output_tokens, Some(120));
        assert!(attempt.finished_at.is_some());
        assert!(attempt.duration_seconds.is_some());
        assert!(attempt.error_message.is_none());

        let pr = db.get_processed_pr(42).expect("query").expect("row");
        assert_eq!(pr.status, PrStatus::Succeeded);
        assert_eq!(pr.last_reviewed_sha, Some(sha));
        assert_eq!(pr.review_url.as_deref(), Some("https://example.com/pr/42#c1"));

        let totals = db.llm_totals().expect("totals");
        assert_eq!(totals.total_completions, 2);
        assert_eq!(totals.total_input_tokens, 800);
        assert_eq!(totals.total_output_tokens, 120);
        assert!(totals.avg_latency_seconds() > 0.0);

        let daily = db.daily_metrics(7).expect("daily");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].prs_processed, 1);
        assert_eq!(daily[0].successful_reviews, 1);
        assert_eq!(daily[0].failed_reviews, 0);
        assert_eq!(daily[0].total_tokens_used, 920);
    }

    #[test]
    fn test_failure_preserves_previously_reviewed_revision() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let first = CommitSha::from("aaaa111");
        let second = CommitSha::from("bbbb222");

        let id = db.begin_attempt(7, &first).expect("begin");
        db.finalize_attempt(id, &succeeded("https://x/1"), &usage(1, 100, 10), Some(100))
            .expect("finalize");

        let id = db.begin_attempt(7, &second).expect("begin");
        db.finalize_attempt(
            id,
            &AttemptOutcome::Failed {
                error: "inference timed out after 120s".to_string(),
            },
            &usage(0, 0, 0),
            None,
        )
        .expect("finalize");

        let pr = db.get_processed_pr(7).expect("query").expect("row");
        assert_eq!(pr.status, PrStatus::Failed);
        assert_eq!(
            pr.last_reviewed_sha,
            Some(first),
            "a failed attempt must not consume the new revision"
        );
        assert_eq!(
            pr.review_url.as_deref(),
            Some("https://x/1"),
            "the old review link survives a failed attempt"
        );

        let attempt = &db.recent_attempts(1).expect("query")[0];
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(
            attempt.error_message.as_deref(),
            Some("inference timed out after 120s")
        );
    }

    #[test]
    fn test_first_sighting_failure_leaves_revision_unstored() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let sha = CommitSha::from("cccc333");

        let id = db.begin_attempt(9, &sha).expect("begin");
        db.finalize_attempt(
            id,
            &AttemptOutcome::Failed {
                error: "boom".to_string(),
            },
            &usage(0, 0, 0),
            None,
        )
        .expect("finalize");

        let pr = db.get_processed_pr(9).expect("query").expect("row");
        assert_eq!(pr.status, PrStatus::Failed);
        assert_eq!(pr.last_reviewed_sha, None, "failed first attempt stores no revision");
    }

    #[test]
    fn test_skip_consumes_the_attempted_revision() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let sha = CommitSha::from("dddd444");

        let id = db.begin_attempt(11, &sha).expect("begin");
        db.finalize_attempt(
            id,
            &AttemptOutcome::Skipped {
                error: "GitHub API error: 404 Not Found - gone".to_string(),
            },
            &usage(0, 0, 0),
            None,
        )
        .expect("finalize");

        let pr = db.get_processed_pr(11).expect("query").expect("row");
        assert_eq!(pr.status, PrStatus::Skipped);
        assert_eq!(pr.last_reviewed_sha, Some(sha), "a skip retires the revision");

        let daily = db.daily_metrics(7).expect("daily");
        assert_eq!(daily[0].prs_processed, 1);
        assert_eq!(daily[0].successful_reviews, 0);
        assert_eq!(daily[0].failed_reviews, 0, "skips are neither success nor failure");
    }

    #[test]
    fn test_double_finalize_is_rejected() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let sha = CommitSha::from("eeee555");

        let id = db.begin_attempt(3, &sha).expect("begin");
        db.finalize_attempt(id, &succeeded("https://x/3"), &usage(1, 10, 5), Some(50))
            .expect("first finalize should work");
        let err = db
            .finalize_attempt(id, &succeeded("https://x/3"), &usage(1, 10, 5), Some(50))
            .expect_err("second finalize must fail");
        assert!(err.to_string().contains("not in progress"), "got: {}", err);
    }

    #[test]
    fn test_zero_completion_attempts_leave_llm_totals_alone() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let sha = CommitSha::from("ffff666");

        let id = db.begin_attempt(5, &sha).expect("begin");
        db.finalize_attempt(
            id,
            &AttemptOutcome::Failed {
                error: "diff fetch failed".to_string(),
            },
            &usage(0, 0, 0),
            None,
        )
        .expect("finalize");

        let totals = db.llm_totals().expect("totals");
        assert_eq!(totals.total_completions, 0);
        assert_eq!(totals.total_inference_seconds, 0.0);
    }

    #[test]
    fn test_daily_rollup_accumulates_same_day_attempts() {
        let db = MetricsDb::new_in_memory().expect("should create db");

        let id = db.begin_attempt(1, &CommitSha::from("a1")).expect("begin");
        db.finalize_attempt(id, &succeeded("https://x/1"), &usage(1, 100, 20), Some(10))
            .expect("finalize");
        let id = db.begin_attempt(2, &CommitSha::from("b2")).expect("begin");
        db.finalize_attempt(
            id,
            &AttemptOutcome::Failed {
                error: "nope".to_string(),
            },
            &usage(1, 50, 0),
            Some(20),
        )
        .expect("finalize");

        let daily = db.daily_metrics(7).expect("daily");
        assert_eq!(daily.len(), 1, "both attempts started on the same UTC day");
        assert_eq!(daily[0].prs_processed, 2);
        assert_eq!(daily[0].successful_reviews, 1);
        assert_eq!(daily[0].failed_reviews, 1);
        assert_eq!(daily[0].total_tokens_used, 170);
        assert!(daily[0].avg_duration_seconds() >= 0.0);
    }

    #[test]
    fn test_review_sequence_restarts_per_revision() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        let first = CommitSha::from("1111aaa");
        let second = CommitSha::from("2222bbb");

        db.record_review(42, &first, "first body", 100).expect("record");
        db.record_review(42, &first, "second body", 101).expect("record");
        db.record_review(42, &second, "third body", 102).expect("record");

        let history = db.review_history(42).expect("history");
        assert_eq!(history.len(), 3);
        // Newest first.
        assert_eq!(history[0].comment_id, 102);
        assert_eq!(history[0].sequence, 1, "a new revision starts a new sequence");
        assert_eq!(history[1].comment_id, 101);
        assert_eq!(history[1].sequence, 2);
        assert_eq!(history[2].sequence, 1);

        assert!(db.review_history(999).expect("history").is_empty());
    }

    #[test]
    fn test_mark_stale_attempts_failed_touches_only_open_attempts() {
        let db = MetricsDb::new_in_memory().expect("should create db");

        let done = db.begin_attempt(1, &CommitSha::from("a1")).expect("begin");
        db.finalize_attempt(done, &succeeded("https://x/1"), &usage(1, 10, 5), Some(5))
            .expect("finalize");
        db.begin_attempt(2, &CommitSha::from("b2")).expect("begin");
        db.begin_attempt(3, &CommitSha::from("c3")).expect("begin");

        let reconciled = db
            .mark_stale_attempts_failed("interrupted by daemon restart")
            .expect("reconcile");
        assert_eq!(reconciled, 2);

        let attempts = db.recent_attempts(10).expect("query");
        assert_eq!(attempts.len(), 3);
        for attempt in &attempts {
            assert_ne!(attempt.status, AttemptStatus::InProgress);
        }
        let succeeded_row = attempts.iter().find(|a| a.pr_number == 1).expect("row");
        assert_eq!(succeeded_row.status, AttemptStatus::Succeeded);
        let stale = attempts.iter().find(|a| a.pr_number == 2).expect("row");
        assert_eq!(stale.status, AttemptStatus::Failed);
        assert_eq!(
            stale.error_message.as_deref(),
            Some("interrupted by daemon restart")
        );

        let again = db
            .mark_stale_attempts_failed("interrupted by daemon restart")
            .expect("reconcile");
        assert_eq!(again, 0, "reconciliation is idempotent");
    }

    #[test]
    fn test_recent_attempts_orders_newest_first_and_limits() {
        let db = MetricsDb::new_in_memory().expect("should create db");
        for pr in 1..=3u64 {
            db.begin_attempt(pr, &CommitSha::from("sha")).expect("begin");
        }
        let attempts = db.recent_attempts(2).expect("query");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].pr_number, 3);
        assert_eq!(attempts[1].pr_number, 2);
    }

    #[test]
    fn test_schema_version_is_recorded_and_reopen_is_idempotent() {
        let path = std::env::temp_dir().join(format!("test_dbcritic_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let db = MetricsDb::new(&path).expect("should create db");
            db.begin_attempt(1, &CommitSha::from("abc")).expect("begin");
            let conn = db.conn.lock().expect("mutex poisoned");
            let version: i32 = conn
                .pragma_query_value(None, "user_version", |row| row.get(0))
                .expect("should read version");
            assert_eq!(version, SCHEMA_VERSION);
        }
        {
            // Re-opening must not error or lose data.
            let db = MetricsDb::new(&path).expect("should reopen db");
            assert_eq!(db.recent_attempts(10).expect("query").len(), 1);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_newer_schema_version_is_rejected() {
        let path =
            std::env::temp_dir().join(format!("test_dbcritic_newer_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let conn = Connection::open(&path).expect("should open");
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .expect("should set version");
        }
        let err = MetricsDb::new(&path).expect_err("newer schema must be rejected");
        assert!(err.to_string().contains("newer than supported"), "got: {}", err);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_only_handle_reads_but_cannot_write() {
        let path = std::env::temp_dir().join(format!("test_dbcritic_ro_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let db = MetricsDb::new(&path).expect("should create db");
            let id = db.begin_attempt(42, &CommitSha::from("abc123")).expect("begin");
            db.finalize_attempt(id, &succeeded("https://x/42"), &usage(1, 10, 5), Some(5))
                .expect("finalize");
        }

        let ro = MetricsDb::open_read_only(&path).expect("read-only open should work");
        let attempts = ro.recent_attempts(10).expect("reads should work");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].pr_number, 42);
        assert!(
            ro.begin_attempt(43, &CommitSha::from("def")).is_err(),
            "writes through a read-only handle must fail"
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_only_rejects_uninitialised_file() {
        let path =
            std::env::temp_dir().join(format!("test_dbcritic_empty_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            // A bare SQLite file with no schema, as if the daemon never ran.
            let _conn = Connection::open(&path).expect("should open");
        }
        let err = MetricsDb::open_read_only(&path).expect_err("schema version 0 must be rejected");
        assert!(err.to_string().contains("Run the daemon once"), "got: {}", err);

        let _ = std::fs::remove_file(&path);
    }
}
