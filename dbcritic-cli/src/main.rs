//! Read-only dashboard over the review daemon's metrics store.
//!
//! Opens the SQLite file the daemon writes and prints what an operator
//! checks most: aggregate counters, recent attempts, daily rollups and
//! the reviews posted for one PR. Never writes; safe to run while the
//! daemon is up.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use dbcritic_daemon::db::MetricsDb;

#[derive(Parser, Debug)]
#[command(name = "dbcritic")]
#[command(about = "Inspect database performance review metrics", long_about = None)]
struct Cli {
    /// Path to the metrics store written by the daemon
    #[arg(long, default_value = "data/pr_tracker.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Aggregate inference counters plus the most recent attempts
    Summary,
    /// Recent processing attempts
    Recent(RecentArgs),
    /// Per-day rollups
    Daily(DailyArgs),
    /// Reviews posted for one pull request
    History(HistoryArgs),
}

#[derive(Args, Debug)]
struct RecentArgs {
    /// Number of attempts to show
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Args, Debug)]
struct DailyArgs {
    /// Number of days to show
    #[arg(long, default_value_t = 7)]
    days: u32,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Pull request number
    pr_number: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let db = MetricsDb::open_read_only(&cli.db_path)
        .with_context(|| format!("Failed to open metrics store at {}", cli.db_path.display()))?;

    match cli.command {
        Commands::Summary => print_summary(&db),
        Commands::Recent(args) => print_recent(&db, args.limit),
        Commands::Daily(args) => print_daily(&db, args.days),
        Commands::History(args) => print_history(&db, args.pr_number),
    }
}

fn print_summary(db: &MetricsDb) -> Result<()> {
    let totals = db.llm_totals()?;
    println!("Completions:   {}", totals.total_completions);
    println!("Input tokens:  {}", totals.total_input_tokens);
    println!("Output tokens: {}", totals.total_output_tokens);
    println!("Avg latency:   {:.1}s", totals.avg_latency_seconds());
    println!();
    print_recent(db, 10)
}

fn print_recent(db: &MetricsDb, limit: u32) -> Result<()> {
    let attempts = db.recent_attempts(limit)?;
    if attempts.is_empty() {
        println!("No attempts recorded yet.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<11}  {:>9}  {:>8}  {:<20}  {}",
        "PR", "STATUS", "DURATION", "TOKENS", "STARTED", "ERROR"
    );
    for a in attempts {
        let duration = a
            .duration_seconds
            .map(|d| format!("{:.1}s", d))
            .unwrap_or_else(|| "-".to_string());
        let tokens = match (a.input_tokens, a.output_tokens) {
            (Some(i), Some(o)) => (i + o).to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:>6}  {:<11}  {:>9}  {:>8}  {:<20}  {}",
            a.pr_number,
            a.status.as_str(),
            duration,
            tokens,
            a.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            a.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_daily(db: &MetricsDb, days: u32) -> Result<()> {
    let rows = db.daily_metrics(days)?;
    if rows.is_empty() {
        println!("No daily metrics recorded yet.");
        return Ok(());
    }

    println!(
        "{:<12}  {:>9}  {:>9}  {:>7}  {:>9}  {:>10}",
        "DAY", "PROCESSED", "SUCCEEDED", "FAILED", "AVG TIME", "TOKENS"
    );
    for r in rows {
        println!(
            "{:<12}  {:>9}  {:>9}  {:>7}  {:>8.1}s  {:>10}",
            r.day.to_string(),
            r.prs_processed,
            r.successful_reviews,
            r.failed_reviews,
            r.avg_duration_seconds(),
            r.total_tokens_used
        );
    }
    Ok(())
}

fn print_history(db: &MetricsDb, pr_number: u64) -> Result<()> {
    let reviews = db.review_history(pr_number)?;
    if reviews.is_empty() {
        println!("No reviews recorded for PR #{}.", pr_number);
        return Ok(());
    }

    for r in reviews {
        println!(
            "PR #{} at {} (review {} of that revision, comment {}, {})",
            r.pr_number,
            r.head_sha.short(),
            r.sequence,
            r.comment_id,
            r.reviewed_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
        println!("{}", r.body);
        println!("{}", "-".repeat(72));
    }
    Ok(())
}
