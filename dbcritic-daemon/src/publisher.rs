//! Renders findings into one PR comment and delivers it.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use dbcritic_core::findings::{Finding, Severity};
use dbcritic_core::CommitSha;

use crate::github::{ApiError, PostedComment, PullRequestApi};
use crate::store::MetricsStore;

/// Failure to deliver a finished review.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to post review comment: {0}")]
    Api(#[from] ApiError),
    /// The comment is on GitHub but the history row was not written.
    /// Durable state is suspect at this point, so callers treat this as
    /// fatal rather than as a per-item failure.
    #[error("review posted but history write failed: {0}")]
    History(anyhow::Error),
}

fn severity_heading(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "Critical issues",
        Severity::Warning => "Warnings",
        Severity::Info => "Informational",
    }
}

/// Render findings into one comment body, most severe group first. Order
/// within a group is preserved, so findings stay in diff order.
pub fn format_review_comment(
    findings: &[Finding],
    head_sha: &CommitSha,
    unparsed_chunks: usize,
) -> String {
    let mut body = String::from("🤖 **Database performance review**\n\n");

    if findings.is_empty() {
        body.push_str("✅ No database performance concerns found in this revision.\n");
    } else {
        let mut sorted: Vec<&Finding> = findings.iter().collect();
        sorted.sort_by(|a, b| b.severity.cmp(&a.severity));

        let mut current: Option<Severity> = None;
        for finding in sorted {
            if current != Some(finding.severity) {
                if current.is_some() {
                    body.push('\n');
                }
                current = Some(finding.severity);
                body.push_str(&format!("### {}\n\n", severity_heading(finding.severity)));
            }
            match (&finding.file, finding.line) {
                (Some(file), Some(line)) => {
                    body.push_str(&format!("- `{}:{}`: {}\n", file, line, finding.note))
                }
                (Some(file), None) => body.push_str(&format!("- `{}`: {}\n", file, finding.note)),
                _ => body.push_str(&format!("- {}\n", finding.note)),
            }
        }
    }

    if unparsed_chunks > 0 {
        body.push_str(&format!(
            "\n_{} diff chunk(s) produced output that could not be parsed; this review may be partial._\n",
            unparsed_chunks
        ));
    }

    body.push_str(&format!("\n**Commit:** `{}`\n", head_sha.short()));
    body
}

/// Posts rendered findings as one PR comment and records the history row.
/// The only writer of review history in the process.
pub struct ReviewPublisher {
    github: Arc<dyn PullRequestApi>,
    store: MetricsStore,
}

impl ReviewPublisher {
    pub fn new(github: Arc<dyn PullRequestApi>, store: MetricsStore) -> Self {
        Self { github, store }
    }

    /// Publish one review. An empty finding list still publishes, as an
    /// explicit all-clear.
    pub async fn publish(
        &self,
        pr_number: u64,
        head_sha: &CommitSha,
        findings: &[Finding],
        unparsed_chunks: usize,
    ) -> Result<PostedComment, PublishError> {
        let body = format_review_comment(findings, head_sha, unparsed_chunks);
        let comment = self.github.post_comment(pr_number, &body).await?;
        self.store
            .record_review(pr_number, head_sha.clone(), body, comment.id)
            .await
            .map_err(PublishError::History)?;
        info!(
            "Published review for PR #{} at {} ({} findings, comment {})",
            pr_number,
            head_sha.short(),
            findings.len(),
            comment.id
        );
        Ok(comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use crate::db::MetricsDb;
    use crate::github::PullRequest;

    fn finding(severity: Severity, file: Option<&str>, line: Option<u64>, note: &str) -> Finding {
        Finding {
            severity,
            file: file.map(str::to_string),
            line,
            note: note.to_string(),
        }
    }

    #[test]
    fn test_empty_findings_render_an_all_clear() {
        let body = format_review_comment(&[], &CommitSha::from("abc123def456"), 0);
        assert!(body.contains("No database performance concerns"));
        assert!(body.contains("**Commit:** `abc123d`"));
        assert!(!body.contains("###"), "no severity sections for a clean review");
    }

    #[test]
    fn test_findings_are_grouped_most_severe_first() {
        let findings = vec![
            finding(Severity::Info, None, None, "schema comment updated"),
            finding(Severity::Critical, Some("src/db.rs"), Some(42), "table scan per request"),
            finding(Severity::Warning, Some("src/repo.rs"), None, "unbatched writes"),
            finding(Severity::Critical, Some("src/db.rs"), Some(90), "lock held across await"),
        ];
        let body = format_review_comment(&findings, &CommitSha::from("abc123def456"), 0);

        let critical = body.find("### Critical issues").expect("critical section");
        let warning = body.find("### Warnings").expect("warning section");
        let info = body.find("### Informational").expect("info section");
        assert!(critical < warning && warning < info);

        // Within a group the original (diff) order is preserved.
        let first = body.find("src/db.rs:42").expect("first critical");
        let second = body.find("src/db.rs:90").expect("second critical");
        assert!(first < second);

        assert!(body.contains("- `src/repo.rs`: unbatched writes"));
        assert!(body.contains("- schema comment updated"));
    }

    #[test]
    fn test_unparsed_chunks_are_called_out() {
        let body = format_review_comment(&[], &CommitSha::from("abc123def456"), 2);
        assert!(body.contains("2 diff chunk(s)"));
        assert!(body.contains("may be partial"));
    }

    struct FakeApi {
        fail_post: AtomicBool,
        posted: StdMutex<Vec<(u64, String)>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                fail_post: AtomicBool::new(false),
                posted: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PullRequestApi for FakeApi {
        async fn list_open_prs(&self) -> Result<Vec<PullRequest>, ApiError> {
            Ok(Vec::new())
        }

        async fn get_diff(&self, _pr_number: u64) -> Result<String, ApiError> {
            Ok(String::new())
        }

        async fn post_comment(
            &self,
            pr_number: u64,
            body: &str,
        ) -> Result<PostedComment, ApiError> {
            if self.fail_post.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    status: StatusCode::FORBIDDEN,
                    message: "locked".to_string(),
                });
            }
            self.posted
                .lock()
                .expect("test mutex poisoned")
                .push((pr_number, body.to_string()));
            Ok(PostedComment {
                id: 1000 + pr_number,
                html_url: format!("https://example.com/pull/{}#issuecomment-1", pr_number),
            })
        }
    }

    #[tokio::test]
    async fn test_publish_posts_and_records_history() {
        let api = Arc::new(FakeApi::new());
        let db = Arc::new(MetricsDb::new_in_memory().expect("should create db"));
        let publisher = ReviewPublisher::new(api.clone(), MetricsStore::new(db.clone()));
        let sha = CommitSha::from("abc123def456");

        let findings = vec![finding(Severity::Warning, Some("src/a.rs"), Some(3), "n+1 query")];
        let comment = publisher
            .publish(42, &sha, &findings, 0)
            .await
            .expect("publish should work");
        assert_eq!(comment.id, 1042);

        let posted = api.posted.lock().expect("test mutex poisoned");
        assert_eq!(posted.len(), 1);
        assert!(posted[0].1.contains("n+1 query"));

        let history = db.review_history(42).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].comment_id, 1042);
        assert_eq!(history[0].head_sha, sha);
        assert_eq!(history[0].body, posted[0].1, "stored body matches the posted comment");
    }

    #[tokio::test]
    async fn test_publish_failure_writes_no_history() {
        let api = Arc::new(FakeApi::new());
        api.fail_post.store(true, Ordering::SeqCst);
        let db = Arc::new(MetricsDb::new_in_memory().expect("should create db"));
        let publisher = ReviewPublisher::new(api.clone(), MetricsStore::new(db.clone()));

        let err = publisher
            .publish(42, &CommitSha::from("abc"), &[], 0)
            .await
            .expect_err("publish should fail");
        match err {
            PublishError::Api(e) => assert!(!e.is_retryable(), "403 is permanent"),
            other => panic!("expected api error, got {:?}", other),
        }
        assert!(db.review_history(42).expect("history").is_empty());
    }
}
