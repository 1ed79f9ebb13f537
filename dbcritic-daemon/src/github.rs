//! GitHub REST API client, reduced to the three calls the daemon makes.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "dbcritic";

/// Errors from the GitHub API, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never completed (connect failure, timeout, TLS).
    #[error("GitHub request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// GitHub answered with a non-success status.
    #[error("GitHub API error: {status} - {message}")]
    Status { status: StatusCode, message: String },
}

impl ApiError {
    /// Whether waiting for the next poll cycle can plausibly fix this.
    /// Server errors and rate limiting pass; bad credentials, a missing
    /// PR or a rejected payload will not improve on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// One open pull request as listed by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub head: PullRequestHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestHead {
    pub sha: String,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest {
    body: String,
}

/// The comment GitHub created for a published review.
#[derive(Debug, Clone, Deserialize)]
pub struct PostedComment {
    pub id: u64,
    pub html_url: String,
}

/// Capability surface the scheduler needs from GitHub. The daemon talks to
/// the real API through [`GithubClient`]; tests substitute their own.
#[async_trait]
pub trait PullRequestApi: Send + Sync {
    /// List open pull requests with their head revisions.
    async fn list_open_prs(&self) -> Result<Vec<PullRequest>, ApiError>;
    /// Fetch the unified diff for one pull request.
    async fn get_diff(&self, pr_number: u64) -> Result<String, ApiError>;
    /// Post an issue comment on a pull request.
    async fn post_comment(&self, pr_number: u64, body: &str) -> Result<PostedComment, ApiError>;
}

pub struct GithubClient {
    client: Client,
    token: String,
    owner: String,
    repo: String,
}

impl GithubClient {
    pub fn new(token: String, owner: String, repo: String) -> Self {
        Self {
            client: Client::new(),
            token,
            owner,
            repo,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str, accept: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", accept)
            .header("User-Agent", USER_AGENT)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        error!("GitHub API error: {} - {}", status, message);
        Err(ApiError::Status { status, message })
    }
}

#[async_trait]
impl PullRequestApi for GithubClient {
    async fn list_open_prs(&self) -> Result<Vec<PullRequest>, ApiError> {
        let url = format!(
            "{}/repos/{}/{}/pulls?state=open",
            GITHUB_API_BASE, self.owner, self.repo
        );
        let response = self
            .request(reqwest::Method::GET, &url, "application/vnd.github.v3+json")
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let prs: Vec<PullRequest> = response.json().await?;
        info!("Listed {} open pull requests", prs.len());
        Ok(prs)
    }

    async fn get_diff(&self, pr_number: u64) -> Result<String, ApiError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}",
            GITHUB_API_BASE, self.owner, self.repo, pr_number
        );
        let response = self
            .request(reqwest::Method::GET, &url, "application/vnd.github.v3.diff")
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let diff = response.text().await?;
        info!("Fetched diff for PR #{} ({} bytes)", pr_number, diff.len());
        Ok(diff)
    }

    async fn post_comment(&self, pr_number: u64, body: &str) -> Result<PostedComment, ApiError> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            GITHUB_API_BASE, self.owner, self.repo, pr_number
        );
        let request_body = CreateCommentRequest {
            body: body.to_string(),
        };
        let response = self
            .request(reqwest::Method::POST, &url, "application/vnd.github.v3+json")
            .json(&request_body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let comment: PostedComment = response.json().await?;
        info!("Posted comment {} on PR #{}", comment.id, pr_number);
        Ok(comment)
    }
}
