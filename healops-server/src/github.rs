//! GitHub integration: fix-proposal branch + PR lifecycle with drift
//! protection.
//!
//! Only active when PR automation is enabled and a token is configured;
//! otherwise PR creation is a no-op and runs keep `prState = none`.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{Attempt, Run};

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Minimal git-host surface needed for the PR lifecycle. The production
/// implementation is `GitHubClient`; tests use a stub.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Current head commit SHA of a branch.
    async fn branch_head(&self, repository: &str, branch: &str) -> Result<String>;

    async fn create_branch(&self, repository: &str, name: &str, from_sha: &str) -> Result<()>;

    async fn commit_file(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<()>;

    async fn open_pull_request(
        &self,
        repository: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedPullRequest>;

    /// Squash-merge an open pull request.
    async fn merge_pull_request(&self, repository: &str, number: u64) -> Result<()>;

    async fn close_pull_request(&self, repository: &str, number: u64) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedPullRequest {
    pub number: u64,
    pub html_url: String,
}

// =============================================================================
// GitHub REST client
// =============================================================================

pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Debug, Deserialize)]
struct BranchCommit {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePullRequestBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    merge_method: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdatePullRequest<'a> {
    state: &'a str,
}

impl GitHubClient {
    pub fn new(token: String) -> Self {
        Self::with_api_base(token, GITHUB_API_BASE)
    }

    pub fn with_api_base(token: String, api_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("healops/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            token,
            api_base: api_base.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
    }

    async fn check(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .context("Failed to read error response body")?;
        Err(anyhow!(
            "GitHub API error during {}: {} - {}",
            operation,
            status,
            error_text
        ))
    }
}

#[async_trait]
impl GitHost for GitHubClient {
    async fn branch_head(&self, repository: &str, branch: &str) -> Result<String> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repository}/branches/{branch}"),
            )
            .send()
            .await
            .context("Failed to fetch branch")?;
        let response = Self::check(response, "branch_head").await?;
        let branch: BranchResponse = response
            .json()
            .await
            .context("Failed to parse branch response")?;
        Ok(branch.commit.sha)
    }

    async fn create_branch(&self, repository: &str, name: &str, from_sha: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repository}/git/refs"),
            )
            .json(&CreateRefRequest {
                ref_name: format!("refs/heads/{name}"),
                sha: from_sha,
            })
            .send()
            .await
            .context("Failed to create branch")?;
        Self::check(response, "create_branch").await?;
        Ok(())
    }

    async fn commit_file(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{repository}/contents/{path}"),
            )
            .json(&PutContentsRequest {
                message,
                content: general_purpose::STANDARD.encode(content),
                branch,
            })
            .send()
            .await
            .context("Failed to commit file")?;
        Self::check(response, "commit_file").await?;
        Ok(())
    }

    async fn open_pull_request(
        &self,
        repository: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedPullRequest> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{repository}/pulls"))
            .json(&CreatePullRequestBody {
                title,
                head,
                base,
                body,
            })
            .send()
            .await
            .context("Failed to open pull request")?;
        let response = Self::check(response, "open_pull_request").await?;
        response
            .json()
            .await
            .context("Failed to parse pull request response")
    }

    async fn merge_pull_request(&self, repository: &str, number: u64) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{repository}/pulls/{number}/merge"),
            )
            .json(&MergeRequest {
                merge_method: "squash",
            })
            .send()
            .await
            .context("Failed to merge pull request")?;
        Self::check(response, "merge_pull_request").await?;
        Ok(())
    }

    async fn close_pull_request(&self, repository: &str, number: u64) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/repos/{repository}/pulls/{number}"),
            )
            .json(&UpdatePullRequest { state: "closed" })
            .send()
            .await
            .context("Failed to close pull request")?;
        Self::check(response, "close_pull_request").await?;
        Ok(())
    }
}

// =============================================================================
// PR automation
// =============================================================================

/// Result of attempting to open a fix PR.
#[derive(Debug, Clone)]
pub enum PrCreation {
    Opened {
        url: String,
        number: u64,
        branch: String,
    },
    /// Drift check failed: the base branch moved past the failing commit.
    Skipped { reason: String },
    /// PR automation is off.
    Disabled,
}

pub struct PrAutomation {
    host: Option<Arc<dyn GitHost>>,
    base_branch: String,
}

impl PrAutomation {
    pub fn new(host: Option<Arc<dyn GitHost>>, base_branch: impl Into<String>) -> Self {
        Self {
            host,
            base_branch: base_branch.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            host: None,
            base_branch: "main".to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.host.is_some()
    }

    /// Open a fix-proposal PR for a fixed run.
    ///
    /// Re-reads the base branch's head first; if it no longer equals the
    /// run's commit the failure context is stale and PR creation is skipped.
    pub async fn open_fix_pr(&self, run: &Run, attempt: &Attempt) -> Result<PrCreation> {
        let Some(host) = &self.host else {
            return Ok(PrCreation::Disabled);
        };

        let head = host.branch_head(&run.repository, &self.base_branch).await?;
        if head != run.commit_sha.0 {
            return Ok(PrCreation::Skipped {
                reason: format!(
                    "branch {} moved to {} past failing commit {}",
                    self.base_branch,
                    &head[..7.min(head.len())],
                    run.commit_sha.short()
                ),
            });
        }

        let branch = format!(
            "healops/{}-a{}-{}",
            run.id.short(),
            attempt.attempt_no,
            Utc::now().timestamp()
        );
        host.create_branch(&run.repository, &branch, &head).await?;

        let path = format!(".healops/{}-a{}.md", run.id.short(), attempt.attempt_no);
        host.commit_file(
            &run.repository,
            &branch,
            &path,
            &proposal_markdown(run, attempt),
            &format!("healops: fix proposal for {}", run.commit_sha.short()),
        )
        .await?;

        let title = format!(
            "HealOps: {} fix proposal ({})",
            run.error_type,
            run.commit_sha.short()
        );
        let pr = host
            .open_pull_request(
                &run.repository,
                &branch,
                &self.base_branch,
                &title,
                &pr_body(run),
            )
            .await?;

        info!(
            "Opened fix PR #{} for run {} on {}",
            pr.number, run.id, run.repository
        );

        Ok(PrCreation::Opened {
            url: pr.html_url,
            number: pr.number,
            branch,
        })
    }

    /// Squash-merge the run's open PR. Returns false when there is nothing
    /// to merge (no host, or no PR number on the run).
    pub async fn merge_pr(&self, run: &Run) -> Result<bool> {
        let (Some(host), Some(number)) = (&self.host, run.pr_number) else {
            return Ok(false);
        };
        host.merge_pull_request(&run.repository, number).await?;
        Ok(true)
    }

    /// Close the run's open PR. Returns false when there is nothing to close.
    pub async fn close_pr(&self, run: &Run) -> Result<bool> {
        let (Some(host), Some(number)) = (&self.host, run.pr_number) else {
            return Ok(false);
        };
        host.close_pull_request(&run.repository, number).await?;
        Ok(true)
    }
}

/// The Markdown proposal file committed to the fix branch.
pub fn proposal_markdown(run: &Run, attempt: &Attempt) -> String {
    format!(
        "# HealOps Fix Proposal\n\n\
         | | |\n|---|---|\n\
         | Run | `{}` |\n\
         | Repository | {} |\n\
         | Branch | {} |\n\
         | Commit | `{}` |\n\
         | Attempt | {} of {} |\n\
         | Error type | {} |\n\n\
         ## Error Summary\n\n{}\n\n\
         ## Diagnosis\n\n{}\n\n\
         ## Proposed Fix\n\n{}\n\n\
         ## Validation\n\n```\n{}\n```\n",
        run.id,
        run.repository,
        run.branch,
        run.commit_sha,
        attempt.attempt_no,
        run.max_attempts,
        run.error_type,
        run.error_summary,
        attempt.diagnosis.as_deref().unwrap_or("(none)"),
        attempt.proposed_fix.as_deref().unwrap_or("(none)"),
        attempt.validation_log.as_deref().unwrap_or("(not run)"),
    )
}

fn pr_body(run: &Run) -> String {
    format!(
        "Automated fix proposal for a CI failure on `{}` at `{}`.\n\n\
         **Error summary:** {}\n\n\
         The full diagnosis, fix strategy, and validation log are in the \
         committed proposal file. Review before merging; approving the run \
         squash-merges this PR.",
        run.branch, run.commit_sha, run.error_summary
    )
}
