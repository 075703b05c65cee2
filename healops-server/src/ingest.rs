//! Webhook ingestion: signature check, error summarization, fingerprint
//! dedup, run creation, and first-attempt enqueue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;

use crate::bus::EventRecorder;
use crate::metrics::Metrics;
use crate::model::{Actor, CommitSha, PrState, ResolvedBy, Run, RunId, RunStatus};
use crate::notify::ChatNotifier;
use crate::queue::{AttemptJob, AttemptQueue, QueueError};
use crate::repository::{RepositoryError, RunRepository};

/// Error summary bounds: first 5 non-empty lines, capped at 1000 chars.
const SUMMARY_LINES: usize = 5;
const SUMMARY_CAP: usize = 1000;

/// Incoming CI failure webhook.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub provider: String,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    #[serde(default)]
    pub pipeline_url: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    pub error_log: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub run_id: RunId,
    pub status: RunStatus,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("healing is disabled by configuration")]
    Disabled,

    #[error("invalid or missing webhook signature")]
    InvalidSignature,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Summarize a raw error log: first 5 non-empty trimmed lines joined with
/// `" | "`, truncated to 1000 characters.
pub fn summarize_error_log(error_log: &str) -> String {
    let summary = error_log
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(SUMMARY_LINES)
        .collect::<Vec<_>>()
        .join(" | ");
    summary.chars().take(SUMMARY_CAP).collect()
}

/// Compute the dedup fingerprint: `sha256("{type|unknown}|{lower(summary)}")`.
pub fn error_fingerprint(error_type: Option<&str>, summary: &str) -> String {
    let error_type = error_type.unwrap_or("unknown");
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(summary.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the webhook signature: `hex(sha256(secret + ":" + payload))`.
///
/// This is the sender's original keyed-hash construction, kept verbatim for
/// compatibility; it is deliberately not a standard HMAC.
pub fn compute_signature(secret: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time signature verification.
pub fn verify_signature(secret: &str, payload: &str, provided: &str) -> bool {
    let expected = {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(b":");
        hasher.update(payload.as_bytes());
        hasher.finalize()
    };

    let provided_bytes = match hex::decode(provided) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    expected.as_slice().ct_eq(provided_bytes.as_slice()).into()
}

pub struct Ingestor {
    enabled: bool,
    secret: Option<String>,
    max_attempts: u32,
    repository: Arc<dyn RunRepository>,
    queue: Arc<dyn AttemptQueue>,
    events: Arc<EventRecorder>,
    metrics: Arc<Metrics>,
    notifier: Arc<ChatNotifier>,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        secret: Option<String>,
        max_attempts: u32,
        repository: Arc<dyn RunRepository>,
        queue: Arc<dyn AttemptQueue>,
        events: Arc<EventRecorder>,
        metrics: Arc<Metrics>,
        notifier: Arc<ChatNotifier>,
    ) -> Self {
        Self {
            enabled,
            secret,
            max_attempts,
            repository,
            queue,
            events,
            metrics,
            notifier,
        }
    }

    /// Ingest one CI failure webhook.
    ///
    /// The disabled-feature check and the signature check run before any
    /// side effect. A duplicate (repository, commitSha, errorHash) triple is
    /// reported against the existing run without creating anything.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        signature: Option<&str>,
    ) -> Result<IngestResponse, IngestError> {
        if !self.enabled {
            return Err(IngestError::Disabled);
        }

        if let Some(secret) = &self.secret {
            let valid = signature
                .map(|sig| verify_signature(secret, &request.error_log, sig))
                .unwrap_or(false);
            if !valid {
                return Err(IngestError::InvalidSignature);
            }
        }

        self.metrics.incr("webhook.received");

        let summary = summarize_error_log(&request.error_log);
        let error_hash = error_fingerprint(request.error_type.as_deref(), &summary);
        let commit_sha = CommitSha::from(request.commit_sha.as_str());

        if let Some(existing) = self
            .repository
            .find_by_fingerprint(&request.repository, &commit_sha, &error_hash)
            .await?
        {
            info!(
                "Webhook deduplicated against run {} ({})",
                existing.id, existing.status
            );
            self.metrics.incr("webhook.deduplicated");
            return Ok(IngestResponse {
                run_id: existing.id,
                status: existing.status,
                deduplicated: true,
            });
        }

        let now = chrono::Utc::now();
        let run = Run {
            id: RunId::generate(),
            provider: request.provider,
            repository: request.repository,
            branch: request.branch,
            commit_sha,
            pipeline_url: request.pipeline_url,
            error_hash,
            error_type: request
                .error_type
                .unwrap_or_else(|| "unknown".to_string()),
            error_summary: summary,
            status: RunStatus::Queued,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            pr_url: None,
            pr_number: None,
            pr_state: PrState::None,
            pr_branch: None,
            ai_provider: None,
            ai_model: None,
            resolved_by: ResolvedBy::None,
            human_note: None,
            escalation_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.repository.insert_run(&run).await?;
        self.metrics.incr("run.created");

        self.events
            .record(
                &run.id,
                "run.created",
                Actor::System,
                format!("CI failure run created for {}", run.repository),
                serde_json::json!({
                    "repository": run.repository,
                    "branch": run.branch,
                    "commitSha": run.commit_sha,
                    "errorType": run.error_type,
                    "errorSummary": run.error_summary,
                }),
            )
            .await;
        self.events
            .record(
                &run.id,
                "run.queued",
                Actor::System,
                "attempt 1 queued",
                serde_json::json!({ "attempt": 1 }),
            )
            .await;

        self.queue
            .enqueue(AttemptJob {
                run_id: run.id.clone(),
                attempt: 1,
            })
            .await?;

        self.notifier
            .notify(
                &format!(
                    "New CI failure run for {} ({}): {}",
                    run.repository,
                    run.commit_sha.short(),
                    run.error_summary
                ),
                Some(&run),
            )
            .await;

        Ok(IngestResponse {
            run_id: run.id,
            status: RunStatus::Queued,
            deduplicated: false,
        })
    }
}
