//! Repository abstraction for run persistence.
//!
//! `RunRepository` abstracts storage of runs, their attempt ledger, and the
//! durable event log. Two backends exist: `InMemoryRepository` (tests,
//! ephemeral deployments) and `SqliteRepository` (persistent).

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    Attempt, AttemptStatus, CommitSha, NewEvent, Run, RunEvent, RunId, RunStatus,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {0} in database")]
    Corruption(&'static str),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        Self::Corruption(what)
    }
}

/// Filter for run listing.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub repository: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

/// One page of runs plus the total matching count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPage {
    pub runs: Vec<Run>,
    pub total: usize,
}

/// Aggregate run counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCounts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub fixed: usize,
    pub escalated: usize,
    pub aborted: usize,
    pub resolved: usize,
}

impl SummaryCounts {
    pub fn record(&mut self, status: RunStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: RunStatus, n: usize) {
        self.total += n;
        match status {
            RunStatus::Queued => self.queued += n,
            RunStatus::Running => self.running += n,
            RunStatus::Fixed => self.fixed += n,
            RunStatus::Escalated => self.escalated += n,
            RunStatus::Aborted => self.aborted += n,
            RunStatus::Resolved => self.resolved += n,
        }
    }
}

/// Per-repository aggregate metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMetrics {
    pub repository: String,
    pub total_runs: usize,
    pub fixed: usize,
    pub escalated: usize,
    pub resolved: usize,
    pub aborted: usize,
    pub active: usize,
    pub total_attempts: usize,
}

/// Fields for a new attempt row (id and timestamp assigned by storage).
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub run_id: RunId,
    pub attempt_no: u32,
    pub status: AttemptStatus,
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert a freshly created run.
    async fn insert_run(&self, run: &Run) -> Result<(), RepositoryError>;

    /// Get a run by id.
    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, RepositoryError>;

    /// Dedup lookup by the (repository, commitSha, errorHash) fingerprint.
    async fn find_by_fingerprint(
        &self,
        repository: &str,
        commit_sha: &CommitSha,
        error_hash: &str,
    ) -> Result<Option<Run>, RepositoryError>;

    /// Persist updated run fields (keyed by id).
    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError>;

    /// List runs matching the filter, newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, RepositoryError>;

    /// Append a new attempt row.
    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<Attempt, RepositoryError>;

    /// Persist updated attempt fields (keyed by id).
    async fn update_attempt(&self, attempt: &Attempt) -> Result<(), RepositoryError>;

    /// All attempts for a run, in attempt order.
    async fn attempts_for_run(&self, run_id: &RunId) -> Result<Vec<Attempt>, RepositoryError>;

    /// Append an event to the durable log.
    async fn append_event(&self, event: NewEvent) -> Result<RunEvent, RepositoryError>;

    /// Events for a run in creation order, capped at `limit`.
    async fn events_for_run(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> Result<Vec<RunEvent>, RepositoryError>;

    /// Aggregate counts by status across all runs.
    async fn summary_counts(&self) -> Result<SummaryCounts, RepositoryError>;

    /// Per-repository aggregates.
    async fn repository_metrics(&self) -> Result<Vec<RepositoryMetrics>, RepositoryError>;
}
