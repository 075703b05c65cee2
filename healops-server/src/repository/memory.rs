//! In-memory implementation of `RunRepository`.
//!
//! All state is held in memory and lost on restart. Used by tests and
//! ephemeral deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    NewAttempt, RepositoryError, RepositoryMetrics, RunFilter, RunPage, RunRepository,
    SummaryCounts,
};
use crate::model::{Attempt, CommitSha, NewEvent, Run, RunEvent, RunId, RunStatus};

pub struct InMemoryRepository {
    runs: RwLock<HashMap<RunId, Run>>,
    attempts: RwLock<Vec<Attempt>>,
    events: RwLock<Vec<RunEvent>>,
    next_attempt_id: AtomicI64,
    next_event_id: AtomicI64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            attempts: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            next_attempt_id: AtomicI64::new(1),
            next_event_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRepository for InMemoryRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs.get(id).cloned())
    }

    async fn find_by_fingerprint(
        &self,
        repository: &str,
        commit_sha: &CommitSha,
        error_hash: &str,
    ) -> Result<Option<Run>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .find(|run| {
                run.repository == repository
                    && run.commit_sha == *commit_sha
                    && run.error_hash == error_hash
            })
            .cloned())
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, RepositoryError> {
        let runs = self.runs.read().await;
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|run| {
                filter.status.map_or(true, |s| run.status == s)
                    && filter
                        .repository
                        .as_deref()
                        .map_or(true, |r| run.repository == r)
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();

        Ok(RunPage { runs: page, total })
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<Attempt, RepositoryError> {
        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        let row = Attempt {
            id,
            run_id: attempt.run_id,
            attempt_no: attempt.attempt_no,
            status: attempt.status,
            diagnosis: None,
            proposed_fix: None,
            validation_log: None,
            failure_reason: None,
            engine: None,
            created_at: Utc::now(),
        };
        let mut attempts = self.attempts.write().await;
        attempts.push(row.clone());
        Ok(row)
    }

    async fn update_attempt(&self, attempt: &Attempt) -> Result<(), RepositoryError> {
        let mut attempts = self.attempts.write().await;
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(existing) => {
                *existing = attempt.clone();
                Ok(())
            }
            None => Err(RepositoryError::storage(
                "update_attempt",
                format!("attempt {} not found", attempt.id),
            )),
        }
    }

    async fn attempts_for_run(&self, run_id: &RunId) -> Result<Vec<Attempt>, RepositoryError> {
        let attempts = self.attempts.read().await;
        let mut rows: Vec<Attempt> = attempts
            .iter()
            .filter(|a| a.run_id == *run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.attempt_no);
        Ok(rows)
    }

    async fn append_event(&self, event: NewEvent) -> Result<RunEvent, RepositoryError> {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let row = RunEvent {
            id,
            run_id: event.run_id,
            event_type: event.event_type,
            actor: event.actor,
            message: event.message,
            payload: event.payload,
            created_at: Utc::now(),
        };
        let mut events = self.events.write().await;
        events.push(row.clone());
        Ok(row)
    }

    async fn events_for_run(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> Result<Vec<RunEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.run_id == *run_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn summary_counts(&self) -> Result<SummaryCounts, RepositoryError> {
        let runs = self.runs.read().await;
        let mut counts = SummaryCounts::default();
        for run in runs.values() {
            counts.record(run.status);
        }
        Ok(counts)
    }

    async fn repository_metrics(&self) -> Result<Vec<RepositoryMetrics>, RepositoryError> {
        let runs = self.runs.read().await;
        let mut by_repo: HashMap<String, RepositoryMetrics> = HashMap::new();
        for run in runs.values() {
            let entry = by_repo
                .entry(run.repository.clone())
                .or_insert_with(|| RepositoryMetrics {
                    repository: run.repository.clone(),
                    total_runs: 0,
                    fixed: 0,
                    escalated: 0,
                    resolved: 0,
                    aborted: 0,
                    active: 0,
                    total_attempts: 0,
                });
            entry.total_runs += 1;
            entry.total_attempts += run.attempt_count as usize;
            match run.status {
                RunStatus::Fixed => entry.fixed += 1,
                RunStatus::Escalated => entry.escalated += 1,
                RunStatus::Resolved => entry.resolved += 1,
                RunStatus::Aborted => entry.aborted += 1,
                RunStatus::Queued | RunStatus::Running => entry.active += 1,
            }
        }

        let mut metrics: Vec<RepositoryMetrics> = by_repo.into_values().collect();
        metrics.sort_by(|a, b| a.repository.cmp(&b.repository));
        Ok(metrics)
    }
}
