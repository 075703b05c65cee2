//! Attempt orchestration: the run state machine.
//!
//! `queued -> running -> {fixed | queued | escalated}` under automatic
//! processing; `aborted` and `resolved` are reached only via human action.
//! All run mutations happen here (or in the ingestor for creation), so the
//! idempotence guard at job entry is the only locking the at-least-once
//! queue needs.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::bus::EventRecorder;
use crate::github::{PrAutomation, PrCreation};
use crate::metrics::Metrics;
use crate::model::{Actor, Attempt, AttemptStatus, PrState, ResolvedBy, Run, RunId, RunStatus};
use crate::notify::ChatNotifier;
use crate::proposal::ProposalGenerator;
use crate::queue::{AttemptJob, AttemptQueue};
use crate::repository::{NewAttempt, RepositoryError, RunRepository};
use crate::workflow::{AttemptOutcome, WorkflowStrategy};

/// A human decision on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanAction {
    Approve,
    Deny,
    Abort,
    HumanFix,
}

impl HumanAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "deny" => Some(Self::Deny),
            "abort" => Some(Self::Abort),
            "human-fix" => Some(Self::HumanFix),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Abort => "abort",
            Self::HumanFix => "human-fix",
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown run {0}")]
    UnknownRun(RunId),

    #[error("GitHub operation failed: {0}")]
    GitHub(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct Orchestrator {
    repository: Arc<dyn RunRepository>,
    queue: Arc<dyn AttemptQueue>,
    sequential: Arc<dyn WorkflowStrategy>,
    /// Graph engine, present only when enabled by configuration.
    graph: Option<Arc<dyn WorkflowStrategy>>,
    proposer: Arc<ProposalGenerator>,
    pr: Arc<PrAutomation>,
    events: Arc<EventRecorder>,
    metrics: Arc<Metrics>,
    notifier: Arc<ChatNotifier>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn RunRepository>,
        queue: Arc<dyn AttemptQueue>,
        sequential: Arc<dyn WorkflowStrategy>,
        graph: Option<Arc<dyn WorkflowStrategy>>,
        proposer: Arc<ProposalGenerator>,
        pr: Arc<PrAutomation>,
        events: Arc<EventRecorder>,
        metrics: Arc<Metrics>,
        notifier: Arc<ChatNotifier>,
    ) -> Self {
        Self {
            repository,
            queue,
            sequential,
            graph,
            proposer,
            pr,
            events,
            metrics,
            notifier,
        }
    }

    /// Process one attempt job. Safe under at-least-once redelivery: jobs for
    /// terminal or aborted runs are no-ops.
    pub async fn process_job(&self, job: &AttemptJob) -> anyhow::Result<()> {
        let Some(mut run) = self.repository.get_run(&job.run_id).await? else {
            warn!("Dropping job for unknown run {}", job.run_id);
            return Ok(());
        };

        if run.status.is_terminal_for_jobs() {
            info!(
                "Run {} already {}, job for attempt {} is a no-op",
                run.id, run.status, job.attempt
            );
            return Ok(());
        }

        let attempt_no = run.attempt_count + 1;
        if attempt_no > run.max_attempts {
            self.escalate(&mut run, "retry limit exhausted".to_string())
                .await?;
            return Ok(());
        }

        run.status = RunStatus::Running;
        run.attempt_count = attempt_no;
        run.touch();
        self.repository.update_run(&run).await?;
        self.metrics.incr("attempt.started");
        self.events
            .record(
                &run.id,
                "attempt.started",
                Actor::System,
                format!("attempt {} of {} started", attempt_no, run.max_attempts),
                serde_json::json!({ "attempt": attempt_no }),
            )
            .await;

        let mut attempt = self
            .repository
            .insert_attempt(NewAttempt {
                run_id: run.id.clone(),
                attempt_no,
                status: AttemptStatus::Running,
            })
            .await?;

        let (outcome, engine) = self.run_workflow(&run, attempt_no).await;

        // Durable reasoning trace: validation output and the diagnosis with
        // its similarity context.
        if let Some(log) = &outcome.validation_log {
            self.events
                .record(
                    &run.id,
                    "attempt.container-validation",
                    Actor::System,
                    format!("container validation for attempt {}", attempt_no),
                    serde_json::json!({ "attempt": attempt_no, "validationLog": log }),
                )
                .await;
        }
        self.events
            .record(
                &run.id,
                "attempt.thinking",
                Actor::Ai,
                format!("diagnosis recorded for attempt {}", attempt_no),
                serde_json::json!({
                    "attempt": attempt_no,
                    "diagnosis": outcome.diagnosis,
                    "validationPlan": outcome.validation_plan,
                    "validationLog": outcome.validation_log,
                    "similarFixes": outcome.matches,
                    "engine": engine,
                }),
            )
            .await;

        attempt.status = if outcome.success {
            AttemptStatus::Succeeded
        } else {
            AttemptStatus::Failed
        };
        attempt.diagnosis = Some(outcome.diagnosis);
        attempt.proposed_fix = Some(outcome.proposed_fix);
        attempt.validation_log = outcome.validation_log;
        attempt.failure_reason = outcome.failure_reason.clone();
        attempt.engine = Some(engine.to_string());
        self.repository.update_attempt(&attempt).await?;

        // Feed the self-referential fix memory, success or failure.
        self.proposer.persist_memory(&run, &attempt).await;

        if outcome.success {
            self.conclude_fixed(&mut run, &attempt).await?;
        } else {
            self.conclude_failed(&mut run, attempt_no, outcome.failure_reason)
                .await?;
        }

        Ok(())
    }

    /// Pick the workflow engine for this attempt. The graph engine is used
    /// when configured; any error there falls back to the sequential
    /// strategy, with identical outcome shape either way.
    async fn run_workflow(&self, run: &Run, attempt_no: u32) -> (AttemptOutcome, &'static str) {
        if let Some(graph) = &self.graph {
            match graph.execute(run, attempt_no).await {
                Ok(outcome) => return (outcome, graph.name()),
                Err(e) => {
                    warn!(
                        "Graph workflow engine failed for run {}, falling back to sequential: {}",
                        run.id, e
                    );
                }
            }
        }

        match self.sequential.execute(run, attempt_no).await {
            Ok(outcome) => (outcome, self.sequential.name()),
            Err(e) => (
                AttemptOutcome {
                    success: false,
                    diagnosis: String::new(),
                    proposed_fix: String::new(),
                    validation_plan: String::new(),
                    validation_log: None,
                    failure_reason: Some(e.to_string()),
                    matches: Vec::new(),
                },
                self.sequential.name(),
            ),
        }
    }

    async fn conclude_fixed(&self, run: &mut Run, attempt: &Attempt) -> anyhow::Result<()> {
        run.status = RunStatus::Fixed;
        run.resolved_by = ResolvedBy::Ai;
        run.ai_provider = Some(self.proposer.provider_label().to_string());
        run.ai_model = Some(self.proposer.model().to_string());
        run.touch();
        self.repository.update_run(run).await?;
        self.metrics.incr("attempt.succeeded");

        // PR creation is a compensable follow-up: the run is already fixed,
        // and prState stays none until GitHub confirms.
        match self.pr.open_fix_pr(run, attempt).await {
            Ok(PrCreation::Opened {
                url,
                number,
                branch,
            }) => {
                run.pr_url = Some(url.clone());
                run.pr_number = Some(number);
                run.pr_state = PrState::Open;
                run.pr_branch = Some(branch);
                run.touch();
                self.repository.update_run(run).await?;
                self.metrics.incr("pr.opened");
                self.events
                    .record(
                        &run.id,
                        "pr.opened",
                        Actor::System,
                        format!("opened PR #{number}"),
                        serde_json::json!({ "prNumber": number, "prUrl": url }),
                    )
                    .await;
            }
            Ok(PrCreation::Skipped { reason }) => {
                self.metrics.incr("pr.skipped");
                self.events
                    .record(
                        &run.id,
                        "pr.skipped",
                        Actor::System,
                        reason.clone(),
                        serde_json::json!({ "reason": reason }),
                    )
                    .await;
            }
            Ok(PrCreation::Disabled) => {}
            Err(e) => {
                error!("PR creation failed for fixed run {}: {}", run.id, e);
                self.metrics.incr("pr.failed");
                self.events
                    .record(
                        &run.id,
                        "pr.failed",
                        Actor::System,
                        "PR creation failed after fix",
                        serde_json::json!({ "error": e.to_string() }),
                    )
                    .await;
            }
        }

        self.events
            .record(
                &run.id,
                "attempt.succeeded",
                Actor::Ai,
                format!("attempt {} fixed the failure", attempt.attempt_no),
                serde_json::json!({ "attempt": attempt.attempt_no }),
            )
            .await;
        self.notifier
            .notify(
                &format!(
                    "Run for {} fixed on attempt {}",
                    run.repository, attempt.attempt_no
                ),
                Some(run),
            )
            .await;
        Ok(())
    }

    async fn conclude_failed(
        &self,
        run: &mut Run,
        attempt_no: u32,
        failure_reason: Option<String>,
    ) -> anyhow::Result<()> {
        self.metrics.incr("attempt.failed");
        self.events
            .record(
                &run.id,
                "attempt.failed",
                Actor::System,
                format!("attempt {} failed", attempt_no),
                serde_json::json!({
                    "attempt": attempt_no,
                    "failureReason": failure_reason,
                }),
            )
            .await;

        if attempt_no >= run.max_attempts {
            let reason = failure_reason.unwrap_or_else(|| "all retries failed".to_string());
            self.escalate(run, reason).await?;
            return Ok(());
        }

        run.status = RunStatus::Queued;
        run.touch();
        self.repository.update_run(run).await?;

        let next = attempt_no + 1;
        self.queue
            .enqueue(AttemptJob {
                run_id: run.id.clone(),
                attempt: next,
            })
            .await
            .map_err(|e| anyhow::anyhow!("failed to requeue run {}: {}", run.id, e))?;

        self.metrics.incr("run.requeued");
        self.events
            .record(
                &run.id,
                "run.requeued",
                Actor::System,
                format!("attempt {next} queued"),
                serde_json::json!({ "nextAttempt": next }),
            )
            .await;
        self.notifier
            .notify(
                &format!(
                    "Attempt {} failed for {}; retrying",
                    attempt_no, run.repository
                ),
                Some(run),
            )
            .await;
        Ok(())
    }

    async fn escalate(&self, run: &mut Run, reason: String) -> Result<(), RepositoryError> {
        run.status = RunStatus::Escalated;
        run.resolved_by = ResolvedBy::Human;
        run.escalation_reason = Some(reason.clone());
        run.touch();
        self.repository.update_run(run).await?;

        self.metrics.incr("run.escalated");
        self.events
            .record(
                &run.id,
                "run.escalated",
                Actor::System,
                reason.clone(),
                serde_json::json!({ "reason": reason }),
            )
            .await;
        self.notifier
            .notify(
                &format!("Run for {} escalated: {}", run.repository, reason),
                Some(run),
            )
            .await;
        Ok(())
    }

    /// Apply a human decision to a run.
    ///
    /// Actions are deliberately permissive about the run's current status;
    /// acting on an already-terminal run is allowed and logged.
    pub async fn handle_action(
        &self,
        run_id: &RunId,
        action: HumanAction,
        note: Option<String>,
    ) -> Result<Run, ActionError> {
        let mut run = self
            .repository
            .get_run(run_id)
            .await?
            .ok_or_else(|| ActionError::UnknownRun(run_id.clone()))?;

        if run.status.is_terminal_for_jobs() {
            warn!(
                "Human action {} applied to run {} already in status {}",
                action.as_str(),
                run.id,
                run.status
            );
        }

        let event_type = match action {
            HumanAction::Approve => {
                if run.pr_state == PrState::Open {
                    let merged = self
                        .pr
                        .merge_pr(&run)
                        .await
                        .map_err(|e| ActionError::GitHub(e.to_string()))?;
                    if merged {
                        run.pr_state = PrState::Merged;
                    }
                }
                run.status = RunStatus::Resolved;
                run.resolved_by = ResolvedBy::Human;
                "run.approved"
            }
            HumanAction::Deny => {
                if run.pr_state == PrState::Open {
                    let closed = self
                        .pr
                        .close_pr(&run)
                        .await
                        .map_err(|e| ActionError::GitHub(e.to_string()))?;
                    if closed {
                        run.pr_state = PrState::Closed;
                    }
                }
                run.status = RunStatus::Escalated;
                run.resolved_by = ResolvedBy::Human;
                run.escalation_reason = Some(
                    note.clone()
                        .unwrap_or_else(|| "denied by reviewer".to_string()),
                );
                "run.denied"
            }
            HumanAction::Abort => {
                if run.pr_state == PrState::Open {
                    let closed = self
                        .pr
                        .close_pr(&run)
                        .await
                        .map_err(|e| ActionError::GitHub(e.to_string()))?;
                    if closed {
                        run.pr_state = PrState::Closed;
                    }
                }
                run.status = RunStatus::Aborted;
                run.resolved_by = ResolvedBy::Human;
                "run.aborted"
            }
            HumanAction::HumanFix => {
                run.status = RunStatus::Resolved;
                run.resolved_by = ResolvedBy::Human;
                run.human_note =
                    Some(note.clone().unwrap_or_else(|| "resolved manually".to_string()));
                "run.human-fixed"
            }
        };

        run.touch();
        self.repository.update_run(&run).await?;

        self.metrics.incr(&format!("action.{}", action.as_str()));
        self.events
            .record(
                &run.id,
                event_type,
                Actor::Human,
                format!("run {} by reviewer", action.as_str()),
                serde_json::json!({ "note": note }),
            )
            .await;
        self.notifier
            .notify(
                &format!("Run for {} {}", run.repository, action.as_str()),
                Some(&run),
            )
            .await;

        Ok(run)
    }
}
