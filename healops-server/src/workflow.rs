//! Attempt workflow execution strategies.
//!
//! An attempt is two steps: generate a fix proposal, then gate it through
//! container validation. The steps can run as a plain sequential call or
//! through a small dependency-ordered graph engine; both strategies produce
//! the identical `AttemptOutcome`, and the orchestrator records which one
//! ran purely for observability.

use std::sync::Arc;

use async_trait::async_trait;
use healops_core::RetrievedChunk;
use thiserror::Error;

use crate::model::Run;
use crate::proposal::{Proposal, ProposalGenerator};
use crate::validator::{ContainerValidator, ValidationOutcome};

/// Result shape shared by every workflow strategy.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub success: bool,
    pub diagnosis: String,
    pub proposed_fix: String,
    /// The model's own validation plan (its `Validation:` section).
    pub validation_plan: String,
    /// Combined output of the container validation command, when it ran.
    pub validation_log: Option<String>,
    pub failure_reason: Option<String>,
    pub matches: Vec<RetrievedChunk>,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow graph stalled: {0}")]
    Stalled(&'static str),
}

#[async_trait]
pub trait WorkflowStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, run: &Run, attempt_no: u32) -> Result<AttemptOutcome, WorkflowError>;
}

/// Merge a proposal and a validation result into the attempt outcome.
///
/// Container validation is a hard gate: a failed (or required-but-missing)
/// validation fails the attempt even when the proposal itself succeeded.
fn combine(proposal: Proposal, validation: Option<ValidationOutcome>) -> AttemptOutcome {
    let (success, validation_log, failure_reason) = if !proposal.success {
        (false, None, proposal.failure_reason)
    } else {
        match validation {
            None | Some(ValidationOutcome::Skipped) => (true, None, None),
            Some(ValidationOutcome::Passed { log }) => (true, Some(log), None),
            Some(ValidationOutcome::Failed { log, reason }) => {
                (false, Some(log), Some(reason))
            }
        }
    };

    AttemptOutcome {
        success,
        diagnosis: proposal.diagnosis,
        proposed_fix: proposal.fix,
        validation_plan: proposal.validation,
        validation_log,
        failure_reason,
        matches: proposal.matches,
    }
}

// =============================================================================
// Sequential strategy
// =============================================================================

pub struct SequentialWorkflow {
    proposer: Arc<ProposalGenerator>,
    validator: Arc<ContainerValidator>,
}

impl SequentialWorkflow {
    pub fn new(proposer: Arc<ProposalGenerator>, validator: Arc<ContainerValidator>) -> Self {
        Self {
            proposer,
            validator,
        }
    }
}

#[async_trait]
impl WorkflowStrategy for SequentialWorkflow {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn execute(&self, run: &Run, attempt_no: u32) -> Result<AttemptOutcome, WorkflowError> {
        let proposal = self.proposer.generate(run, attempt_no).await;
        let validation = if proposal.success {
            Some(self.validator.validate().await)
        } else {
            None
        };
        Ok(combine(proposal, validation))
    }
}

// =============================================================================
// Graph strategy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Propose,
    Validate,
}

struct StepNode {
    id: &'static str,
    deps: &'static [&'static str],
    kind: StepKind,
}

/// Accumulated state while the graph executes.
#[derive(Default)]
struct GraphState {
    proposal: Option<Proposal>,
    validation: Option<ValidationOutcome>,
}

/// Dependency-ordered workflow engine.
///
/// Nodes execute once all their dependencies have completed; an unsatisfiable
/// graph surfaces as `WorkflowError::Stalled`, which the orchestrator treats
/// as "engine unavailable" and falls back to the sequential strategy.
pub struct GraphWorkflow {
    proposer: Arc<ProposalGenerator>,
    validator: Arc<ContainerValidator>,
    nodes: Vec<StepNode>,
}

impl GraphWorkflow {
    pub fn new(proposer: Arc<ProposalGenerator>, validator: Arc<ContainerValidator>) -> Self {
        Self {
            proposer,
            validator,
            nodes: vec![
                StepNode {
                    id: "propose",
                    deps: &[],
                    kind: StepKind::Propose,
                },
                StepNode {
                    id: "validate",
                    deps: &["propose"],
                    kind: StepKind::Validate,
                },
            ],
        }
    }

    async fn run_step(&self, kind: StepKind, run: &Run, attempt_no: u32, state: &mut GraphState) {
        match kind {
            StepKind::Propose => {
                state.proposal = Some(self.proposer.generate(run, attempt_no).await);
            }
            StepKind::Validate => {
                // Validation only runs for a successful proposal.
                let proposal_succeeded =
                    state.proposal.as_ref().map(|p| p.success).unwrap_or(false);
                if proposal_succeeded {
                    state.validation = Some(self.validator.validate().await);
                }
            }
        }
    }
}

#[async_trait]
impl WorkflowStrategy for GraphWorkflow {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn execute(&self, run: &Run, attempt_no: u32) -> Result<AttemptOutcome, WorkflowError> {
        let mut done: Vec<&'static str> = Vec::with_capacity(self.nodes.len());
        let mut state = GraphState::default();

        while done.len() < self.nodes.len() {
            let ready = self
                .nodes
                .iter()
                .find(|node| {
                    !done.contains(&node.id) && node.deps.iter().all(|dep| done.contains(dep))
                })
                .ok_or(WorkflowError::Stalled("unsatisfiable dependencies"))?;

            self.run_step(ready.kind, run, attempt_no, &mut state).await;
            done.push(ready.id);
        }

        let proposal = state
            .proposal
            .ok_or(WorkflowError::Stalled("propose step never ran"))?;
        Ok(combine(proposal, state.validation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommitSha, PrState, ResolvedBy, RunId, RunStatus};
    use anyhow::anyhow;
    use healops_core::{ChatClient, ChatRequest, ChatResponse, InMemoryRetrieval};
    use std::path::PathBuf;
    use std::time::Duration;

    struct StubChat {
        content: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl ChatClient for StubChat {
        async fn complete(&self, _request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            match self.content {
                Ok(content) => Ok(ChatResponse {
                    content: content.to_string(),
                    input_tokens: 10,
                    output_tokens: 10,
                }),
                Err(message) => Err(anyhow!("{}", message)),
            }
        }
    }

    const GOOD_RESPONSE: &str = "Diagnosis: stale lockfile pin breaks the build\n\
         Fix: refresh the lockfile and commit it\n\
         Validation: run the build";

    fn run() -> Run {
        let now = chrono::Utc::now();
        Run {
            id: RunId::generate(),
            provider: "github-actions".to_string(),
            repository: "acme/api".to_string(),
            branch: "main".to_string(),
            commit_sha: CommitSha::from("abc123"),
            pipeline_url: None,
            error_hash: "hash".to_string(),
            error_type: "build_error".to_string(),
            error_summary: "lockfile conflict".to_string(),
            status: RunStatus::Running,
            attempt_count: 1,
            max_attempts: 3,
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
        }
    }

    fn proposer(content: Result<&'static str, &'static str>) -> Arc<ProposalGenerator> {
        Arc::new(ProposalGenerator::new(
            Arc::new(StubChat { content }),
            Arc::new(InMemoryRetrieval::new()),
            "anthropic".to_string(),
            "claude-test".to_string(),
            false,
        ))
    }

    fn validator(command: Option<&str>) -> Arc<ContainerValidator> {
        Arc::new(ContainerValidator::new(
            true,
            command.map(str::to_string),
            PathBuf::from("."),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn test_sequential_pass() {
        let workflow = SequentialWorkflow::new(proposer(Ok(GOOD_RESPONSE)), validator(Some("true")));
        let outcome = workflow.execute(&run(), 1).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.validation_plan, "run the build");
        assert!(outcome
            .validation_log
            .as_deref()
            .unwrap()
            .contains("CONTAINER_VALIDATION_PASSED"));
    }

    #[tokio::test]
    async fn test_sequential_validation_gate() {
        // AI proposal succeeds but validation fails: the attempt fails.
        let workflow =
            SequentialWorkflow::new(proposer(Ok(GOOD_RESPONSE)), validator(Some("exit 1")));
        let outcome = workflow.execute(&run(), 1).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome
            .validation_log
            .as_deref()
            .unwrap()
            .contains("CONTAINER_VALIDATION_FAILED"));
        assert!(outcome.failure_reason.is_some());
        assert!(outcome.diagnosis.contains("stale lockfile"));
    }

    #[tokio::test]
    async fn test_sequential_skips_validation_on_failed_proposal() {
        let workflow =
            SequentialWorkflow::new(proposer(Err("unreachable")), validator(Some("true")));
        let outcome = workflow.execute(&run(), 1).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.validation_log.is_none());
        assert_eq!(outcome.failure_reason.as_deref(), Some("unreachable"));
    }

    #[tokio::test]
    async fn test_graph_matches_sequential() {
        let run = run();

        let sequential =
            SequentialWorkflow::new(proposer(Ok(GOOD_RESPONSE)), validator(Some("true")));
        let graph = GraphWorkflow::new(proposer(Ok(GOOD_RESPONSE)), validator(Some("true")));

        let a = sequential.execute(&run, 1).await.unwrap();
        let b = graph.execute(&run, 1).await.unwrap();

        assert_eq!(a.success, b.success);
        assert_eq!(a.diagnosis, b.diagnosis);
        assert_eq!(a.proposed_fix, b.proposed_fix);
        assert_eq!(
            a.validation_log.is_some(),
            b.validation_log.is_some()
        );
    }

    #[tokio::test]
    async fn test_graph_validation_gate() {
        let graph = GraphWorkflow::new(proposer(Ok(GOOD_RESPONSE)), validator(Some("exit 2")));
        let outcome = graph.execute(&run(), 1).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_graph_skips_validation_on_failed_proposal() {
        let graph = GraphWorkflow::new(proposer(Err("down")), validator(Some("true")));
        let outcome = graph.execute(&run(), 1).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.validation_log.is_none());
    }
}
