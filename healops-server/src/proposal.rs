//! Fix proposal generation: memory-augmented AI diagnosis.
//!
//! One chat-completion call per attempt, with similar past fixes retrieved
//! into the prompt. Provider errors never propagate; they become a failed
//! proposal with a fallback diagnosis, which drives the retry policy.

use std::collections::HashMap;
use std::sync::Arc;

use healops_core::{
    build_user_prompt, format_similar_fixes, parse_proposal, system_prompt, ChatClient,
    ChatRequest, FixPromptInput, MemoryDocument, Retrieval, RetrievedChunk,
};
use tracing::warn;

use crate::model::{Attempt, Run};

/// Retrieval parameters for the similarity context.
const SIMILAR_TOP_K: usize = 3;
const SIMILAR_MIN_SCORE: f32 = 0.65;

/// Completion parameters for the diagnosis call.
const TEMPERATURE: f32 = 0.2;
const MAX_TOKENS: u32 = 2048;

/// Minimum useful section length for the success predicate.
const MIN_SECTION_LEN: usize = 10;

const SAFE_MODE_NOTE: &str =
    "\n\n[safe mode] No code was pushed automatically; apply this fix via the proposal PR.";

/// Result of one proposal generation. Never an error: provider failures are
/// captured as `success = false` with a failure reason.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub success: bool,
    pub diagnosis: String,
    pub fix: String,
    pub validation: String,
    pub failure_reason: Option<String>,
    pub matches: Vec<RetrievedChunk>,
}

pub struct ProposalGenerator {
    chat: Arc<dyn ChatClient>,
    retrieval: Arc<dyn Retrieval>,
    provider_label: String,
    model: String,
    safe_mode: bool,
}

impl ProposalGenerator {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        retrieval: Arc<dyn Retrieval>,
        provider_label: String,
        model: String,
        safe_mode: bool,
    ) -> Self {
        Self {
            chat,
            retrieval,
            provider_label,
            model,
            safe_mode,
        }
    }

    pub fn provider_label(&self) -> &str {
        &self.provider_label
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a fix proposal for one attempt.
    pub async fn generate(&self, run: &Run, attempt_no: u32) -> Proposal {
        let matches = match self
            .retrieval
            .query(&run.error_summary, SIMILAR_TOP_K, SIMILAR_MIN_SCORE)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!("Similar-fix retrieval failed for run {}: {}", run.id, e);
                Vec::new()
            }
        };

        let similar_fixes = format_similar_fixes(&matches);
        let request = ChatRequest {
            model: self.model.clone(),
            system: system_prompt().to_string(),
            user: build_user_prompt(&FixPromptInput {
                repository: &run.repository,
                branch: &run.branch,
                commit_sha: &run.commit_sha.0,
                attempt: attempt_no,
                max_attempts: run.max_attempts,
                error_type: &run.error_type,
                error_summary: &run.error_summary,
                similar_fixes: &similar_fixes,
            }),
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = match self.chat.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("AI provider call failed for run {}: {}", run.id, e);
                return Proposal {
                    success: false,
                    diagnosis: "AI provider unavailable; no diagnosis produced".to_string(),
                    fix: "Fallback: require manual engineer review".to_string(),
                    validation: String::new(),
                    failure_reason: Some(e.to_string()),
                    matches,
                };
            }
        };

        let parsed = parse_proposal(&response.content);
        let success =
            parsed.diagnosis.len() > MIN_SECTION_LEN && parsed.fix.len() > MIN_SECTION_LEN;

        let mut fix = parsed.fix;
        if self.safe_mode {
            fix.push_str(SAFE_MODE_NOTE);
        }

        Proposal {
            success,
            diagnosis: parsed.diagnosis,
            fix,
            validation: parsed.validation,
            failure_reason: if success {
                None
            } else {
                Some("AI response did not contain a usable diagnosis and fix".to_string())
            },
            matches,
        }
    }

    /// Store a concluded attempt as a memory document for future similarity
    /// retrieval. Ingestion failures are logged and swallowed.
    pub async fn persist_memory(&self, run: &Run, attempt: &Attempt) {
        let body = format!(
            "repository: {}\nbranch: {}\ncommit: {}\nattempt: {}\nstatus: {}\n\
             error summary: {}\ndiagnosis: {}\nfix: {}\nvalidation: {}",
            run.repository,
            run.branch,
            run.commit_sha,
            attempt.attempt_no,
            attempt.status.as_str(),
            run.error_summary,
            attempt.diagnosis.as_deref().unwrap_or(""),
            attempt.proposed_fix.as_deref().unwrap_or(""),
            attempt.validation_log.as_deref().unwrap_or(""),
        );

        let mut metadata = HashMap::new();
        metadata.insert("runId".to_string(), run.id.0.clone());
        metadata.insert("attemptNo".to_string(), attempt.attempt_no.to_string());
        metadata.insert("status".to_string(), attempt.status.as_str().to_string());
        metadata.insert("repository".to_string(), run.repository.clone());

        let document = MemoryDocument {
            title: format!(
                "{} {} attempt {}",
                run.repository,
                run.commit_sha.short(),
                attempt.attempt_no
            ),
            body,
            metadata,
        };

        if let Err(e) = self.retrieval.ingest(document).await {
            warn!("Failed to persist attempt memory for run {}: {}", run.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttemptStatus, RunId};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use healops_core::{ChatResponse, InMemoryRetrieval};

    struct StubChat {
        response: Result<String, String>,
    }

    #[async_trait]
    impl ChatClient for StubChat {
        async fn complete(&self, _request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            match &self.response {
                Ok(content) => Ok(ChatResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                }),
                Err(message) => Err(anyhow!("{}", message)),
            }
        }
    }

    fn generator(response: Result<String, String>, safe_mode: bool) -> ProposalGenerator {
        ProposalGenerator::new(
            Arc::new(StubChat { response }),
            Arc::new(InMemoryRetrieval::new()),
            "anthropic".to_string(),
            "claude-test".to_string(),
            safe_mode,
        )
    }

    fn sample_run() -> Run {
        let now = chrono::Utc::now();
        Run {
            id: RunId::generate(),
            provider: "github-actions".to_string(),
            repository: "acme/api".to_string(),
            branch: "main".to_string(),
            commit_sha: crate::model::CommitSha::from("abc123def"),
            pipeline_url: None,
            error_hash: "hash".to_string(),
            error_type: "type_error".to_string(),
            error_summary: "TS2339: property missing after rename".to_string(),
            status: crate::model::RunStatus::Running,
            attempt_count: 1,
            max_attempts: 3,
            pr_url: None,
            pr_number: None,
            pr_state: crate::model::PrState::None,
            pr_branch: None,
            ai_provider: None,
            ai_model: None,
            resolved_by: crate::model::ResolvedBy::None,
            human_note: None,
            escalation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_successful_proposal() {
        let content = "Diagnosis: the field was renamed upstream and call sites lag behind\n\
                       Fix: rename remaining call sites to account_id\n\
                       Validation: cargo test -p accounts";
        let generator = generator(Ok(content.to_string()), false);
        let run = sample_run();

        let proposal = generator.generate(&run, 1).await;
        assert!(proposal.success);
        assert!(proposal.diagnosis.contains("renamed upstream"));
        assert!(proposal.fix.contains("account_id"));
        assert!(!proposal.fix.contains("[safe mode]"));
        assert_eq!(proposal.validation, "cargo test -p accounts");
        assert!(proposal.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_safe_mode_suffixes_fix() {
        let content = "Diagnosis: a broken import path in the build script\n\
                       Fix: correct the module path in build.rs";
        let generator = generator(Ok(content.to_string()), true);
        let run = sample_run();

        let proposal = generator.generate(&run, 1).await;
        assert!(proposal.success);
        assert!(proposal.fix.contains("[safe mode]"));
    }

    #[tokio::test]
    async fn test_short_sections_fail_predicate() {
        let generator = generator(Ok("Diagnosis: bad\nFix: no".to_string()), false);
        let run = sample_run();

        let proposal = generator.generate(&run, 1).await;
        assert!(!proposal.success);
        assert!(proposal.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_provider_error_never_throws() {
        let generator = generator(Err("connection timed out".to_string()), true);
        let run = sample_run();

        let proposal = generator.generate(&run, 2).await;
        assert!(!proposal.success);
        assert!(proposal.diagnosis.starts_with("AI provider unavailable"));
        assert_eq!(proposal.fix, "Fallback: require manual engineer review");
        assert_eq!(
            proposal.failure_reason.as_deref(),
            Some("connection timed out")
        );
    }

    #[tokio::test]
    async fn test_persist_memory_feeds_future_retrieval() {
        let retrieval = Arc::new(InMemoryRetrieval::new());
        let generator = ProposalGenerator::new(
            Arc::new(StubChat {
                response: Ok("irrelevant".to_string()),
            }),
            retrieval.clone(),
            "anthropic".to_string(),
            "claude-test".to_string(),
            true,
        );
        let run = sample_run();
        let attempt = Attempt {
            id: 1,
            run_id: run.id.clone(),
            attempt_no: 1,
            status: AttemptStatus::Succeeded,
            diagnosis: Some("property missing after rename".to_string()),
            proposed_fix: Some("rename call sites".to_string()),
            validation_log: Some("[CONTAINER_VALIDATION_PASSED]".to_string()),
            failure_reason: None,
            engine: Some("sequential".to_string()),
            created_at: chrono::Utc::now(),
        };

        generator.persist_memory(&run, &attempt).await;

        let matches = retrieval
            .query("property missing after rename", 3, 0.05)
            .await
            .unwrap();
        assert!(!matches.is_empty());
        assert!(matches[0].title.contains("acme/api"));
    }
}
