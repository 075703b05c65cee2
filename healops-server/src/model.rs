//! Domain model for healing runs.
//!
//! A `Run` is one tracked CI-failure healing effort, keyed by
//! (repository, commit, error fingerprint). `Attempt` rows are the
//! append-only retry ledger; `RunEvent` rows are the durable audit trail
//! and the payload for the live stream.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype for run identifiers (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns a truncated id for display and branch naming (first 8 chars).
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Run lifecycle status.
///
/// `queued -> running -> {fixed | queued | escalated}` under automatic
/// processing; `aborted` and `resolved` are reached only via human action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Fixed,
    Escalated,
    Aborted,
    Resolved,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Fixed => "fixed",
            Self::Escalated => "escalated",
            Self::Aborted => "aborted",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "fixed" => Some(Self::Fixed),
            "escalated" => Some(Self::Escalated),
            "aborted" => Some(Self::Aborted),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    /// True if an attempt job for a run in this status is a no-op.
    pub fn is_terminal_for_jobs(&self) -> bool {
        matches!(
            self,
            Self::Fixed | Self::Escalated | Self::Aborted | Self::Resolved
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pull request linkage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    None,
    Open,
    Merged,
    Closed,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "open" => Some(Self::Open),
            "merged" => Some(Self::Merged),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Who resolved the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    None,
    Ai,
    Human,
    User,
}

impl ResolvedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ai => "ai",
            Self::Human => "human",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "ai" => Some(Self::Ai),
            "human" => Some(Self::Human),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// One tracked CI-failure healing effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub provider: String,
    pub repository: String,
    pub branch: String,
    pub commit_sha: CommitSha,
    pub pipeline_url: Option<String>,
    pub error_hash: String,
    pub error_type: String,
    pub error_summary: String,
    pub status: RunStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_state: PrState,
    pub pr_branch: Option<String>,
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub resolved_by: ResolvedBy,
    pub human_note: Option<String>,
    pub escalation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Attempt lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Failed,
    Succeeded,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "succeeded" => Some(Self::Succeeded),
            _ => None,
        }
    }
}

/// One retry cycle within a run. Append-only apart from its own
/// status/diagnosis fields while still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: i64,
    pub run_id: RunId,
    pub attempt_no: u32,
    pub status: AttemptStatus,
    pub diagnosis: Option<String>,
    pub proposed_fix: Option<String>,
    pub validation_log: Option<String>,
    pub failure_reason: Option<String>,
    /// Which workflow engine produced the outcome (observability only).
    pub engine: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Event actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    System,
    Ai,
    Human,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Ai => "ai",
            Self::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "ai" => Some(Self::Ai),
            "human" => Some(Self::Human),
            _ => None,
        }
    }
}

/// Durable audit-trail entry; never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: i64,
    pub run_id: RunId,
    pub event_type: String,
    pub actor: Actor,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Event to append (id and timestamp assigned by the repository).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub run_id: RunId,
    pub event_type: String,
    pub actor: Actor,
    pub message: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_short() {
        let id = RunId("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9".to_string());
        assert_eq!(id.short(), "0a1b2c3d");

        let tiny = RunId("abc".to_string());
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_commit_sha_short() {
        let sha = CommitSha("abc123def456".to_string());
        assert_eq!(sha.short(), "abc123d");
    }

    #[test]
    fn test_status_terminal_for_jobs() {
        assert!(!RunStatus::Queued.is_terminal_for_jobs());
        assert!(!RunStatus::Running.is_terminal_for_jobs());
        assert!(RunStatus::Fixed.is_terminal_for_jobs());
        assert!(RunStatus::Escalated.is_terminal_for_jobs());
        assert!(RunStatus::Aborted.is_terminal_for_jobs());
        assert!(RunStatus::Resolved.is_terminal_for_jobs());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Fixed,
            RunStatus::Escalated,
            RunStatus::Aborted,
            RunStatus::Resolved,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("unknown"), None);
    }

    #[test]
    fn test_pr_state_round_trip() {
        for state in [PrState::None, PrState::Open, PrState::Merged, PrState::Closed] {
            assert_eq!(PrState::parse(state.as_str()), Some(state));
        }
    }
}
