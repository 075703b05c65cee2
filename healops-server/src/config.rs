use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use healops_core::ProviderKind;

/// Attempt budget bounds: `HEALOPS_MAX_ATTEMPTS` is clamped into this range.
pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_ATTEMPTS: u32 = 3;

const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 900;

#[derive(Clone)]
pub struct Config {
    /// Master switch: when false, all webhook ingestion is rejected.
    pub enabled: bool,
    pub max_attempts: u32,
    /// Safe mode suffixes proposed fixes with a no-auto-push note.
    pub safe_mode: bool,
    /// When true, attempts run through the graph workflow engine.
    pub workflow_engine: bool,
    pub webhook_secret: Option<String>,
    pub chat_webhook_url: Option<String>,
    pub ai_provider: ProviderKind,
    pub ai_model: String,
    pub ai_api_key: String,
    pub github_enabled: bool,
    pub github_token: Option<String>,
    pub base_branch: String,
    pub validation_required: bool,
    pub validation_command: Option<String>,
    pub validation_timeout: Duration,
    pub validation_workdir: PathBuf,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let enabled = bool_var("HEALOPS_ENABLED", true);
        let max_attempts = clamp_max_attempts(env::var("HEALOPS_MAX_ATTEMPTS").ok().as_deref());
        let safe_mode = bool_var("HEALOPS_SAFE_MODE", true);
        let workflow_engine = bool_var("HEALOPS_WORKFLOW_ENGINE", false);

        let webhook_secret = optional_var("HEALOPS_WEBHOOK_SECRET");
        let chat_webhook_url = optional_var("HEALOPS_CHAT_WEBHOOK_URL");

        let provider_label =
            env::var("HEALOPS_AI_PROVIDER").unwrap_or_else(|_| "anthropic".to_string());
        let ai_provider = ProviderKind::parse(&provider_label).with_context(|| {
            format!(
                "HEALOPS_AI_PROVIDER must be one of anthropic/openai/gemini/grok, got '{}'",
                provider_label
            )
        })?;

        let ai_model = env::var("HEALOPS_AI_MODEL")
            .unwrap_or_else(|_| ai_provider.default_model().to_string());

        let key_var = match ai_provider {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            _ => "OPENAI_API_KEY",
        };
        // A missing key is not fatal at startup: provider errors surface as
        // failed attempts, which is the documented degradation path.
        let ai_api_key = env::var(key_var).unwrap_or_default();

        let github_enabled = bool_var("HEALOPS_GITHUB_ENABLED", false);
        let github_token = optional_var("GITHUB_TOKEN");
        let base_branch = env::var("HEALOPS_BASE_BRANCH").unwrap_or_else(|_| "main".to_string());

        let validation_required = bool_var("HEALOPS_VALIDATION_REQUIRED", true);
        let validation_command = optional_var("HEALOPS_VALIDATION_COMMAND");
        let validation_timeout = Duration::from_secs(
            env::var("HEALOPS_VALIDATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_VALIDATION_TIMEOUT_SECS),
        );
        let validation_workdir = env::var("HEALOPS_VALIDATION_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        Ok(Config {
            enabled,
            max_attempts,
            safe_mode,
            workflow_engine,
            webhook_secret,
            chat_webhook_url,
            ai_provider,
            ai_model,
            ai_api_key,
            github_enabled,
            github_token,
            base_branch,
            validation_required,
            validation_command,
            validation_timeout,
            validation_workdir,
            port,
            state_dir,
        })
    }
}

fn bool_var(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

/// Returns None if the variable is missing, empty, or whitespace-only.
fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Parse and clamp the per-run attempt budget into [1, 5], defaulting to 3.
pub fn clamp_max_attempts(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.parse::<u32>().ok())
        .map(|v| v.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS))
        .unwrap_or(DEFAULT_ATTEMPTS)
}
