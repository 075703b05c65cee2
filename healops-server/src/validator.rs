//! Container validation: sandboxed execution of the configured build/test
//! command before any fix proposal is trusted enough to open a PR.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::info;

/// Combined stdout/stderr capture cap.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const PASSED_MARKER: &str = "[CONTAINER_VALIDATION_PASSED]";
const FAILED_MARKER: &str = "[CONTAINER_VALIDATION_FAILED]";

/// Result of running (or skipping) container validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Passed { log: String },
    Failed { log: String, reason: String },
    /// Validation is optional and no command is configured.
    Skipped,
}

pub struct ContainerValidator {
    pub required: bool,
    pub command: Option<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

impl ContainerValidator {
    pub fn new(
        required: bool,
        command: Option<String>,
        workdir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            required,
            command,
            workdir,
            timeout,
        }
    }

    /// Run the configured command, capturing combined stdout/stderr.
    ///
    /// Validation is a hard gate: a failing or timed-out command fails the
    /// whole attempt, as does a missing command when validation is required.
    pub async fn validate(&self) -> ValidationOutcome {
        let Some(command) = &self.command else {
            if self.required {
                return ValidationOutcome::Failed {
                    log: format!("{FAILED_MARKER}\nno validation command configured"),
                    reason: "container validation required but no command configured".to_string(),
                };
            }
            return ValidationOutcome::Skipped;
        };

        info!(
            "Running container validation: {} (cwd {}, timeout {}s)",
            command,
            self.workdir.display(),
            self.timeout.as_secs()
        );

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return ValidationOutcome::Failed {
                    log: format!("{FAILED_MARKER}\nfailed to spawn command: {e}"),
                    reason: format!("failed to spawn validation command: {e}"),
                };
            }
        };

        // kill_on_drop reaps the child if the timeout wins the race.
        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !log.is_empty() {
                        log.push('\n');
                    }
                    log.push_str(&stderr);
                }
                let log = truncate_output(&log);

                if output.status.success() {
                    ValidationOutcome::Passed {
                        log: format!("{PASSED_MARKER}\n{log}"),
                    }
                } else {
                    let code = output
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    ValidationOutcome::Failed {
                        log: format!("{FAILED_MARKER}\n{log}"),
                        reason: format!("validation command exited with status {code}"),
                    }
                }
            }
            Ok(Err(e)) => ValidationOutcome::Failed {
                log: format!("{FAILED_MARKER}\nfailed to capture output: {e}"),
                reason: format!("failed to capture validation output: {e}"),
            },
            Err(_) => ValidationOutcome::Failed {
                log: format!(
                    "{FAILED_MARKER}\ntimed out after {}s",
                    self.timeout.as_secs()
                ),
                reason: format!(
                    "validation command timed out after {}s",
                    self.timeout.as_secs()
                ),
            },
        }
    }
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [output truncated]", &output[..end])
}
