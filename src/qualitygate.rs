//! Quality gate execution: run test and lint commands in a workspace and
//! report pass/fail with captured output.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::models::{QualityGateRequest, QualityGateResult};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

/// Executes test and lint commands for quality gate requests.
#[derive(Debug, Clone, Copy)]
pub struct QualityGateExecutor {
    timeout: Duration,
}

impl QualityGateExecutor {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the requested checks. Each check is independent; a gate that was
    /// not requested stays `None`.
    pub async fn execute(&self, request: &QualityGateRequest) -> QualityGateResult {
        tracing::info!(run_id = %request.run_id, project_id = %request.project_id, "quality gate execution started");

        let mut result = QualityGateResult {
            run_id: request.run_id.clone(),
            tests_passed: None,
            lint_passed: None,
            test_output: String::new(),
            lint_output: String::new(),
            error: String::new(),
        };

        if request.run_tests && !request.test_command.is_empty() {
            let (passed, output) = self
                .run_command(&request.test_command, &request.workspace_path)
                .await;
            result.tests_passed = Some(passed);
            result.test_output = output;
        }

        if request.run_lint && !request.lint_command.is_empty() {
            let (passed, output) = self
                .run_command(&request.lint_command, &request.workspace_path)
                .await;
            result.lint_passed = Some(passed);
            result.lint_output = output;
        }

        tracing::info!(
            run_id = %request.run_id,
            tests_passed = ?result.tests_passed,
            lint_passed = ?result.lint_passed,
            "quality gate execution completed"
        );
        result
    }

    /// Run one gate command through the shell, stderr folded into stdout.
    async fn run_command(&self, command: &str, cwd: &str) -> (bool, String) {
        tracing::debug!(command = command, cwd = cwd, "running gate command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(error) => return (false, error.to_string()),
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    text.push_str(&stderr);
                }
                let passed = output.status.success();
                tracing::info!(command = command, passed = passed, "gate command finished");
                (passed, text)
            }
            Ok(Err(error)) => (false, error.to_string()),
            Err(_) => {
                tracing::warn!(command = command, "gate command timed out");
                (
                    false,
                    format!("command timed out after {}s", self.timeout.as_secs()),
                )
            }
        }
    }
}

impl Default for QualityGateExecutor {
    fn default() -> Self {
        Self::new()
    }
}
