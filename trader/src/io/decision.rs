//! Decision-step abstraction.
//!
//! The [`DecisionStep`] trait decouples the session loop from whatever produces
//! the next response (a model, a human, a script). Tests use scripted steps that
//! return predetermined responses without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::conversation::{Conversation, StepResponse};
use crate::io::config::{ConfigError, DecisionConfig};
use crate::io::process::run_command_with_timeout;

/// One call to the external decision maker. Failures are treated as transient.
pub trait DecisionStep {
    fn step(&self, conversation: &Conversation) -> Result<StepResponse>;
}

impl<D: DecisionStep + ?Sized> DecisionStep for Box<D> {
    fn step(&self, conversation: &Conversation) -> Result<StepResponse> {
        (**self).step(conversation)
    }
}

/// Runs a configured command per step.
///
/// The conversation is written to stdin as JSON; stdout must be a single JSON
/// object `{"response": "...", "tool_outputs": ["..."]}`.
#[derive(Debug, Clone)]
pub struct CommandDecisionStep {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandDecisionStep {
    pub fn new(command: &[String], timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("decision command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            output_limit_bytes,
        })
    }

    pub fn from_config(config: &DecisionConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(ConfigError::EmptyCommand.into());
        }
        Self::new(
            &config.command,
            Duration::from_secs(config.timeout_secs),
            config.output_limit_bytes,
        )
    }
}

impl DecisionStep for CommandDecisionStep {
    #[instrument(skip_all, fields(program = %self.program, messages = conversation.len()))]
    fn step(&self, conversation: &Conversation) -> Result<StepResponse> {
        let input = serde_json::to_vec(conversation).context("serialize conversation")?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        let output =
            run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
                .with_context(|| format!("run decision command {}", self.program))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "decision command timed out");
            return Err(anyhow!("decision command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "decision command failed");
            return Err(anyhow!(
                "decision command failed with status {:?}: {}{}",
                output.status.code(),
                stderr.trim(),
                output.stderr_truncated_notice("decision")
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "decision output exceeded {} bytes{}",
                self.output_limit_bytes,
                output.stdout_truncated_notice("decision")
            ));
        }

        let response: StepResponse = serde_json::from_slice(&output.stdout)
            .context("parse decision output as {\"response\", \"tool_outputs\"}")?;
        debug!(
            response_len = response.response.len(),
            tool_outputs = response.tool_outputs.len(),
            "decision step completed"
        );
        Ok(response)
    }
}
