//! One bounded session: decision steps until the stop token or the step limit.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::conversation::{
    Conversation, DEFAULT_STOP_TOKEN, Message, contains_stop_token, step_messages,
    strip_stop_token,
};
use crate::core::types::SessionState;
use crate::io::decision::DecisionStep;
use crate::io::transcript::TranscriptSink;
use crate::retry::{RetryPolicy, Sleeper, with_retry};

/// Limits for a single session run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_steps: u32,
    pub retry: RetryPolicy,
    pub stop_token: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            retry: RetryPolicy::default(),
            stop_token: DEFAULT_STOP_TOKEN.to_string(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    /// `StoppedBySignal` or `StoppedByStepLimit`; failures are returned as errors.
    pub state: SessionState,
    pub steps: u32,
    /// Stop-token-stripped final text, or the last response at the step limit.
    pub final_text: Option<String>,
    pub conversation: Conversation,
}

/// Run one session from `conversation` (already seeded with the initial prompt).
///
/// The seed is written to the transcript before the first step. Every decision
/// call goes through [`with_retry`]; an exhausted retry budget ends the session
/// with an error after logging it as failed.
#[instrument(skip_all, fields(session_id = %transcript.session_id(), max_steps = config.max_steps))]
pub fn run_session<D, S, T>(
    conversation: Conversation,
    config: &SessionConfig,
    decision: &D,
    sleeper: &S,
    transcript: &mut T,
) -> Result<SessionOutcome>
where
    D: DecisionStep + ?Sized,
    S: Sleeper + ?Sized,
    T: TranscriptSink + ?Sized,
{
    let session_id = transcript.session_id().to_string();
    transcript
        .append(&conversation.messages)
        .context("write session seed to transcript")?;
    debug!(state = ?SessionState::Running, "session started");

    let mut conversation = conversation;
    let mut last_response = None;
    for step in 1..=config.max_steps {
        let response = match with_retry(&config.retry, sleeper, |_| decision.step(&conversation))
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    step,
                    state = ?SessionState::Failed,
                    err = %format!("{err:#}"),
                    "decision step failed after retries"
                );
                return Err(err.context(format!("session {session_id} failed at step {step}")));
            }
        };

        if contains_stop_token(&response.response, &config.stop_token) {
            let final_message = Message::assistant(response.response.clone());
            transcript
                .append(std::slice::from_ref(&final_message))
                .context("write final response to transcript")?;
            info!(step, "stop token received");
            return Ok(SessionOutcome {
                session_id,
                state: SessionState::StoppedBySignal,
                steps: step,
                final_text: Some(strip_stop_token(&response.response, &config.stop_token)),
                conversation: conversation.with_step(&[final_message]),
            });
        }

        let turns = step_messages(&response);
        transcript
            .append(&turns)
            .with_context(|| format!("write step {step} to transcript"))?;
        conversation = conversation.with_step(&turns);
        last_response = Some(response.response);
    }

    info!(steps = config.max_steps, "step limit reached");
    Ok(SessionOutcome {
        session_id,
        state: SessionState::StoppedByStepLimit,
        steps: config.max_steps,
        final_text: last_response,
        conversation,
    })
}
