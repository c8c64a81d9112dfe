//! Owned conversation state threaded through each decision step.

use serde::{Deserialize, Serialize};

/// Marker the decision step emits to end a session voluntarily.
pub const DEFAULT_STOP_TOKEN: &str = "<FINISH_SIGNAL>";

const TOOL_RESULTS_PREFIX: &str = "Tool results: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Tool outputs are fed back to the model as a single user turn.
    pub fn tool_results(outputs: &[String]) -> Self {
        Self::user(format!("{TOOL_RESULTS_PREFIX}{}", outputs.join("\n")))
    }
}

/// What one decision step produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResponse {
    pub response: String,
    #[serde(default)]
    pub tool_outputs: Vec<String>,
}

impl StepResponse {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            tool_outputs: Vec::new(),
        }
    }
}

/// Conversation buffer for one session. Never shared between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn seeded(system_prompt: Option<String>, initial_prompt: &str) -> Self {
        Self {
            system_prompt,
            messages: vec![Message::user(initial_prompt)],
        }
    }

    /// Consume the conversation and return it extended with one step's turns.
    pub fn with_step(mut self, step: &[Message]) -> Self {
        self.messages.extend_from_slice(step);
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Turns a non-terminal step appends: the response, then its tool output if it had any.
pub fn step_messages(step: &StepResponse) -> Vec<Message> {
    let mut turns = vec![Message::assistant(step.response.clone())];
    if !step.tool_outputs.is_empty() {
        turns.push(Message::tool_results(&step.tool_outputs));
    }
    turns
}

pub fn contains_stop_token(text: &str, token: &str) -> bool {
    !token.is_empty() && text.contains(token)
}

pub fn strip_stop_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.trim().to_string();
    }
    text.replace(token, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_step_appends_in_order() {
        let conversation = Conversation::seeded(None, "analyze");
        let step = StepResponse {
            response: "checking quotes".to_string(),
            tool_outputs: vec!["q1".to_string(), "q2".to_string()],
        };

        let next = conversation.with_step(&step_messages(&step));

        assert_eq!(next.len(), 3);
        assert_eq!(next.messages[1], Message::assistant("checking quotes"));
        assert_eq!(next.messages[2], Message::user("Tool results: q1\nq2"));
    }

    #[test]
    fn step_without_tool_outputs_adds_only_the_response() {
        let turns = step_messages(&StepResponse::text("holding"));
        assert_eq!(turns, vec![Message::assistant("holding")]);
    }

    #[test]
    fn strips_every_stop_token_occurrence() {
        let text = "  done <FINISH_SIGNAL> really <FINISH_SIGNAL>\n";
        assert!(contains_stop_token(text, DEFAULT_STOP_TOKEN));
        assert_eq!(strip_stop_token(text, DEFAULT_STOP_TOKEN), "done  really");
    }

    #[test]
    fn empty_token_never_matches() {
        assert!(!contains_stop_token("anything", ""));
    }

    #[test]
    fn step_response_tolerates_missing_tool_outputs() {
        let parsed: StepResponse = serde_json::from_str(r#"{"response":"hi"}"#).unwrap();
        assert_eq!(parsed, StepResponse::text("hi"));
    }
}
