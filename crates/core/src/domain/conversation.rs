use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::role::Role;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    System,
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
}

impl ConversationTurn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self { speaker, text: text.into() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Speaker::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Speaker::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Speaker::Assistant, text)
    }
}

/// Whether a role read another role's output from the same turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySignal {
    /// The role consumes nothing.
    NotApplicable,
    /// The dependency had not been accepted by the time this branch finished.
    Absent,
    /// The dependency was accepted before this branch finished; its validated
    /// output travels with the branch outcome.
    Consumed,
}

/// Immutable per-call snapshot handed to the completion boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub session_id: String,
    pub role: Role,
    pub protocol_ids: Vec<String>,
    pub window: Vec<ConversationTurn>,
    pub params: BTreeMap<String, String>,
    /// Whether the dependency was already accepted when the request was built.
    pub dependency: DependencySignal,
}

/// Literal message list sent to the completion boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PromptPayload {
    pub messages: Vec<ConversationTurn>,
}

impl PromptPayload {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
