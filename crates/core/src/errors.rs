use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::response::{AttemptViolations, RawResponse};
use crate::domain::role::Role;

/// Context composition failures. Caller errors, never retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("role {role} requires user text but none was provided")]
    MissingInput { role: Role },
    #[error("template `{template}` could not be compiled or rendered: {message}")]
    Template { template: String, message: String },
    #[error("no configuration registered for role {0}")]
    UnknownRole(Role),
}

/// Failure signalled by the completion boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "message", rename_all = "snake_case")]
pub enum CompletionError {
    /// Rate limiting, timeouts, upstream 5xx. Counted against the attempt budget.
    #[error("transient completion failure: {0}")]
    Transient(String),
    #[error("fatal completion failure: {0}")]
    Fatal(String),
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Fatal(message) => message,
        }
    }
}

/// Typed reason a role has no accepted response in a `TurnResult`.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchFailure {
    #[error("role {role} requires user text but none was provided")]
    MissingInput { role: Role },
    #[error("request composition failed: {message}")]
    Compose { message: String },
    #[error("completion boundary failed fatally on attempt {attempt}: {message}")]
    CompletionFatal { attempt: u32, message: String },
    #[error("completion boundary still unavailable after {attempts} attempts: {message}")]
    CompletionTransient { attempts: u32, message: String },
    #[error("guardrails rejected all {attempts} attempts")]
    GuardrailExhausted {
        attempts: u32,
        last_response: RawResponse,
        violations: Vec<AttemptViolations>,
    },
    #[error("turn deadline of {timeout_ms}ms elapsed before the branch finished")]
    CoordinatorTimeout { timeout_ms: u64 },
    #[error("session store unavailable: {message}")]
    SessionUnavailable { message: String },
    #[error("branch terminated abnormally: {message}")]
    Internal { message: String },
}

impl BranchFailure {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::MissingInput { .. } => "missing_input",
            Self::Compose { .. } => "compose",
            Self::CompletionFatal { .. } => "completion_fatal",
            Self::CompletionTransient { .. } => "completion_transient",
            Self::GuardrailExhausted { .. } => "guardrail_exhausted",
            Self::CoordinatorTimeout { .. } => "coordinator_timeout",
            Self::SessionUnavailable { .. } => "session_unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    /// The last rejected payload, when one exists, so callers can render a
    /// degraded placeholder instead of nothing.
    pub fn last_response(&self) -> Option<&RawResponse> {
        match self {
            Self::GuardrailExhausted { last_response, .. } => Some(last_response),
            _ => None,
        }
    }
}

impl From<ComposeError> for BranchFailure {
    fn from(value: ComposeError) -> Self {
        match value {
            ComposeError::MissingInput { role } => Self::MissingInput { role },
            other => Self::Compose { message: other.to_string() },
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("session `{0}` was not found")]
    NotFound(String),
    #[error("session storage failure: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::domain::response::RawResponse;
    use crate::domain::role::Role;
    use crate::errors::{BranchFailure, ComposeError, CompletionError};
    use crate::schema::OutputKind;

    #[test]
    fn missing_input_compose_error_keeps_its_own_failure_kind() {
        let failure =
            BranchFailure::from(ComposeError::MissingInput { role: Role::RetrospectiveAnalysis });
        assert_eq!(failure, BranchFailure::MissingInput { role: Role::RetrospectiveAnalysis });
        assert_eq!(failure.error_class(), "missing_input");

        let template = BranchFailure::from(ComposeError::Template {
            template: "holistic_review.prompt".to_owned(),
            message: "unexpected end".to_owned(),
        });
        assert_eq!(template.error_class(), "compose");
    }

    #[test]
    fn only_guardrail_exhaustion_exposes_a_last_response() {
        let exhausted = BranchFailure::GuardrailExhausted {
            attempts: 2,
            last_response: RawResponse::new(OutputKind::Guidance, json!({ "guidance": "x" })),
            violations: Vec::new(),
        };
        assert!(exhausted.last_response().is_some());

        let fatal = BranchFailure::CompletionFatal { attempt: 1, message: "bad key".to_owned() };
        assert!(fatal.last_response().is_none());
    }

    #[test]
    fn completion_error_retryability() {
        assert!(CompletionError::Transient("429".to_owned()).is_retryable());
        assert!(!CompletionError::Fatal("401".to_owned()).is_retryable());
    }
}
