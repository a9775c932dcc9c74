use rehearse_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use rehearse_core::{
    AttemptViolations, BranchFailure, CompletionError, RawResponse, RoleConfig, SchemaRegistry,
    Violation,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::guardrails::GuardrailValidator;
use crate::llm::{CompletionClient, CompletionRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MachineState {
    Idle,
    Attempting { attempt: u32 },
    Validating { attempt: u32 },
    Retrying { attempt: u32 },
    Accepted { attempt: u32 },
    Exhausted { attempts: u32 },
}

impl MachineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted { .. } | Self::Exhausted { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineEvent {
    Begin,
    CompletionReturned,
    CompletionFailed { retryable: bool },
    ValidationPassed,
    ViolationsFound,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RetryTransitionError {
    #[error("invalid retry transition from {state:?} on {event:?}")]
    InvalidTransition { state: MachineState, event: MachineEvent },
}

/// Pure transition table. `max_attempts` below one is treated as one.
pub fn transition(
    current: MachineState,
    event: MachineEvent,
    max_attempts: u32,
) -> Result<MachineState, RetryTransitionError> {
    let max_attempts = max_attempts.max(1);
    let retry_or_exhaust = |attempt: u32| {
        if attempt >= max_attempts {
            MachineState::Exhausted { attempts: attempt }
        } else {
            MachineState::Retrying { attempt }
        }
    };

    match (current, event) {
        (MachineState::Idle, MachineEvent::Begin) => Ok(MachineState::Attempting { attempt: 1 }),
        (MachineState::Retrying { attempt }, MachineEvent::Begin) => {
            Ok(MachineState::Attempting { attempt: attempt + 1 })
        }
        (MachineState::Attempting { attempt }, MachineEvent::CompletionReturned) => {
            Ok(MachineState::Validating { attempt })
        }
        (MachineState::Attempting { attempt }, MachineEvent::CompletionFailed { retryable: true }) => {
            Ok(retry_or_exhaust(attempt))
        }
        (MachineState::Attempting { attempt }, MachineEvent::CompletionFailed { retryable: false }) => {
            Ok(MachineState::Exhausted { attempts: attempt })
        }
        (MachineState::Validating { attempt }, MachineEvent::ValidationPassed) => {
            Ok(MachineState::Accepted { attempt })
        }
        (MachineState::Validating { attempt }, MachineEvent::ViolationsFound) => {
            Ok(retry_or_exhaust(attempt))
        }
        (state, event) => Err(RetryTransitionError::InvalidTransition { state, event }),
    }
}

/// Result of one generate-validate cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    Success(RawResponse),
    Retryable(RetryCause),
    Fatal(CompletionError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RetryCause {
    Violations { response: RawResponse, violations: Vec<Violation> },
    Transient(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcceptedResponse {
    pub response: RawResponse,
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BranchRun {
    pub result: Result<AcceptedResponse, BranchFailure>,
    /// Every state visited, starting with `Idle`.
    pub trace: Vec<MachineState>,
}

struct Cursor {
    state: MachineState,
    trace: Vec<MachineState>,
    max_attempts: u32,
}

impl Cursor {
    fn new(max_attempts: u32) -> Self {
        Self { state: MachineState::Idle, trace: vec![MachineState::Idle], max_attempts }
    }

    fn fire(&mut self, event: MachineEvent) -> Result<MachineState, RetryTransitionError> {
        self.state = transition(self.state, event, self.max_attempts)?;
        self.trace.push(self.state);
        Ok(self.state)
    }
}

/// Drives one role through the generate-validate-retry cycle for one turn.
///
/// The same request is sent on every attempt. Attempts are strictly
/// sequential.
pub struct RetryMachine<'a> {
    config: &'a RoleConfig,
    client: &'a dyn CompletionClient,
    validator: &'a GuardrailValidator,
    audit_sink: &'a dyn AuditSink,
    audit: &'a AuditContext,
}

impl<'a> RetryMachine<'a> {
    pub fn new(
        config: &'a RoleConfig,
        client: &'a dyn CompletionClient,
        validator: &'a GuardrailValidator,
        audit_sink: &'a dyn AuditSink,
        audit: &'a AuditContext,
    ) -> Self {
        Self { config, client, validator, audit_sink, audit }
    }

    pub async fn run(&self, request: &CompletionRequest) -> BranchRun {
        let mut cursor = Cursor::new(self.config.max_attempts.max(1));
        let result = match self.drive(request, &mut cursor).await {
            Ok(result) => result,
            Err(error) => Err(BranchFailure::Internal { message: error.to_string() }),
        };
        BranchRun { result, trace: cursor.trace }
    }

    async fn drive(
        &self,
        request: &CompletionRequest,
        cursor: &mut Cursor,
    ) -> Result<Result<AcceptedResponse, BranchFailure>, RetryTransitionError> {
        let mut history: Vec<AttemptViolations> = Vec::new();
        let mut last_rejected: Option<RawResponse> = None;
        let mut last_transient: Option<String> = None;

        loop {
            let attempt = match cursor.fire(MachineEvent::Begin)? {
                MachineState::Attempting { attempt } => attempt,
                state => {
                    return Err(RetryTransitionError::InvalidTransition {
                        state,
                        event: MachineEvent::Begin,
                    })
                }
            };

            let outcome = self.attempt(attempt, request, cursor).await?;
            match outcome {
                AttemptOutcome::Success(response) => {
                    info!(
                        event_name = "agent.attempt.accepted",
                        role = %self.config.role,
                        attempt,
                        correlation_id = %self.audit.correlation_id,
                        session_id = %self.audit.session_id,
                        "response accepted"
                    );
                    return Ok(Ok(AcceptedResponse { response, attempts: attempt }));
                }
                AttemptOutcome::Fatal(error) => {
                    warn!(
                        event_name = "agent.attempt.fatal",
                        role = %self.config.role,
                        attempt,
                        error = %error,
                        correlation_id = %self.audit.correlation_id,
                        session_id = %self.audit.session_id,
                        "completion failed fatally, not retrying"
                    );
                    self.audit_sink.emit(
                        AuditEvent::new(
                            self.audit,
                            "completion.failed",
                            AuditCategory::Completion,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("role", self.config.role.key())
                        .with_metadata("attempt", attempt.to_string())
                        .with_metadata("class", "fatal")
                        .with_metadata("message", error.message()),
                    );
                    return Ok(Err(BranchFailure::CompletionFatal {
                        attempt,
                        message: error.message().to_string(),
                    }));
                }
                AttemptOutcome::Retryable(cause) => {
                    match cause {
                        RetryCause::Violations { response, violations } => {
                            history.push(AttemptViolations { attempt, violations });
                            last_rejected = Some(response);
                        }
                        RetryCause::Transient(message) => {
                            warn!(
                                event_name = "agent.attempt.transient",
                                role = %self.config.role,
                                attempt,
                                error = %message,
                                correlation_id = %self.audit.correlation_id,
                                "completion failed transiently"
                            );
                            last_transient = Some(message);
                        }
                    }

                    if let MachineState::Exhausted { attempts } = cursor.state {
                        return Ok(Err(exhausted(attempts, history, last_rejected, last_transient)));
                    }
                    debug!(
                        event_name = "agent.attempt.retrying",
                        role = %self.config.role,
                        attempt,
                        max_attempts = cursor.max_attempts,
                        "retrying role"
                    );
                }
            }
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        request: &CompletionRequest,
        cursor: &mut Cursor,
    ) -> Result<AttemptOutcome, RetryTransitionError> {
        debug!(
            event_name = "agent.attempt.started",
            role = %self.config.role,
            attempt,
            max_attempts = cursor.max_attempts,
            correlation_id = %self.audit.correlation_id,
            session_id = %self.audit.session_id,
            "calling completion boundary"
        );

        let response = match self.call(request).await {
            Ok(response) => response,
            Err(error) => {
                cursor.fire(MachineEvent::CompletionFailed { retryable: error.is_retryable() })?;
                return Ok(match error {
                    CompletionError::Transient(message) => {
                        AttemptOutcome::Retryable(RetryCause::Transient(message))
                    }
                    fatal @ CompletionError::Fatal(_) => AttemptOutcome::Fatal(fatal),
                });
            }
        };

        cursor.fire(MachineEvent::CompletionReturned)?;
        let violations = self.validator.validate_with_audit(
            self.config.role,
            &response,
            self.audit_sink,
            self.audit,
        );
        if violations.is_empty() {
            cursor.fire(MachineEvent::ValidationPassed)?;
            Ok(AttemptOutcome::Success(response))
        } else {
            cursor.fire(MachineEvent::ViolationsFound)?;
            Ok(AttemptOutcome::Retryable(RetryCause::Violations { response, violations }))
        }
    }

    async fn call(&self, request: &CompletionRequest) -> Result<RawResponse, CompletionError> {
        let response = self.client.complete(request).await?;
        SchemaRegistry::conforms(&request.schema, &response).map_err(|mismatch| {
            CompletionError::Fatal(format!("completion boundary broke its schema contract: {mismatch}"))
        })?;
        Ok(response)
    }
}

/// Any rejected payload makes this a guardrail exhaustion, even when the
/// final attempt itself failed transiently.
fn exhausted(
    attempts: u32,
    violations: Vec<AttemptViolations>,
    last_rejected: Option<RawResponse>,
    last_transient: Option<String>,
) -> BranchFailure {
    match last_rejected {
        Some(last_response) => {
            BranchFailure::GuardrailExhausted { attempts, last_response, violations }
        }
        None => BranchFailure::CompletionTransient {
            attempts,
            message: last_transient.unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use rehearse_core::audit::{AuditContext, InMemoryAuditSink};
    use rehearse_core::{
        BranchFailure, CompletionError, ConversationTurn, OutputKind, PromptPayload, Role,
        RoleConfig,
    };
    use serde_json::{json, Value};

    use super::{transition, MachineEvent, MachineState, RetryMachine, RetryTransitionError};
    use crate::guardrails::{GuardrailRule, GuardrailRuleSet, GuardrailValidator};
    use crate::llm::CompletionRequest;
    use crate::scripted::{ScriptedCompletionClient, ScriptedReply};

    fn analysis(summary: &str) -> Value {
        json!({
            "rubric": [{ "criterion": "empati", "score": 3, "comment": "Okej ton." }],
            "summary": summary
        })
    }

    fn request(config: &RoleConfig) -> CompletionRequest {
        CompletionRequest::for_role(
            config,
            PromptPayload { messages: vec![ConversationTurn::user("Jag hör vad du säger.")] },
        )
    }

    fn analysis_config(max_attempts: u32) -> RoleConfig {
        RoleConfig { max_attempts, ..RoleConfig::builtin(Role::RetrospectiveAnalysis) }
    }

    #[test]
    fn transition_table_walks_the_happy_path() {
        let mut state = MachineState::Idle;
        for (event, expected) in [
            (MachineEvent::Begin, MachineState::Attempting { attempt: 1 }),
            (MachineEvent::CompletionReturned, MachineState::Validating { attempt: 1 }),
            (MachineEvent::ViolationsFound, MachineState::Retrying { attempt: 1 }),
            (MachineEvent::Begin, MachineState::Attempting { attempt: 2 }),
            (MachineEvent::CompletionReturned, MachineState::Validating { attempt: 2 }),
            (MachineEvent::ValidationPassed, MachineState::Accepted { attempt: 2 }),
        ] {
            state = transition(state, event, 3).expect("valid transition");
            assert_eq!(state, expected);
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn last_attempt_exhausts_instead_of_retrying() {
        let validating = MachineState::Validating { attempt: 3 };
        assert_eq!(
            transition(validating, MachineEvent::ViolationsFound, 3),
            Ok(MachineState::Exhausted { attempts: 3 })
        );

        let attempting = MachineState::Attempting { attempt: 3 };
        assert_eq!(
            transition(attempting, MachineEvent::CompletionFailed { retryable: true }, 3),
            Ok(MachineState::Exhausted { attempts: 3 })
        );
    }

    #[test]
    fn fatal_completion_exhausts_immediately() {
        let attempting = MachineState::Attempting { attempt: 1 };
        assert_eq!(
            transition(attempting, MachineEvent::CompletionFailed { retryable: false }, 5),
            Ok(MachineState::Exhausted { attempts: 1 })
        );
    }

    #[test]
    fn terminal_states_reject_further_events() {
        for state in [MachineState::Accepted { attempt: 1 }, MachineState::Exhausted { attempts: 2 }] {
            let error = transition(state, MachineEvent::Begin, 3).expect_err("terminal");
            assert_eq!(
                error,
                RetryTransitionError::InvalidTransition { state, event: MachineEvent::Begin }
            );
        }
    }

    #[tokio::test]
    async fn always_violating_responses_exhaust_after_exactly_max_attempts() {
        let validator = GuardrailValidator::new(&GuardrailRuleSet::builtin()).expect("builtin");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:retrospective_analysis");

        for max_attempts in 1..=4 {
            let client = ScriptedCompletionClient::default().with_reply(
                OutputKind::Analysis,
                ScriptedReply::payload(analysis("Nästa gång bör du pausa.")),
            );
            let config = analysis_config(max_attempts);
            let machine = RetryMachine::new(&config, &client, &validator, &sink, &audit);

            let run = machine.run(&request(&config)).await;

            assert_eq!(client.calls(OutputKind::Analysis), max_attempts as usize);
            assert_eq!(run.trace.last(), Some(&MachineState::Exhausted { attempts: max_attempts }));
            match run.result {
                Err(BranchFailure::GuardrailExhausted { attempts, last_response, violations }) => {
                    assert_eq!(attempts, max_attempts);
                    assert_eq!(violations.len(), max_attempts as usize);
                    assert_eq!(last_response.payload["summary"], "Nästa gång bör du pausa.");
                }
                other => panic!("expected guardrail exhaustion, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn compliant_guidance_is_accepted_on_first_attempt() {
        let rules = GuardrailRuleSet::default()
            .with_rule(Role::ForwardGuidance, GuardrailRule::literal("a", "du gjorde nyss"))
            .with_rule(Role::ForwardGuidance, GuardrailRule::literal("b", "tidigare svar"));
        let validator = GuardrailValidator::new(&rules).expect("rules compile");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:forward_guidance");
        let client = ScriptedCompletionClient::default().with_reply(
            OutputKind::Guidance,
            ScriptedReply::payload(json!({
                "guidance": "Nästa gång, fokusera på...",
                "focus_areas": []
            })),
        );
        let config = RoleConfig::builtin(Role::ForwardGuidance);
        let machine = RetryMachine::new(&config, &client, &validator, &sink, &audit);

        let run = machine.run(&request(&config)).await;

        let accepted = run.result.expect("accepted without retry");
        assert_eq!(accepted.attempts, 1);
        assert_eq!(run.trace.last(), Some(&MachineState::Accepted { attempt: 1 }));
        assert_eq!(client.calls(OutputKind::Guidance), 1);
        assert!(sink.events_of_type("guardrail.violation_detected").is_empty());
    }

    #[tokio::test]
    async fn analysis_recovers_on_second_attempt() {
        let validator = GuardrailValidator::new(&GuardrailRuleSet::builtin()).expect("builtin");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:retrospective_analysis");
        let client = ScriptedCompletionClient::default()
            .with_reply(OutputKind::Analysis, ScriptedReply::payload(analysis("Nästa gång, andas.")))
            .with_reply(OutputKind::Analysis, ScriptedReply::payload(analysis("Lugn och tydlig.")));
        let config = analysis_config(2);
        let machine = RetryMachine::new(&config, &client, &validator, &sink, &audit);

        let run = machine.run(&request(&config)).await;

        let accepted = run.result.expect("accepted on retry");
        assert_eq!(accepted.attempts, 2);
        assert_eq!(accepted.response.payload["summary"], "Lugn och tydlig.");
        assert!(run.trace.contains(&MachineState::Retrying { attempt: 1 }));
        assert_eq!(sink.events_of_type("guardrail.violation_detected").len(), 1);

        let requests = client.requests(OutputKind::Analysis);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let validator = GuardrailValidator::new(&GuardrailRuleSet::builtin()).expect("builtin");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:retrospective_analysis");
        let client = ScriptedCompletionClient::default().with_reply(
            OutputKind::Analysis,
            ScriptedReply::error(CompletionError::Fatal("401 Unauthorized".to_string())),
        );
        let config = analysis_config(3);
        let machine = RetryMachine::new(&config, &client, &validator, &sink, &audit);

        let run = machine.run(&request(&config)).await;

        assert_eq!(client.calls(OutputKind::Analysis), 1);
        assert_eq!(
            run.result,
            Err(BranchFailure::CompletionFatal {
                attempt: 1,
                message: "401 Unauthorized".to_string()
            })
        );
        assert_eq!(sink.events_of_type("completion.failed").len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_share_the_attempt_budget() {
        let validator = GuardrailValidator::new(&GuardrailRuleSet::builtin()).expect("builtin");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:retrospective_analysis");

        let flaky = ScriptedCompletionClient::default()
            .with_reply(
                OutputKind::Analysis,
                ScriptedReply::error(CompletionError::Transient("429".to_string())),
            )
            .with_reply(OutputKind::Analysis, ScriptedReply::payload(analysis("Bra lyssnat.")));
        let config = analysis_config(3);
        let run = RetryMachine::new(&config, &flaky, &validator, &sink, &audit)
            .run(&request(&config))
            .await;
        assert_eq!(run.result.map(|accepted| accepted.attempts), Ok(2));

        let down = ScriptedCompletionClient::default().with_reply(
            OutputKind::Analysis,
            ScriptedReply::error(CompletionError::Transient("503".to_string())),
        );
        let run = RetryMachine::new(&config, &down, &validator, &sink, &audit)
            .run(&request(&config))
            .await;
        assert_eq!(down.calls(OutputKind::Analysis), 3);
        assert_eq!(
            run.result,
            Err(BranchFailure::CompletionTransient { attempts: 3, message: "503".to_string() })
        );
    }

    #[tokio::test]
    async fn rejected_payload_wins_over_a_trailing_transient_failure() {
        let validator = GuardrailValidator::new(&GuardrailRuleSet::builtin()).expect("builtin");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:retrospective_analysis");
        let client = ScriptedCompletionClient::default()
            .with_reply(OutputKind::Analysis, ScriptedReply::payload(analysis("I framtiden, le.")))
            .with_reply(
                OutputKind::Analysis,
                ScriptedReply::error(CompletionError::Transient("timeout".to_string())),
            );
        let config = analysis_config(2);

        let run = RetryMachine::new(&config, &client, &validator, &sink, &audit)
            .run(&request(&config))
            .await;

        let failure = run.result.expect_err("exhausted");
        assert_eq!(failure.error_class(), "guardrail_exhausted");
        assert!(failure.last_response().is_some());
    }

    #[tokio::test]
    async fn schema_mismatch_is_treated_as_fatal() {
        let validator = GuardrailValidator::new(&GuardrailRuleSet::builtin()).expect("builtin");
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new("S-1", "turn-1", "agent:retrospective_analysis");
        let client = ScriptedCompletionClient::default()
            .with_reply(OutputKind::Analysis, ScriptedReply::payload(json!({ "summary": "x" })));
        let config = analysis_config(3);

        let run = RetryMachine::new(&config, &client, &validator, &sink, &audit)
            .run(&request(&config))
            .await;

        assert_eq!(client.calls(OutputKind::Analysis), 1);
        assert!(matches!(run.result, Err(BranchFailure::CompletionFatal { attempt: 1, .. })));
    }
}
