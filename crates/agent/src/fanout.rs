//! One user turn, every enabled role, concurrently.
//!
//! Each role runs on its own task. A branch that fails, exhausts or panics
//! only produces a typed entry for its own role; siblings are never
//! cancelled. The only cross-branch data flow is the dependency board: a
//! consuming role reads its dependency's accepted response when it reaches a
//! terminal state, and never waits for it. A dependency accepted later than
//! that is reported as absent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rehearse_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use rehearse_core::{
    BranchFailure, ComposeError, ConversationTurn, DependencySignal, RawResponse, Role,
    RoleOutcome, RoleRegistry, TurnResult,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::composer::{ComposeInput, ContextComposer, PriorOutput};
use crate::guardrails::GuardrailValidator;
use crate::llm::{CompletionClient, CompletionRequest};
use crate::retry::RetryMachine;

/// Everything a turn needs, already read from the session store.
#[derive(Clone, Debug, Default)]
pub struct TurnInput {
    pub session_id: String,
    pub turn_id: String,
    pub protocol_ids: Vec<String>,
    pub params: BTreeMap<String, String>,
    /// History as it was before this turn's user text was appended.
    pub history: Vec<ConversationTurn>,
    pub user_text: Option<String>,
    pub enabled_roles: BTreeSet<Role>,
}

#[derive(Clone)]
pub struct FanOutCoordinator {
    registry: Arc<RoleRegistry>,
    composer: Arc<ContextComposer>,
    client: Arc<dyn CompletionClient>,
    validator: Arc<GuardrailValidator>,
    audit_sink: Arc<dyn AuditSink>,
    turn_timeout: Duration,
}

impl FanOutCoordinator {
    pub fn new(
        registry: Arc<RoleRegistry>,
        composer: Arc<ContextComposer>,
        client: Arc<dyn CompletionClient>,
        validator: Arc<GuardrailValidator>,
        audit_sink: Arc<dyn AuditSink>,
        turn_timeout: Duration,
    ) -> Self {
        Self { registry, composer, client, validator, audit_sink, turn_timeout }
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.audit_sink
    }

    /// Always returns exactly one outcome per enabled role.
    ///
    /// Branches still running at the deadline are reported as
    /// [`BranchFailure::CoordinatorTimeout`] and left to finish in the
    /// background; their late results are discarded.
    pub async fn run_turn(&self, input: TurnInput) -> TurnResult {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.turn_timeout;
        let requested = input.enabled_roles.iter().copied().collect::<Vec<_>>();
        let session_id = input.session_id.clone();
        let turn_id = input.turn_id.clone();
        let audit = AuditContext::new(&session_id, &turn_id, "fanout-coordinator");

        info!(
            event_name = "agent.turn.started",
            correlation_id = %turn_id,
            session_id = %session_id,
            roles = %role_list(&requested),
            timeout_ms = duration_ms(self.turn_timeout),
            "fanning out turn"
        );

        let shared = Arc::new(BranchShared {
            coordinator: self.clone(),
            board: DependencyBoard::new(&input.enabled_roles),
            audit: audit.clone(),
            input,
        });

        let (sender, mut receiver) = mpsc::unbounded_channel::<(Role, RoleOutcome)>();
        for role in requested.iter().copied() {
            let sender = sender.clone();
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let outcome = match tokio::spawn(run_branch(shared, role)).await {
                    Ok(outcome) => outcome,
                    Err(error) => RoleOutcome::failed(BranchFailure::Internal {
                        message: format!("branch task ended abnormally: {error}"),
                    }),
                };
                // the receiver is gone once the turn has timed out
                let _ = sender.send((role, outcome));
            });
        }
        drop(sender);

        let mut outcomes = BTreeMap::new();
        let mut timed_out = false;
        while outcomes.len() < requested.len() {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some((role, outcome))) => {
                    outcomes.insert(role, outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let timeout_ms = duration_ms(self.turn_timeout);
        for role in requested.iter().copied() {
            outcomes.entry(role).or_insert_with(|| {
                if timed_out {
                    RoleOutcome::failed(BranchFailure::CoordinatorTimeout { timeout_ms })
                } else {
                    RoleOutcome::failed(BranchFailure::Internal {
                        message: "branch ended without reporting an outcome".to_string(),
                    })
                }
            });
        }

        if timed_out {
            let pending = outcomes
                .iter()
                .filter(|(_, outcome)| {
                    matches!(
                        outcome.failure(),
                        Some(BranchFailure::CoordinatorTimeout { .. })
                    )
                })
                .map(|(role, _)| *role)
                .collect::<Vec<_>>();
            warn!(
                event_name = "agent.turn.timeout",
                correlation_id = %turn_id,
                session_id = %session_id,
                pending_roles = %role_list(&pending),
                timeout_ms,
                "turn deadline elapsed with branches still running"
            );
            self.audit_sink.emit(
                AuditEvent::new(&audit, "turn.timeout", AuditCategory::Turn, AuditOutcome::Failed)
                    .with_metadata("pending_roles", role_list(&pending))
                    .with_metadata("timeout_ms", timeout_ms.to_string()),
            );
        }

        for (role, outcome) in &outcomes {
            self.record_outcome(&audit, *role, outcome);
        }

        let result = TurnResult::new(session_id, turn_id, outcomes);
        info!(
            event_name = "agent.turn.completed",
            correlation_id = %result.turn_id(),
            session_id = %result.session_id(),
            accepted = %role_list(&result.accepted_roles()),
            failed = %role_list(&result.failed_roles()),
            elapsed_ms = duration_ms(started.elapsed()),
            "turn completed"
        );
        result
    }

    fn record_outcome(&self, audit: &AuditContext, role: Role, outcome: &RoleOutcome) {
        info!(
            event_name = "agent.branch.completed",
            correlation_id = %audit.correlation_id,
            session_id = %audit.session_id,
            role = %role,
            accepted = outcome.is_accepted(),
            error_class = outcome.failure().map(BranchFailure::error_class).unwrap_or("none"),
            "branch finished"
        );
        let audit = audit.with_actor(format!("agent:{}", role.key()));
        let event = match outcome {
            RoleOutcome::Accepted { attempts, dependency, .. } => AuditEvent::new(
                &audit,
                "branch.accepted",
                AuditCategory::Branch,
                AuditOutcome::Success,
            )
            .with_metadata("role", role.key())
            .with_metadata("attempts", attempts.to_string())
            .with_metadata("dependency", format!("{dependency:?}")),
            RoleOutcome::Failed { failure } => AuditEvent::new(
                &audit,
                "branch.failed",
                AuditCategory::Branch,
                AuditOutcome::Failed,
            )
            .with_metadata("role", role.key())
            .with_metadata("error_class", failure.error_class())
            .with_metadata("message", failure.to_string()),
        };
        self.audit_sink.emit(event);
    }
}

struct BranchShared {
    coordinator: FanOutCoordinator,
    board: DependencyBoard,
    audit: AuditContext,
    input: TurnInput,
}

/// Write-once slots for accepted responses of the current turn.
struct DependencyBoard {
    slots: BTreeMap<Role, OnceLock<RawResponse>>,
}

impl DependencyBoard {
    fn new(roles: &BTreeSet<Role>) -> Self {
        Self { slots: roles.iter().map(|role| (*role, OnceLock::new())).collect() }
    }

    fn publish(&self, role: Role, response: RawResponse) {
        if let Some(slot) = self.slots.get(&role) {
            let _ = slot.set(response);
        }
    }

    fn peek(&self, role: Role) -> Option<&RawResponse> {
        self.slots.get(&role).and_then(OnceLock::get)
    }
}

async fn run_branch(shared: Arc<BranchShared>, role: Role) -> RoleOutcome {
    let coordinator = &shared.coordinator;
    let Some(config) = coordinator.registry.get(role) else {
        return RoleOutcome::failed(ComposeError::UnknownRole(role).into());
    };

    let prior_output = match role.consumes() {
        None => PriorOutput::NotApplicable,
        Some(dependency) => match shared.board.peek(dependency) {
            Some(response) => PriorOutput::Available(response),
            None => PriorOutput::Absent,
        },
    };

    let input = &shared.input;
    let composed = match coordinator.composer.compose(
        config,
        &ComposeInput {
            session_id: &input.session_id,
            history: &input.history,
            protocol_ids: &input.protocol_ids,
            params: &input.params,
            user_text: input.user_text.as_deref(),
            prior_output,
        },
    ) {
        Ok(composed) => composed,
        Err(error) => {
            warn!(
                event_name = "agent.branch.compose_failed",
                role = %role,
                error = %error,
                correlation_id = %input.turn_id,
                session_id = %input.session_id,
                "could not compose request"
            );
            return RoleOutcome::failed(error.into());
        }
    };

    let request = CompletionRequest::for_role(config, composed.payload);
    let audit = shared.audit.with_actor(format!("agent:{}", role.key()));
    let run = RetryMachine::new(
        config,
        coordinator.client.as_ref(),
        coordinator.validator.as_ref(),
        coordinator.audit_sink.as_ref(),
        &audit,
    )
    .run(&request)
    .await;

    match run.result {
        Ok(accepted) => {
            shared.board.publish(role, accepted.response.clone());
            let (dependency, dependency_output) = match role.consumes() {
                None => (DependencySignal::NotApplicable, None),
                Some(dependency) => match shared.board.peek(dependency) {
                    Some(response) => (DependencySignal::Consumed, Some(response.clone())),
                    None => (DependencySignal::Absent, None),
                },
            };
            RoleOutcome::Accepted {
                response: accepted.response,
                attempts: accepted.attempts,
                dependency,
                dependency_output,
            }
        }
        Err(failure) => RoleOutcome::failed(failure),
    }
}

fn role_list(roles: &[Role]) -> String {
    roles.iter().map(Role::key).collect::<Vec<_>>().join(",")
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
