use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rehearse_core::audit::AuditSink;
use rehearse_core::config::{AppConfig, ConfigError};
use rehearse_core::{
    BranchFailure, ComposeError, ConversationTurn, Role, RoleOutcome, SessionStore,
    SessionStoreError, TurnResult,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::composer::ContextComposer;
use crate::fanout::{FanOutCoordinator, TurnInput};
use crate::guardrails::{GuardrailError, GuardrailRuleSet, GuardrailValidator};
use crate::llm::CompletionClient;

#[derive(Debug, Error)]
pub enum RuntimeBuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Guardrail(#[from] GuardrailError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// Entry point for one user turn against a stored session.
pub struct AgentRuntime {
    store: Arc<dyn SessionStore>,
    coordinator: FanOutCoordinator,
}

impl AgentRuntime {
    pub fn new(store: Arc<dyn SessionStore>, coordinator: FanOutCoordinator) -> Self {
        Self { store, coordinator }
    }

    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn SessionStore>,
        client: Arc<dyn CompletionClient>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Result<Self, RuntimeBuildError> {
        let coordinator = build_coordinator(config, client, audit_sink)?;
        Ok(Self::new(store, coordinator))
    }

    pub fn coordinator(&self) -> &FanOutCoordinator {
        &self.coordinator
    }

    /// Never fails: every problem, including an unreachable session store, is
    /// reported per role inside the returned [`TurnResult`].
    ///
    /// Non-blank user text is appended to the session exactly once, before
    /// any role runs. Roles compose against the history as loaded.
    pub async fn process_turn(
        &self,
        session_id: &str,
        user_text: &str,
        enabled_roles: &BTreeSet<Role>,
    ) -> TurnResult {
        let turn_id = Uuid::new_v4().to_string();

        let snapshot = match self.store.load(session_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => return session_unavailable(session_id, &turn_id, enabled_roles, &error),
        };

        let user_text = (!user_text.trim().is_empty()).then(|| user_text.to_string());
        if let Some(text) = &user_text {
            if let Err(error) =
                self.store.append_turn(session_id, ConversationTurn::user(text.clone())).await
            {
                return session_unavailable(session_id, &turn_id, enabled_roles, &error);
            }
        }

        info!(
            event_name = "agent.turn.received",
            correlation_id = %turn_id,
            session_id = %session_id,
            history_len = snapshot.history.len(),
            has_user_text = user_text.is_some(),
            "processing user turn"
        );

        self.coordinator
            .run_turn(TurnInput {
                session_id: session_id.to_string(),
                turn_id,
                protocol_ids: snapshot.protocol_ids,
                params: snapshot.params,
                history: snapshot.history,
                user_text,
                enabled_roles: enabled_roles.clone(),
            })
            .await
    }
}

/// Builds the coordinator from validated configuration. Shared with the CLI,
/// which runs turns without a session store.
pub fn build_coordinator(
    config: &AppConfig,
    client: Arc<dyn CompletionClient>,
    audit_sink: Arc<dyn AuditSink>,
) -> Result<FanOutCoordinator, RuntimeBuildError> {
    let registry = config.role_registry()?;
    let rules = GuardrailRuleSet::builtin().with_extra_patterns(&config.guardrails);
    let validator = GuardrailValidator::new(&rules)?;
    let composer = ContextComposer::new(&registry, config.pipeline.history_window)?;

    Ok(FanOutCoordinator::new(
        Arc::new(registry),
        Arc::new(composer),
        client,
        Arc::new(validator),
        audit_sink,
        Duration::from_secs(config.pipeline.turn_timeout_secs),
    ))
}

fn session_unavailable(
    session_id: &str,
    turn_id: &str,
    enabled_roles: &BTreeSet<Role>,
    error: &SessionStoreError,
) -> TurnResult {
    warn!(
        event_name = "agent.turn.session_unavailable",
        correlation_id = %turn_id,
        session_id = %session_id,
        error = %error,
        "session store failed, no role will run"
    );
    let outcomes = enabled_roles
        .iter()
        .map(|role| {
            (
                *role,
                RoleOutcome::failed(BranchFailure::SessionUnavailable {
                    message: error.to_string(),
                }),
            )
        })
        .collect::<BTreeMap<_, _>>();
    TurnResult::new(session_id, turn_id, outcomes)
}
