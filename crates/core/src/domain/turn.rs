use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::conversation::DependencySignal;
use crate::domain::response::RawResponse;
use crate::domain::role::Role;
use crate::errors::BranchFailure;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleOutcome {
    Accepted {
        response: RawResponse,
        attempts: u32,
        dependency: DependencySignal,
        /// Validated output of the dependency, present when `dependency` is
        /// [`DependencySignal::Consumed`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dependency_output: Option<RawResponse>,
    },
    Failed { failure: BranchFailure },
}

impl RoleOutcome {
    pub fn failed(failure: BranchFailure) -> Self {
        Self::Failed { failure }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn response(&self) -> Option<&RawResponse> {
        match self {
            Self::Accepted { response, .. } => Some(response),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&BranchFailure> {
        match self {
            Self::Accepted { .. } => None,
            Self::Failed { failure } => Some(failure),
        }
    }
}

/// Per-turn aggregate of every requested role. Holds exactly one entry per
/// requested role and is not mutated after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    session_id: String,
    turn_id: String,
    outcomes: BTreeMap<Role, RoleOutcome>,
}

impl TurnResult {
    pub fn new(
        session_id: impl Into<String>,
        turn_id: impl Into<String>,
        outcomes: BTreeMap<Role, RoleOutcome>,
    ) -> Self {
        Self { session_id: session_id.into(), turn_id: turn_id.into(), outcomes }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn get(&self, role: Role) -> Option<&RoleOutcome> {
        self.outcomes.get(&role)
    }

    pub fn outcomes(&self) -> &BTreeMap<Role, RoleOutcome> {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn accepted_roles(&self) -> Vec<Role> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_accepted())
            .map(|(role, _)| *role)
            .collect()
    }

    pub fn failed_roles(&self) -> Vec<Role> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_accepted())
            .map(|(role, _)| *role)
            .collect()
    }
}
