use std::path::Path;

use rehearse_agent::{ComposeInput, ContextComposer, PriorOutput};
use rehearse_core::config::{AppConfig, LoadOptions};
use rehearse_core::{PromptPayload, RequestContext, Role};
use serde::Serialize;

use crate::commands::{transcript, CommandResult};

#[derive(Debug, Serialize)]
struct ComposeReport {
    command: &'static str,
    role: Role,
    context: RequestContext,
    payload: PromptPayload,
}

/// Dry run: no completion call is made, so a consuming role always composes
/// as if its dependency had not finished yet.
pub fn run(role: &str, transcript_path: &Path, user_text: Option<&str>) -> CommandResult {
    let role = match role.parse::<Role>() {
        Ok(role) => role,
        Err(error) => {
            return CommandResult::failure("compose", "invalid_role", error.to_string(), 2)
        }
    };

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("compose", "config_validation", error.to_string(), 2)
        }
    };

    let snapshot = match transcript::load(transcript_path) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            return CommandResult::failure("compose", "transcript", format!("{error:#}"), 2)
        }
    };

    let registry = match config.role_registry() {
        Ok(registry) => registry,
        Err(error) => {
            return CommandResult::failure("compose", "config_validation", error.to_string(), 2)
        }
    };
    let Some(role_config) = registry.get(role) else {
        let message = format!("role {role} is not configured");
        return CommandResult::failure("compose", "invalid_role", message, 2);
    };

    let composed = ContextComposer::new(&registry, config.pipeline.history_window).and_then(
        |composer| {
            composer.compose(
                role_config,
                &ComposeInput {
                    session_id: &snapshot.session_id,
                    history: &snapshot.history,
                    protocol_ids: &snapshot.protocol_ids,
                    params: &snapshot.params,
                    user_text,
                    prior_output: match role.consumes() {
                        Some(_) => PriorOutput::Absent,
                        None => PriorOutput::NotApplicable,
                    },
                },
            )
        },
    );

    match composed {
        Ok(composed) => CommandResult::json(
            "compose",
            &ComposeReport {
                command: "compose",
                role,
                context: composed.context,
                payload: composed.payload,
            },
        ),
        Err(error) => CommandResult::failure("compose", "compose", error.to_string(), 1),
    }
}
