use std::path::Path;
use std::sync::Arc;

use rehearse_agent::{AgentRuntime, CompletionClient, HttpCompletionClient};
use rehearse_core::audit::TracingAuditSink;
use rehearse_core::config::{AppConfig, LoadOptions};
use rehearse_core::InMemorySessionStore;

use crate::commands::{transcript, CommandResult};

pub fn run(transcript_path: &Path, user_text: &str, roles: Option<&str>) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("turn", "config_validation", error.to_string(), 2)
        }
    };

    let client = match HttpCompletionClient::from_config(&config.llm) {
        Ok(client) => client,
        Err(error) => {
            return CommandResult::failure("turn", "completion_client", error.to_string(), 2)
        }
    };

    run_with_client(&config, Arc::new(client), transcript_path, user_text, roles)
}

/// Runs one turn over an in-memory copy of the transcript. The transcript
/// file itself is never modified.
pub fn run_with_client(
    config: &AppConfig,
    client: Arc<dyn CompletionClient>,
    transcript_path: &Path,
    user_text: &str,
    roles: Option<&str>,
) -> CommandResult {
    let snapshot = match transcript::load(transcript_path) {
        Ok(snapshot) => snapshot,
        Err(error) => return CommandResult::failure("turn", "transcript", format!("{error:#}"), 2),
    };

    let enabled_roles = match roles {
        Some(raw) => match transcript::parse_roles(raw) {
            Ok(roles) => roles,
            Err(error) => {
                return CommandResult::failure("turn", "invalid_role", format!("{error:#}"), 2)
            }
        },
        None => snapshot.enabled_roles.clone(),
    };

    let session_id = snapshot.session_id.clone();
    let store = InMemorySessionStore::default();
    store.insert(snapshot);

    let runtime = match AgentRuntime::from_config(
        config,
        Arc::new(store),
        client,
        Arc::new(TracingAuditSink),
    ) {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure("turn", "config_validation", error.to_string(), 2)
        }
    };

    let async_runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "turn",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                1,
            )
        }
    };

    let result =
        async_runtime.block_on(runtime.process_turn(&session_id, user_text, &enabled_roles));
    CommandResult::json("turn", &result)
}
