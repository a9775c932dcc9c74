use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use rehearse_agent::{ScriptedCompletionClient, ScriptedReply};
use rehearse_cli::commands::{compose, config, doctor, turn};
use rehearse_core::config::AppConfig;
use rehearse_core::{CompletionError, OutputKind};
use serde_json::{json, Value};
use tempfile::TempDir;

const USER_TEXT: &str = "Jag förstår att det här är frustrerande.";

#[test]
fn doctor_passes_with_default_config() {
    with_env(&[], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "expected all readiness checks to pass");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");
        let names = payload["checks"]
            .as_array()
            .map(|checks| {
                checks.iter().filter_map(|check| check["name"].as_str()).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        assert_eq!(
            names,
            vec![
                "config_validation",
                "role_registry",
                "prompt_templates",
                "guardrail_rules",
                "completion_client"
            ]
        );
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("REHEARSE_LLM_PROVIDER", "openai")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        assert_eq!(payload["checks"][0]["status"], "fail");
        assert_eq!(payload["checks"][1]["status"], "skipped");
    });
}

#[test]
fn doctor_human_output_lists_checks() {
    with_env(&[], || {
        let result = doctor::run(false);
        assert!(result.output.starts_with("doctor: all readiness checks passed"));
        assert!(result.output.contains("- [ok] guardrail_rules:"));
    });
}

#[test]
fn config_redacts_api_key_and_reports_env_source() {
    with_env(
        &[
            ("REHEARSE_LLM_PROVIDER", "openai"),
            ("REHEARSE_LLM_API_KEY", "sk-supersecret"),
            ("REHEARSE_LLM_BASE_URL", "https://api.openai.com/v1"),
        ],
        || {
            let output = config::run();
            assert!(output.contains("- llm.api_key = sk-*** (source: env (REHEARSE_LLM_API_KEY))"));
            assert!(output.contains("- llm.model = llama3.1 (source: default)"));
            assert!(output.contains("- roles.forward_guidance = <builtin> (source: default)"));
            assert!(!output.contains("supersecret"));
        },
    );
}

#[test]
fn compose_prints_the_payload_for_one_role() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let path = write_transcript(&dir);

        let result = compose::run("retrospective-analysis", &path, Some(USER_TEXT));
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["role"], "retrospective_analysis");
        assert_eq!(payload["context"]["dependency"], "not_applicable");
        let messages = payload["payload"]["messages"].as_array().cloned().unwrap_or_default();
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[4]["speaker"], "system");
        assert_eq!(messages[5]["speaker"], "user");
        assert_eq!(messages[5]["text"], USER_TEXT);
    });
}

#[test]
fn compose_reports_missing_input_and_unknown_roles() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let path = write_transcript(&dir);

        let missing = compose::run("retrospective_analysis", &path, None);
        assert_eq!(missing.exit_code, 1);
        assert_eq!(parse_payload(&missing.output)["error_class"], "compose");

        let unknown = compose::run("cheerleader", &path, Some(USER_TEXT));
        assert_eq!(unknown.exit_code, 2);
        assert_eq!(parse_payload(&unknown.output)["error_class"], "invalid_role");
    });
}

#[test]
fn compose_reports_unreadable_transcripts() {
    with_env(&[], || {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("missing.json");

        let result = compose::run("holistic_review", &path, None);
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "transcript");
    });
}

#[test]
fn turn_runs_selected_roles_without_touching_the_transcript() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_transcript(&dir);
    let before = fs::read_to_string(&path).expect("transcript readable");
    let client = ScriptedCompletionClient::default()
        .with_reply(
            OutputKind::Guidance,
            ScriptedReply::payload(json!({ "guidance": "Spegla känslan.", "focus_areas": [] })),
        )
        .with_reply(
            OutputKind::Review,
            ScriptedReply::error(CompletionError::Fatal("401 Unauthorized".to_string())),
        );

    let result = turn::run_with_client(
        &AppConfig::default(),
        Arc::new(client.clone()),
        &path,
        USER_TEXT,
        Some("forward_guidance, holistic_review"),
    );
    assert_eq!(result.exit_code, 0, "{}", result.output);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["session_id"], "S-2026-0042");
    assert_eq!(payload["outcomes"]["forward_guidance"]["status"], "accepted");
    assert_eq!(payload["outcomes"]["holistic_review"]["failure"]["kind"], "completion_fatal");
    assert!(payload["outcomes"].get("retrospective_analysis").is_none());
    assert_eq!(client.calls(OutputKind::Analysis), 0);

    let after = fs::read_to_string(&path).expect("transcript readable");
    assert_eq!(before, after);
}

#[test]
fn turn_rejects_unknown_roles() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_transcript(&dir);

    let result = turn::run_with_client(
        &AppConfig::default(),
        Arc::new(ScriptedCompletionClient::default()),
        &path,
        USER_TEXT,
        Some("forward_guidance,cheerleader"),
    );

    assert_eq!(result.exit_code, 2);
    assert_eq!(parse_payload(&result.output)["error_class"], "invalid_role");
}

fn write_transcript(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("session.json");
    let transcript = json!({
        "session_id": "S-2026-0042",
        "protocol_ids": ["reklamation"],
        "params": { "kund": "Eva" },
        "history": [
            { "speaker": "assistant", "text": "Min beställning kom aldrig fram." },
            { "speaker": "user", "text": "Det beklagar jag." },
            { "speaker": "assistant", "text": "Jag har väntat i tre veckor!" }
        ]
    });
    fs::write(&path, transcript.to_string()).expect("transcript written");
    path
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "REHEARSE_LLM_PROVIDER",
        "REHEARSE_LLM_API_KEY",
        "REHEARSE_LLM_BASE_URL",
        "REHEARSE_LLM_MODEL",
        "REHEARSE_LLM_TIMEOUT_SECS",
        "REHEARSE_PIPELINE_HISTORY_WINDOW",
        "REHEARSE_PIPELINE_TURN_TIMEOUT_SECS",
        "REHEARSE_LOGGING_LEVEL",
        "REHEARSE_LOGGING_FORMAT",
        "REHEARSE_LOG_LEVEL",
        "REHEARSE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
