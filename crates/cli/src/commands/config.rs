use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rehearse_core::config::{AppConfig, LoadOptions};
use rehearse_core::Role;
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "llm.provider",
        &format!("{:?}", config.llm.provider),
        source("llm.provider", &["REHEARSE_LLM_PROVIDER"]),
    ));
    lines.push(render_line(
        "llm.base_url",
        &config.llm.base_url,
        source("llm.base_url", &["REHEARSE_LLM_BASE_URL"]),
    ));
    lines.push(render_line(
        "llm.model",
        &config.llm.model,
        source("llm.model", &["REHEARSE_LLM_MODEL"]),
    ));
    let llm_api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    lines.push(render_line(
        "llm.api_key",
        &llm_api_key,
        source("llm.api_key", &["REHEARSE_LLM_API_KEY"]),
    ));
    lines.push(render_line(
        "llm.timeout_secs",
        &config.llm.timeout_secs.to_string(),
        source("llm.timeout_secs", &["REHEARSE_LLM_TIMEOUT_SECS"]),
    ));

    lines.push(render_line(
        "pipeline.history_window",
        &config.pipeline.history_window.to_string(),
        source("pipeline.history_window", &["REHEARSE_PIPELINE_HISTORY_WINDOW"]),
    ));
    lines.push(render_line(
        "pipeline.turn_timeout_secs",
        &config.pipeline.turn_timeout_secs.to_string(),
        source("pipeline.turn_timeout_secs", &["REHEARSE_PIPELINE_TURN_TIMEOUT_SECS"]),
    ));

    for role in Role::ALL {
        let overrides = config.roles.get(&role).cloned().unwrap_or_default();
        let mut fields = Vec::new();
        if overrides.prompt_template.is_some() {
            fields.push("prompt_template");
        }
        if overrides.directive_template.is_some() {
            fields.push("directive_template");
        }
        if overrides.temperature.is_some() {
            fields.push("temperature");
        }
        if overrides.max_output_tokens.is_some() {
            fields.push("max_output_tokens");
        }
        if overrides.max_attempts.is_some() {
            fields.push("max_attempts");
        }
        let value = if fields.is_empty() { "<builtin>".to_string() } else { fields.join(",") };
        let key_path = format!("roles.{}", role.key());
        lines.push(render_line(&key_path, &value, source(&key_path, &[])));
    }

    for role in Role::ALL {
        let count = config.guardrails.extra_patterns.get(&role).map(Vec::len).unwrap_or(0);
        let key_path = format!("guardrails.extra_patterns.{}", role.key());
        lines.push(render_line(
            &key_path,
            &format!("{count} extra pattern(s)"),
            source(&key_path, &[]),
        ));
    }

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", &["REHEARSE_LOGGING_LEVEL", "REHEARSE_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", &["REHEARSE_LOGGING_FORMAT", "REHEARSE_LOG_FORMAT"]),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["rehearse.toml", "config/rehearse.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a recognisable `sk-` style prefix and nothing else.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
