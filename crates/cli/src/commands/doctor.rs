use rehearse_agent::{ContextComposer, GuardrailRuleSet, GuardrailValidator, HttpCompletionClient};
use rehearse_core::config::{AppConfig, LoadOptions};
use rehearse_core::{Role, RoleRegistry};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["role_registry", "prompt_templates", "guardrail_rules", "completion_client"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            match config.role_registry() {
                Ok(registry) => {
                    checks.push(check_role_registry(&registry));
                    checks.push(check_prompt_templates(&registry, config.pipeline.history_window));
                }
                Err(error) => {
                    checks.push(DoctorCheck {
                        name: "role_registry",
                        status: CheckStatus::Fail,
                        details: error.to_string(),
                    });
                    checks.push(skipped("prompt_templates", "role registry is invalid"));
                }
            }
            checks.push(check_guardrail_rules(&config));
            checks.push(check_completion_client(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in DEPENDENT_CHECKS {
                checks.push(skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn skipped(name: &'static str, reason: &str) -> DoctorCheck {
    DoctorCheck {
        name,
        status: CheckStatus::Skipped,
        details: format!("skipped because {reason}"),
    }
}

fn check_role_registry(registry: &RoleRegistry) -> DoctorCheck {
    let summary = Role::ALL
        .into_iter()
        .filter_map(|role| registry.get(role))
        .map(|config| {
            format!(
                "{} (attempts={}, temperature={}, max_tokens={})",
                config.role, config.max_attempts, config.temperature, config.max_output_tokens
            )
        })
        .collect::<Vec<_>>();

    DoctorCheck {
        name: "role_registry",
        status: CheckStatus::Pass,
        details: summary.join("; "),
    }
}

fn check_prompt_templates(registry: &RoleRegistry, history_window: usize) -> DoctorCheck {
    match ContextComposer::new(registry, history_window) {
        Ok(_) => DoctorCheck {
            name: "prompt_templates",
            status: CheckStatus::Pass,
            details: format!("all role templates compile (history window {history_window})"),
        },
        Err(error) => DoctorCheck {
            name: "prompt_templates",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_guardrail_rules(config: &AppConfig) -> DoctorCheck {
    let rules = GuardrailRuleSet::builtin().with_extra_patterns(&config.guardrails);
    match GuardrailValidator::new(&rules) {
        Ok(validator) => {
            let counts = Role::ALL
                .into_iter()
                .map(|role| format!("{}={}", role.key(), validator.rule_count(role)))
                .collect::<Vec<_>>();
            DoctorCheck {
                name: "guardrail_rules",
                status: CheckStatus::Pass,
                details: format!("{} rules compiled ({})", rules.len(), counts.join(", ")),
            }
        }
        Err(error) => DoctorCheck {
            name: "guardrail_rules",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_completion_client(config: &AppConfig) -> DoctorCheck {
    match HttpCompletionClient::from_config(&config.llm) {
        Ok(client) => DoctorCheck {
            name: "completion_client",
            status: CheckStatus::Pass,
            details: format!(
                "{:?} endpoint `{}` with model `{}`",
                config.llm.provider,
                client.chat_url(),
                config.llm.model
            ),
        },
        Err(error) => DoctorCheck {
            name: "completion_client",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
