use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use rehearse_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use rehearse_core::config::GuardrailConfig;
use rehearse_core::{RawResponse, Role, Violation};
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternKind {
    /// Case-insensitive substring.
    Literal,
    /// Case-insensitive regular expression.
    Regex,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailRule {
    pub id: String,
    pub pattern: String,
    pub kind: PatternKind,
}

impl GuardrailRule {
    pub fn literal(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self { id: id.into(), pattern: pattern.into(), kind: PatternKind::Literal }
    }

    pub fn regex(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self { id: id.into(), pattern: pattern.into(), kind: PatternKind::Regex }
    }
}

/// Forbidden temporal-direction patterns keyed by role.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuardrailRuleSet {
    rules: BTreeMap<Role, Vec<GuardrailRule>>,
}

impl GuardrailRuleSet {
    pub fn builtin() -> Self {
        Self::default()
            // forward guidance must not look back at what already happened
            .with_rule(Role::ForwardGuidance, GuardrailRule::literal("fg.just_did.sv", "du gjorde nyss"))
            .with_rule(
                Role::ForwardGuidance,
                GuardrailRule::literal("fg.previous_answer.sv", "tidigare svar"),
            )
            .with_rule(
                Role::ForwardGuidance,
                GuardrailRule::regex("fg.last_reply.sv", r"i (ditt|din) förra (svar|replik)"),
            )
            .with_rule(Role::ForwardGuidance, GuardrailRule::literal("fg.just_did.en", "you just did"))
            .with_rule(
                Role::ForwardGuidance,
                GuardrailRule::regex(
                    "fg.previous_answer.en",
                    r"your (previous|last|earlier) (answer|reply|response)",
                ),
            )
            // retrospective analysis must not instruct the future
            .with_rule(
                Role::RetrospectiveAnalysis,
                GuardrailRule::literal("ra.next_time.sv", "nästa gång"),
            )
            .with_rule(
                Role::RetrospectiveAnalysis,
                GuardrailRule::literal("ra.future.sv", "i framtiden"),
            )
            .with_rule(
                Role::RetrospectiveAnalysis,
                GuardrailRule::literal("ra.try_to.sv", "försök att"),
            )
            .with_rule(
                Role::RetrospectiveAnalysis,
                GuardrailRule::literal("ra.next_time.en", "next time"),
            )
            .with_rule(
                Role::RetrospectiveAnalysis,
                GuardrailRule::literal("ra.future.en", "in the future"),
            )
    }

    pub fn with_rule(mut self, role: Role, rule: GuardrailRule) -> Self {
        self.rules.entry(role).or_default().push(rule);
        self
    }

    /// Appends configured literal patterns as `<role>.custom.<n>` rules.
    pub fn with_extra_patterns(mut self, config: &GuardrailConfig) -> Self {
        for (role, patterns) in &config.extra_patterns {
            for (index, pattern) in patterns.iter().enumerate() {
                let id = format!("{}.custom.{}", role.key(), index + 1);
                self = self.with_rule(*role, GuardrailRule::literal(id, pattern.trim()));
            }
        }
        self
    }

    pub fn rules_for(&self, role: Role) -> &[GuardrailRule] {
        self.rules.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GuardrailError {
    #[error("guardrail rule `{rule_id}` for role {role} has an invalid pattern: {message}")]
    InvalidPattern { role: Role, rule_id: String, message: String },
}

#[derive(Clone, Debug)]
struct CompiledRule {
    id: String,
    matcher: Regex,
}

/// Scans serialized responses against the compiled rule set.
///
/// Every rule runs against every response; matches are never short-circuited,
/// so the violation list is complete for audit. Output is sorted by rule id
/// and does not depend on the order rules were registered in.
#[derive(Clone, Debug)]
pub struct GuardrailValidator {
    rules: BTreeMap<Role, Vec<CompiledRule>>,
}

impl GuardrailValidator {
    pub fn new(rule_set: &GuardrailRuleSet) -> Result<Self, GuardrailError> {
        let mut rules = BTreeMap::new();
        for (role, role_rules) in &rule_set.rules {
            let compiled = role_rules
                .iter()
                .map(|rule| compile_rule(*role, rule))
                .collect::<Result<Vec<_>, _>>()?;
            rules.insert(*role, compiled);
        }
        Ok(Self { rules })
    }

    pub fn rule_count(&self, role: Role) -> usize {
        self.rules.get(&role).map(Vec::len).unwrap_or(0)
    }

    pub fn validate(&self, role: Role, response: &RawResponse) -> Vec<Violation> {
        let Some(rules) = self.rules.get(&role) else {
            return Vec::new();
        };

        let text = response.to_text();
        let mut violations = rules
            .iter()
            .filter_map(|rule| {
                let matched = rule
                    .matcher
                    .find_iter(&text)
                    .map(|found| found.as_str().to_string())
                    .collect::<Vec<_>>();
                (!matched.is_empty()).then(|| Violation {
                    role,
                    rule_id: rule.id.clone(),
                    matched,
                })
            })
            .collect::<Vec<_>>();

        violations.sort_by(|left, right| {
            left.rule_id.cmp(&right.rule_id).then_with(|| left.matched.cmp(&right.matched))
        });
        violations
    }

    /// Same as [`validate`](Self::validate), plus a best-effort audit record
    /// when anything matched.
    pub fn validate_with_audit(
        &self,
        role: Role,
        response: &RawResponse,
        sink: &dyn AuditSink,
        audit: &AuditContext,
    ) -> Vec<Violation> {
        let violations = self.validate(role, response);
        if violations.is_empty() {
            return violations;
        }

        let rule_ids =
            violations.iter().map(|violation| violation.rule_id.as_str()).collect::<Vec<_>>();
        let matched = violations.iter().flat_map(|violation| violation.matched.iter()).count();
        warn!(
            event_name = "agent.guardrail.violation",
            role = %role,
            rule_ids = %rule_ids.join(","),
            match_count = matched,
            correlation_id = %audit.correlation_id,
            session_id = %audit.session_id,
            "response violates temporal guardrails"
        );
        sink.emit(
            AuditEvent::new(
                audit,
                "guardrail.violation_detected",
                AuditCategory::Guardrail,
                AuditOutcome::Rejected,
            )
            .with_metadata("role", role.key())
            .with_metadata("rule_ids", rule_ids.join(","))
            .with_metadata("match_count", matched.to_string()),
        );
        violations
    }
}

fn compile_rule(role: Role, rule: &GuardrailRule) -> Result<CompiledRule, GuardrailError> {
    let source = match rule.kind {
        PatternKind::Literal => regex::escape(&rule.pattern),
        PatternKind::Regex => rule.pattern.clone(),
    };
    let matcher = RegexBuilder::new(&source).case_insensitive(true).build().map_err(|error| {
        GuardrailError::InvalidPattern {
            role,
            rule_id: rule.id.clone(),
            message: error.to_string(),
        }
    })?;
    Ok(CompiledRule { id: rule.id.clone(), matcher })
}
