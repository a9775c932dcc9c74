use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::role::Role;
use crate::schema::OutputKind;

/// Structured payload returned by the completion boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    pub kind: OutputKind,
    pub payload: Value,
}

impl RawResponse {
    pub fn new(kind: OutputKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Every string leaf of the payload in document order, one per line.
    ///
    /// Guardrails scan this rather than the JSON encoding so patterns never
    /// have to account for escaped quotes or newlines.
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        collect_strings(&self.payload, &mut lines);
        lines.join("\n")
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(fields) => fields.values().for_each(|field| collect_strings(field, out)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub role: Role,
    pub rule_id: String,
    pub matched: Vec<String>,
}

/// Violations found on one rejected attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptViolations {
    pub attempt: u32,
    pub violations: Vec<Violation>,
}
