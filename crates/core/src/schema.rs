//! Output-shape contracts per role.
//!
//! The completion boundary performs schema-constrained decoding against
//! [`OutputSchema::json_schema`]. [`SchemaRegistry::conforms`] is the
//! structural check the pipeline runs on whatever comes back; a miss there is
//! a boundary contract breach, not a guardrail violation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::response::RawResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Guidance,
    Analysis,
    Review,
}

impl OutputKind {
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::Guidance => "forward_guidance",
            Self::Analysis => "retrospective_analysis",
            Self::Review => "holistic_review",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutputSchema {
    pub kind: OutputKind,
    pub json_schema: Value,
    pub required: Vec<&'static str>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaMismatch {
    #[error("expected {expected:?} payload but boundary returned {actual:?}")]
    WrongKind { expected: OutputKind, actual: OutputKind },
    #[error("{kind:?} payload is not a JSON object")]
    NotAnObject { kind: OutputKind },
    #[error("{kind:?} payload is missing required field `{field}`")]
    MissingField { kind: OutputKind, field: &'static str },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaRegistry;

impl SchemaRegistry {
    pub fn schema_for(kind: OutputKind) -> OutputSchema {
        match kind {
            OutputKind::Guidance => OutputSchema {
                kind,
                json_schema: json!({
                    "type": "object",
                    "properties": {
                        "guidance": { "type": "string" },
                        "focus_areas": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["guidance", "focus_areas"],
                    "additionalProperties": false
                }),
                required: vec!["guidance", "focus_areas"],
            },
            OutputKind::Analysis => OutputSchema {
                kind,
                json_schema: json!({
                    "type": "object",
                    "properties": {
                        "rubric": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "criterion": { "type": "string" },
                                    "score": { "type": "integer", "minimum": 1, "maximum": 5 },
                                    "comment": { "type": "string" }
                                },
                                "required": ["criterion", "score", "comment"],
                                "additionalProperties": false
                            }
                        },
                        "summary": { "type": "string" }
                    },
                    "required": ["rubric", "summary"],
                    "additionalProperties": false
                }),
                required: vec!["rubric", "summary"],
            },
            OutputKind::Review => OutputSchema {
                kind,
                json_schema: json!({
                    "type": "object",
                    "properties": {
                        "overall": { "type": "string" },
                        "strengths": { "type": "array", "items": { "type": "string" } },
                        "improvements": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["overall", "strengths", "improvements"],
                    "additionalProperties": false
                }),
                required: vec!["overall", "strengths", "improvements"],
            },
        }
    }

    pub fn conforms(schema: &OutputSchema, response: &RawResponse) -> Result<(), SchemaMismatch> {
        if response.kind != schema.kind {
            return Err(SchemaMismatch::WrongKind { expected: schema.kind, actual: response.kind });
        }

        let Some(fields) = response.payload.as_object() else {
            return Err(SchemaMismatch::NotAnObject { kind: schema.kind });
        };

        match schema.required.iter().copied().find(|field| !fields.contains_key(*field)) {
            Some(field) => Err(SchemaMismatch::MissingField { kind: schema.kind, field }),
            None => Ok(()),
        }
    }
}
