//! Multi-role response pipeline for conversation rehearsal.
//!
//! Every user turn is answered by a fixed set of roles, each with its own
//! prompt and a forbidden-pattern table that keeps it on its side of the
//! timeline:
//! - forward guidance coaches the next reply and must not look back
//! - retrospective analysis grades the reply just given and must not
//!   instruct the future
//! - holistic review judges the session as a whole
//!
//! # Pipeline
//!
//! 1. **Composition** (`composer`) - session state to a bounded, role-specific payload
//! 2. **Completion** (`llm`) - schema-constrained generation behind a trait
//! 3. **Guardrails** (`guardrails`) - case-insensitive pattern scan per role
//! 4. **Retry** (`retry`) - generate-validate-retry state machine per role
//! 5. **Fan-out** (`fanout`) - all enabled roles concurrently under one turn deadline
//!
//! `AgentRuntime` (see `runtime`) ties the pipeline to a session store.
//!
//! A failing role never fails the turn. Every enabled role gets exactly one
//! typed entry in the `TurnResult`.

pub mod composer;
pub mod fanout;
pub mod guardrails;
pub mod llm;
pub mod retry;
pub mod runtime;
pub mod scripted;

pub use composer::{ComposeInput, ComposedRequest, ContextComposer, PriorOutput};
pub use fanout::{FanOutCoordinator, TurnInput};
pub use guardrails::{GuardrailError, GuardrailRule, GuardrailRuleSet, GuardrailValidator};
pub use llm::{CompletionClient, CompletionRequest, HttpCompletionClient};
pub use runtime::{build_coordinator, AgentRuntime, RuntimeBuildError};
pub use scripted::{ScriptedCompletionClient, ScriptedReply};
