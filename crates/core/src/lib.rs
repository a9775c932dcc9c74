pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod schema;
pub mod session;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::{
    AttemptViolations, ConversationTurn, DependencySignal, PromptPayload, RawResponse,
    RequestContext, Role, RoleConfig, RoleOutcome, RoleRegistry, Speaker, TurnResult, Violation,
};
pub use errors::{BranchFailure, ComposeError, CompletionError, SessionStoreError};
pub use schema::{OutputKind, OutputSchema, SchemaMismatch, SchemaRegistry};
pub use session::{InMemorySessionStore, SessionSnapshot, SessionStore};
