pub mod conversation;
pub mod response;
pub mod role;
pub mod turn;

pub use conversation::{
    ConversationTurn, DependencySignal, PromptPayload, RequestContext, Speaker,
};
pub use response::{AttemptViolations, RawResponse, Violation};
pub use role::{Role, RoleConfig, RoleRegistry, UnknownRole};
pub use turn::{RoleOutcome, TurnResult};
