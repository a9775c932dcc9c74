//! Request composition.
//!
//! A composed payload is always laid out the same way:
//!
//! 1. the role's system prompt, rendered from session metadata,
//! 2. the most recent `history_window` conversation turns, oldest first,
//! 3. the role's directive, rendered after the window so a long transcript
//!    cannot push it out of the model's attention,
//! 4. the user's text for this turn, when there is one.
//!
//! Composition is pure: the same inputs always yield a byte-identical payload.

use std::collections::BTreeMap;
use std::error::Error as _;

use rehearse_core::{
    ComposeError, ConversationTurn, DependencySignal, PromptPayload, RawResponse, RequestContext,
    Role, RoleConfig, RoleRegistry,
};
use tera::{Context, Tera};

/// What a role sees of its dependency at composition time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PriorOutput<'a> {
    NotApplicable,
    Absent,
    Available(&'a RawResponse),
}

#[derive(Clone, Copy, Debug)]
pub struct ComposeInput<'a> {
    pub session_id: &'a str,
    pub history: &'a [ConversationTurn],
    pub protocol_ids: &'a [String],
    pub params: &'a BTreeMap<String, String>,
    pub user_text: Option<&'a str>,
    pub prior_output: PriorOutput<'a>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComposedRequest {
    pub context: RequestContext,
    pub payload: PromptPayload,
}

pub struct ContextComposer {
    history_window: usize,
    templates: Tera,
}

impl ContextComposer {
    /// Compiles every role's prompt and directive templates up front so a
    /// broken override fails at startup instead of mid-turn.
    pub fn new(registry: &RoleRegistry, history_window: usize) -> Result<Self, ComposeError> {
        let mut templates = Tera::default();
        for config in registry.iter() {
            for (name, body) in [
                (prompt_template_name(config.role), config.prompt_template.as_str()),
                (directive_template_name(config.role), config.directive_template.as_str()),
            ] {
                templates.add_raw_template(&name, body).map_err(|error| {
                    ComposeError::Template { template: name.clone(), message: describe(&error) }
                })?;
            }
        }
        Ok(Self { history_window, templates })
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    pub fn compose(
        &self,
        config: &RoleConfig,
        input: &ComposeInput<'_>,
    ) -> Result<ComposedRequest, ComposeError> {
        let role = config.role;
        let user_text = input.user_text.filter(|text| !text.trim().is_empty());
        if config.requires_user_text && user_text.is_none() {
            return Err(ComposeError::MissingInput { role });
        }

        let start = input.history.len().saturating_sub(self.history_window);
        let window = input.history[start..].to_vec();

        let (dependency, prior_analysis) = match input.prior_output {
            PriorOutput::NotApplicable => (DependencySignal::NotApplicable, String::new()),
            PriorOutput::Absent => (DependencySignal::Absent, String::new()),
            PriorOutput::Available(response) => (
                DependencySignal::Consumed,
                serde_json::to_string_pretty(&response.payload).unwrap_or_default(),
            ),
        };

        let mut context = Context::new();
        context.insert("role", role.key());
        context.insert("session_id", input.session_id);
        context.insert("protocols", input.protocol_ids);
        context.insert("params", input.params);
        context.insert("prior_analysis", &prior_analysis);

        let system_prompt = self.render(&prompt_template_name(role), &context)?;
        let directive = self.render(&directive_template_name(role), &context)?;

        let mut messages = Vec::with_capacity(window.len() + 3);
        messages.push(ConversationTurn::system(system_prompt));
        messages.extend(window.iter().cloned());
        messages.push(ConversationTurn::system(directive));
        if let Some(text) = user_text {
            messages.push(ConversationTurn::user(text));
        }

        Ok(ComposedRequest {
            context: RequestContext {
                session_id: input.session_id.to_string(),
                role,
                protocol_ids: input.protocol_ids.to_vec(),
                window,
                params: input.params.clone(),
                dependency,
            },
            payload: PromptPayload { messages },
        })
    }

    fn render(&self, template: &str, context: &Context) -> Result<String, ComposeError> {
        self.templates.render(template, context).map_err(|error| ComposeError::Template {
            template: template.to_string(),
            message: describe(&error),
        })
    }
}

fn prompt_template_name(role: Role) -> String {
    format!("{}.prompt", role.key())
}

fn directive_template_name(role: Role) -> String {
    format!("{}.directive", role.key())
}

/// Tera keeps the useful detail in the source chain.
fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
