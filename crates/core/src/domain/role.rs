use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, RoleOverrides};
use crate::schema::{OutputKind, OutputSchema, SchemaRegistry};

/// Fixed set of agent identities that answer a user turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Coaches the user ahead of their next reply. Never looks back.
    ForwardGuidance,
    /// Grades the reply the user just gave. Never gives forward instructions.
    RetrospectiveAnalysis,
    /// Reviews the session as a whole.
    HolisticReview,
}

impl Role {
    pub const ALL: [Role; 3] =
        [Role::ForwardGuidance, Role::RetrospectiveAnalysis, Role::HolisticReview];

    pub fn key(&self) -> &'static str {
        match self {
            Self::ForwardGuidance => "forward_guidance",
            Self::RetrospectiveAnalysis => "retrospective_analysis",
            Self::HolisticReview => "holistic_review",
        }
    }

    pub fn output_kind(&self) -> OutputKind {
        match self {
            Self::ForwardGuidance => OutputKind::Guidance,
            Self::RetrospectiveAnalysis => OutputKind::Analysis,
            Self::HolisticReview => OutputKind::Review,
        }
    }

    /// The role whose validated output from the same turn this role may read.
    pub fn consumes(&self) -> Option<Role> {
        match self {
            Self::ForwardGuidance => Some(Self::RetrospectiveAnalysis),
            Self::RetrospectiveAnalysis | Self::HolisticReview => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown role `{0}` (expected forward_guidance|retrospective_analysis|holistic_review)")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Role::ALL
            .into_iter()
            .find(|role| role.key() == normalized)
            .ok_or_else(|| UnknownRole(value.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoleConfig {
    pub role: Role,
    pub prompt_template: String,
    pub directive_template: String,
    pub output_schema: OutputSchema,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_attempts: u32,
    pub requires_user_text: bool,
}

const FORWARD_GUIDANCE_PROMPT: &str = "Du är en samtalscoach på en träningsplattform för svåra samtal. \
Din uppgift är att ge användaren konkret vägledning inför deras nästa replik.\n\
Session: {{ session_id }}\n\
{% if protocols %}Aktiva protokoll: {{ protocols | join(sep=\", \") }}\n{% endif %}\
{% for key, value in params %}{{ key }}: {{ value }}\n{% endfor %}\
Svara endast med JSON enligt det angivna schemat.";

const FORWARD_GUIDANCE_DIRECTIVE: &str = "{% if prior_analysis %}\
Analys av användarens senaste replik:\n{{ prior_analysis }}\n\
{% else %}\
Ingen tidigare analys finns tillgänglig för denna tur.\n\
{% endif %}\
Ge endast framåtriktade råd inför nästa replik. Beskriv inte det som redan har sagts.";

const RETROSPECTIVE_ANALYSIS_PROMPT: &str = "Du är en analytiker på en träningsplattform för svåra samtal. \
Din uppgift är att bedöma den replik användaren just gav mot övningens kriterier.\n\
Session: {{ session_id }}\n\
{% if protocols %}Aktiva protokoll: {{ protocols | join(sep=\", \") }}\n{% endif %}\
{% for key, value in params %}{{ key }}: {{ value }}\n{% endfor %}\
Svara endast med JSON enligt det angivna schemat.";

const RETROSPECTIVE_ANALYSIS_DIRECTIVE: &str = "Analysera endast användarens senaste replik nedan. \
Beskriv vad som fungerade och vad som inte fungerade. Ge inga instruktioner om kommande repliker.";

const HOLISTIC_REVIEW_PROMPT: &str = "Du är en granskare på en träningsplattform för svåra samtal. \
Din uppgift är att göra en helhetsbedömning av samtalet.\n\
Session: {{ session_id }}\n\
{% if protocols %}Aktiva protokoll: {{ protocols | join(sep=\", \") }}\n{% endif %}\
{% for key, value in params %}{{ key }}: {{ value }}\n{% endfor %}\
Svara endast med JSON enligt det angivna schemat.";

const HOLISTIC_REVIEW_DIRECTIVE: &str = "Gör en helhetsbedömning av hela samtalet hittills: \
styrkor, förbättringsområden och en sammanfattande bedömning.";

impl RoleConfig {
    pub fn builtin(role: Role) -> Self {
        let output_schema = SchemaRegistry::schema_for(role.output_kind());
        match role {
            Role::ForwardGuidance => Self {
                role,
                prompt_template: FORWARD_GUIDANCE_PROMPT.to_string(),
                directive_template: FORWARD_GUIDANCE_DIRECTIVE.to_string(),
                output_schema,
                temperature: 0.7,
                max_output_tokens: 600,
                max_attempts: 3,
                requires_user_text: false,
            },
            Role::RetrospectiveAnalysis => Self {
                role,
                prompt_template: RETROSPECTIVE_ANALYSIS_PROMPT.to_string(),
                directive_template: RETROSPECTIVE_ANALYSIS_DIRECTIVE.to_string(),
                output_schema,
                temperature: 0.2,
                max_output_tokens: 900,
                max_attempts: 3,
                requires_user_text: true,
            },
            Role::HolisticReview => Self {
                role,
                prompt_template: HOLISTIC_REVIEW_PROMPT.to_string(),
                directive_template: HOLISTIC_REVIEW_DIRECTIVE.to_string(),
                output_schema,
                temperature: 0.4,
                max_output_tokens: 1200,
                max_attempts: 2,
                requires_user_text: false,
            },
        }
    }

    fn apply_overrides(&mut self, overrides: &RoleOverrides) {
        if let Some(prompt_template) = &overrides.prompt_template {
            self.prompt_template = prompt_template.clone();
        }
        if let Some(directive_template) = &overrides.directive_template {
            self.directive_template = directive_template.clone();
        }
        if let Some(temperature) = overrides.temperature {
            self.temperature = temperature;
        }
        if let Some(max_output_tokens) = overrides.max_output_tokens {
            self.max_output_tokens = max_output_tokens;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.max_attempts = max_attempts;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = self.role.key();
        if self.max_attempts == 0 || self.max_attempts > 10 {
            return Err(ConfigError::Validation(format!(
                "roles.{key}.max_attempts must be in range 1..=10"
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Validation(format!(
                "roles.{key}.temperature must be in range 0.0..=2.0"
            )));
        }
        if self.max_output_tokens == 0 || self.max_output_tokens > 32_768 {
            return Err(ConfigError::Validation(format!(
                "roles.{key}.max_output_tokens must be in range 1..=32768"
            )));
        }
        if self.prompt_template.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "roles.{key}.prompt_template must not be empty"
            )));
        }
        Ok(())
    }
}

/// One `RoleConfig` per `Role`, read-only once loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleRegistry {
    configs: BTreeMap<Role, RoleConfig>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        let configs = Role::ALL.into_iter().map(|role| (role, RoleConfig::builtin(role))).collect();
        Self { configs }
    }
}

impl RoleRegistry {
    pub fn with_overrides(overrides: &BTreeMap<Role, RoleOverrides>) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for (role, role_overrides) in overrides {
            if let Some(config) = registry.configs.get_mut(role) {
                config.apply_overrides(role_overrides);
            }
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.configs.values().try_for_each(RoleConfig::validate)
    }

    pub fn get(&self, role: Role) -> Option<&RoleConfig> {
        self.configs.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoleConfig> {
        self.configs.values()
    }
}
