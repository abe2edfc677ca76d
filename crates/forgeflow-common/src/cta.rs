//! Human-feedback (CTA) request and response shapes.
//!
//! A request is one of three kinds. Each kind has exactly one acceptable
//! response shape; [`CtaResponse::validate_against`] enforces that pairing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtaKind {
    Approval,
    Text,
    Choice,
}

impl CtaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Text => "text",
            Self::Choice => "choice",
        }
    }
}

impl fmt::Display for CtaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CtaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(Self::Approval),
            "text" => Ok(Self::Text),
            "choice" => Ok(Self::Choice),
            _ => Err(format!("Invalid CTA kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
}

impl ChoiceOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CtaRequest {
    Approval {
        message: String,
    },
    Text {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Choice {
        prompt: String,
        options: Vec<ChoiceOption>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CtaResponse {
    Approval {
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Text {
        text: String,
    },
    Choice {
        #[serde(alias = "selectedId")]
        selected_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CtaValidationError {
    #[error("choice request needs at least 2 options, got {0}")]
    TooFewOptions(usize),

    #[error("duplicate choice option id '{0}'")]
    DuplicateOption(String),

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("expected a {expected} response, got {actual}")]
    KindMismatch { expected: CtaKind, actual: CtaKind },

    #[error("selected id '{0}' is not one of the offered options")]
    UnknownOption(String),
}

impl CtaRequest {
    pub fn kind(&self) -> CtaKind {
        match self {
            Self::Approval { .. } => CtaKind::Approval,
            Self::Text { .. } => CtaKind::Text,
            Self::Choice { .. } => CtaKind::Choice,
        }
    }

    /// The headline shown to the human, whatever the kind.
    pub fn headline(&self) -> &str {
        match self {
            Self::Approval { message } => message,
            Self::Text { prompt, .. } | Self::Choice { prompt, .. } => prompt,
        }
    }

    pub fn validate(&self) -> Result<(), CtaValidationError> {
        if self.headline().trim().is_empty() {
            let field = match self {
                Self::Approval { .. } => "message",
                _ => "prompt",
            };
            return Err(CtaValidationError::EmptyField { field });
        }
        if let Self::Choice { options, .. } = self {
            if options.len() < 2 {
                return Err(CtaValidationError::TooFewOptions(options.len()));
            }
            let mut seen = HashSet::new();
            for opt in options {
                if !seen.insert(opt.id.as_str()) {
                    return Err(CtaValidationError::DuplicateOption(opt.id.clone()));
                }
            }
        }
        Ok(())
    }
}

impl CtaResponse {
    pub fn kind(&self) -> CtaKind {
        match self {
            Self::Approval { .. } => CtaKind::Approval,
            Self::Text { .. } => CtaKind::Text,
            Self::Choice { .. } => CtaKind::Choice,
        }
    }

    /// Check that this response answers `request`: same kind, and for a
    /// choice, one of the offered option ids.
    pub fn validate_against(&self, request: &CtaRequest) -> Result<(), CtaValidationError> {
        if self.kind() != request.kind() {
            return Err(CtaValidationError::KindMismatch {
                expected: request.kind(),
                actual: self.kind(),
            });
        }
        if let (Self::Choice { selected_id }, CtaRequest::Choice { options, .. }) = (self, request)
            && !options.iter().any(|o| &o.id == selected_id)
        {
            return Err(CtaValidationError::UnknownOption(selected_id.clone()));
        }
        Ok(())
    }
}

/// How a suspended CTA resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CtaOutcome {
    Responded { response: CtaResponse },
    TimedOut,
}

impl CtaOutcome {
    /// The tool result handed back to a model that asked for feedback.
    pub fn to_tool_result(&self) -> serde_json::Value {
        match self {
            Self::Responded { response } => {
                serde_json::to_value(response).unwrap_or(serde_json::Value::Null)
            }
            Self::TimedOut => serde_json::json!({ "error": "timeout" }),
        }
    }

    /// Approval semantics: only an explicit `approved: true` counts.
    pub fn is_approved(&self) -> bool {
        matches!(
            self,
            Self::Responded {
                response: CtaResponse::Approval { approved: true, .. }
            }
        )
    }

    pub fn selected_id(&self) -> Option<&str> {
        match self {
            Self::Responded {
                response: CtaResponse::Choice { selected_id },
            } => Some(selected_id),
            _ => None,
        }
    }
}
