use specql_model::{LookupError, LookupSection};
use std::fmt;
use thiserror::Error;

fn did_you_mean(suggestions: &[String]) -> String {
    match suggestions.first() {
        Some(first) => format!(". Did you mean: {}?", first),
        None => String::new(),
    }
}

/// Location of a step inside an action, e.g. `Contact.qualify_lead/steps[2]/then[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPath {
    pub entity: String,
    pub action: String,
    pub segments: Vec<String>,
}

impl StepPath {
    pub fn new(entity: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            action: action.into(),
            segments: Vec::new(),
        }
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.action)?;
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("unknown entity '{name}'{}", did_you_mean(.suggestions))]
    UnknownEntity {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("unknown field '{field}' on {entity}{}", did_you_mean(.suggestions))]
    UnknownField {
        entity: String,
        field: String,
        suggestions: Vec<String>,
    },

    #[error("unknown action '{name}'{}", did_you_mean(.suggestions))]
    UnknownAction {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("action reference '{name}' is ambiguous: {}", .candidates.join(", "))]
    AmbiguousAction {
        name: String,
        candidates: Vec<String>,
    },

    #[error("unknown binding '{name}'{}", did_you_mean(.suggestions))]
    UnknownBinding {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("'{name}' is already bound in this scope")]
    DuplicateBinding { name: String },

    #[error("action '{action}' has no input '{argument}'{}", did_you_mean(.suggestions))]
    UnknownArgument {
        action: String,
        argument: String,
        suggestions: Vec<String>,
    },

    #[error("malformed expression `{expr}`: {reason}")]
    MalformedExpression { expr: String, reason: String },

    #[error("pattern expansion failed: {reason}")]
    PatternExpansion { reason: String },

    #[error("{entity}.{field} is required but never assigned")]
    MissingRequiredField { entity: String, field: String },

    #[error("hard delete not allowed: {reason}")]
    HardDeleteNotAllowed { reason: String },

    #[error("actions return mutation_result, found '{declared}'")]
    OutputTypeDivergence { declared: String },

    #[error("invalid target: {reason}")]
    InvalidTarget { reason: String },

    #[error("function {name} is generated by more than one action")]
    DuplicateFunction { name: String },
}

impl ErrorKind {
    pub fn malformed(expr: impl fmt::Display, reason: impl Into<String>) -> Self {
        ErrorKind::MalformedExpression {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }

    pub fn expansion(reason: impl Into<String>) -> Self {
        ErrorKind::PatternExpansion {
            reason: reason.into(),
        }
    }

    pub fn invalid_target(reason: impl Into<String>) -> Self {
        ErrorKind::InvalidTarget {
            reason: reason.into(),
        }
    }

    /// Suggested replacements carried by unknown-name errors.
    pub fn suggestions(&self) -> &[String] {
        match self {
            ErrorKind::UnknownEntity { suggestions, .. }
            | ErrorKind::UnknownField { suggestions, .. }
            | ErrorKind::UnknownAction { suggestions, .. }
            | ErrorKind::UnknownBinding { suggestions, .. }
            | ErrorKind::UnknownArgument { suggestions, .. } => suggestions,
            ErrorKind::AmbiguousAction { candidates, .. } => candidates,
            _ => &[],
        }
    }
}

impl From<LookupError> for ErrorKind {
    fn from(err: LookupError) -> Self {
        let suggestions = err.suggestion_names();
        match err {
            LookupError::Ambiguous { input, .. } => ErrorKind::AmbiguousAction {
                name: input,
                candidates: suggestions,
            },
            LookupError::NotFound { input, section, .. } => match section {
                LookupSection::Action => ErrorKind::UnknownAction {
                    name: input,
                    suggestions,
                },
                LookupSection::Binding => ErrorKind::UnknownBinding {
                    name: input,
                    suggestions,
                },
                LookupSection::Entity | LookupSection::Field => ErrorKind::UnknownEntity {
                    name: input,
                    suggestions,
                },
            },
        }
    }
}

/// A compile failure, located at the step that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {kind}")]
pub struct CompileError {
    pub path: StepPath,
    pub kind: ErrorKind,
}

/// Every failure of a generation run, in catalog order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.0.iter()
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

impl From<CompileError> for CompileErrors {
    fn from(err: CompileError) -> Self {
        CompileErrors(vec![err])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_model::Suggestion;

    #[test]
    fn test_error_names_step_path() {
        let mut path = StepPath::new("Contact", "qualify_lead");
        path.segments.push("steps[2]".to_string());
        path.segments.push("then[0]".to_string());
        let err = CompileError {
            path,
            kind: ErrorKind::UnknownField {
                entity: "Contact".to_string(),
                field: "stauts".to_string(),
                suggestions: vec!["status".to_string()],
            },
        };
        assert_eq!(
            err.to_string(),
            "Contact.qualify_lead/steps[2]/then[0]: unknown field 'stauts' on Contact. Did you mean: status?"
        );
    }

    #[test]
    fn test_lookup_error_conversion() {
        let kind: ErrorKind = LookupError::NotFound {
            input: "archiv".to_string(),
            section: LookupSection::Action,
            suggestions: vec![Suggestion {
                candidate: "archive".to_string(),
                distance: 1,
            }],
            available: vec![],
        }
        .into();
        assert_eq!(kind.suggestions(), &["archive".to_string()]);
        assert!(matches!(kind, ErrorKind::UnknownAction { .. }));
    }
}
