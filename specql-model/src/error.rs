//! Error types for specification loading and catalog lookups

use crate::search::Suggestion;

/// Which kind of name a failed lookup was searching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSection {
    Entity,
    Field,
    Action,
    Binding,
}

impl std::fmt::Display for LookupSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LookupSection::Entity => "entities",
            LookupSection::Field => "fields",
            LookupSection::Action => "actions",
            LookupSection::Binding => "bindings",
        };
        f.write_str(s)
    }
}

/// Structured error type for catalog lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    NotFound {
        input: String,
        section: LookupSection,
        suggestions: Vec<Suggestion>,
        available: Vec<String>,
    },
    Ambiguous {
        input: String,
        section: LookupSection,
        candidates: Vec<String>,
    },
}

impl LookupError {
    pub fn suggestion_names(&self) -> Vec<String> {
        match self {
            LookupError::NotFound { suggestions, .. } => {
                suggestions.iter().map(|s| s.candidate.clone()).collect()
            }
            LookupError::Ambiguous { candidates, .. } => candidates.clone(),
        }
    }
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound {
                input,
                section,
                suggestions,
                ..
            } => {
                write!(f, "Not found: '{}' in {}", input, section)?;
                if !suggestions.is_empty() {
                    write!(f, ". Did you mean: {}?", suggestions[0].candidate)?;
                }
                Ok(())
            }
            LookupError::Ambiguous {
                input,
                section,
                candidates,
            } => write!(
                f,
                "Ambiguous: '{}' matches several {}: {}",
                input,
                section,
                candidates.join(", ")
            ),
        }
    }
}

impl std::error::Error for LookupError {}

/// Errors raised while reading or structurally validating a spec document.
#[derive(Debug)]
pub enum SpecError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Json {
        path: Option<String>,
        source: serde_json::Error,
    },
    Invalid {
        entity: String,
        reason: String,
    },
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecError::Io { path, source } => write!(f, "Failed to read spec file {}: {}", path, source),
            SpecError::Json {
                path: Some(path),
                source,
            } => write!(f, "Failed to parse spec JSON in {}: {}", path, source),
            SpecError::Json { path: None, source } => {
                write!(f, "Failed to parse spec JSON: {}", source)
            }
            SpecError::Invalid { entity, reason } => {
                write!(f, "Invalid spec for entity {}: {}", entity, reason)
            }
        }
    }
}

impl std::error::Error for SpecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpecError::Io { source, .. } => Some(source),
            SpecError::Json { source, .. } => Some(source),
            SpecError::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mentions_first_suggestion() {
        let err = LookupError::NotFound {
            input: "Contcat".to_string(),
            section: LookupSection::Entity,
            suggestions: vec![Suggestion {
                candidate: "Contact".to_string(),
                distance: 2,
            }],
            available: vec!["Contact".to_string(), "Company".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Not found: 'Contcat' in entities. Did you mean: Contact?"
        );
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = LookupError::Ambiguous {
            input: "archive".to_string(),
            section: LookupSection::Action,
            candidates: vec!["Contact.archive".to_string(), "Order.archive".to_string()],
        };
        assert!(err.to_string().contains("Contact.archive, Order.archive"));
        assert_eq!(err.suggestion_names().len(), 2);
    }
}
