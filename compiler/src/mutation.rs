//! The uniform result every generated action returns.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// `success`, or `<kind>:<detail>` for the other outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    Success,
    Noop(String),
    Validation(String),
    Partial(String),
    Failed(String),
}

impl MutationStatus {
    pub fn validation(detail: impl Into<String>) -> Self {
        MutationStatus::Validation(detail.into())
    }

    pub fn noop(detail: impl Into<String>) -> Self {
        MutationStatus::Noop(detail.into())
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        MutationStatus::Failed(detail.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MutationStatus::Success => "success",
            MutationStatus::Noop(_) => "noop",
            MutationStatus::Validation(_) => "validation",
            MutationStatus::Partial(_) => "partial",
            MutationStatus::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            MutationStatus::Success => None,
            MutationStatus::Noop(d)
            | MutationStatus::Validation(d)
            | MutationStatus::Partial(d)
            | MutationStatus::Failed(d) => Some(d),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MutationStatus::Success)
    }

    /// Outcomes that leave no trace besides the audit record.
    pub fn is_failure(&self) -> bool {
        matches!(self, MutationStatus::Validation(_) | MutationStatus::Failed(_))
    }

    /// Outcomes whose writes are kept.
    pub fn commits(&self) -> bool {
        matches!(self, MutationStatus::Success | MutationStatus::Partial(_))
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            None => f.write_str(self.kind()),
            Some(detail) => write!(f, "{}:{}", self.kind(), detail),
        }
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "success" {
            return Ok(MutationStatus::Success);
        }
        let (kind, detail) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid mutation status '{}'", s))?;
        if detail.is_empty() {
            return Err(format!("mutation status '{}' has no detail", s));
        }
        let detail = detail.to_string();
        match kind {
            "noop" => Ok(MutationStatus::Noop(detail)),
            "validation" => Ok(MutationStatus::Validation(detail)),
            "partial" => Ok(MutationStatus::Partial(detail)),
            "failed" => Ok(MutationStatus::Failed(detail)),
            _ => Err(format!("unknown mutation status kind '{}'", kind)),
        }
    }
}

impl Serialize for MutationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MutationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Mirrors the `app.mutation_result` composite type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub entity_name: String,
    pub entity_id: Option<Uuid>,
    pub mutation_type: String,
    pub mutation_status: MutationStatus,
    #[serde(default)]
    pub updated_fields: Vec<String>,
    pub message: Option<String>,
    pub payload_before: Option<Value>,
    pub payload_after: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MutationResult {
    pub fn metadata_field(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Batch counters, when the action ran a batch loop.
    pub fn processed_count(&self) -> Option<u64> {
        self.metadata_field("processed_count").and_then(Value::as_u64)
    }

    pub fn failed_count(&self) -> Option<u64> {
        self.metadata_field("failed_count").and_then(Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_form() {
        for text in [
            "success",
            "noop:already_exists",
            "validation:invalid_state_transition",
            "partial:items_failed",
            "failed:unexpected_error",
        ] {
            let status: MutationStatus = text.parse().unwrap();
            assert_eq!(status.to_string(), text);
        }
        assert!("validation".parse::<MutationStatus>().is_err());
        assert!("validation:".parse::<MutationStatus>().is_err());
        assert!("oops:x".parse::<MutationStatus>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(MutationStatus::validation("not_found").is_failure());
        assert!(MutationStatus::failed("unexpected_error").is_failure());
        assert!(!MutationStatus::noop("already_deleted").is_failure());
        assert!(!MutationStatus::noop("already_deleted").commits());
        assert!(MutationStatus::Partial("items_failed".into()).commits());
    }

    #[test]
    fn test_status_serializes_as_string() {
        let value = serde_json::to_value(MutationStatus::noop("already_exists")).unwrap();
        assert_eq!(value, Value::String("noop:already_exists".to_string()));
        let back: MutationStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, MutationStatus::noop("already_exists"));
    }
}
