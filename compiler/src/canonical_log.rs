//! Canonical Structured Logging
//!
//! Accumulates context while one action is compiled or executed and emits a
//! single log line when done.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

pub struct CanonicalLog {
    event: &'static str,
    data: BTreeMap<String, Value>,
    start: Instant,
    level: LogLevel,
    emitted: bool,
}

impl CanonicalLog {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            data: BTreeMap::new(),
            start: Instant::now(),
            level: LogLevel::Info,
            emitted: false,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> &mut Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
        self
    }

    pub fn set_level(&mut self, level: LogLevel) -> &mut Self {
        self.level = level;
        self
    }

    pub fn inc(&mut self, key: &str, amount: i64) -> &mut Self {
        let current = self.data.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        self.data.insert(key.to_string(), json!(current + amount));
        self
    }

    /// Record a warning; the line is raised to `Warn`.
    pub fn warn(&mut self, message: impl Into<String>) -> &mut Self {
        let entry = self
            .data
            .entry("warnings".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(Value::String(message.into()));
        }
        self.level = LogLevel::Warn;
        self
    }

    pub fn duration_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn suppress(&mut self) {
        self.emitted = true;
    }

    pub fn emit(mut self) {
        self.do_emit();
    }

    fn do_emit(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        self.data
            .insert("duration_ms".to_string(), json!(self.duration_ms()));

        let canonical = serde_json::to_string(&self.data).unwrap_or_else(|_| "{}".to_string());
        let event = self.event;
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(target: "specql::canonical", event, canonical = %canonical, "canonical_event")
            }
            LogLevel::Info => {
                tracing::info!(target: "specql::canonical", event, canonical = %canonical, "canonical_event")
            }
            LogLevel::Warn => {
                tracing::warn!(target: "specql::canonical", event, canonical = %canonical, "canonical_event")
            }
        }
    }
}

impl Drop for CanonicalLog {
    fn drop(&mut self) {
        self.do_emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_and_counters() {
        let mut log = CanonicalLog::new("compile_action");
        log.set("entity", "Contact").set("action", "create_contact");
        log.inc("ops", 2).inc("ops", 3);
        log.suppress();
        assert_eq!(log.data.get("ops"), Some(&json!(5)));
        assert_eq!(log.level, LogLevel::Info);
    }

    #[test]
    fn test_warning_raises_level() {
        let mut log = CanonicalLog::new("compile_action");
        log.warn("undeclared side effect").warn("another");
        log.suppress();
        assert_eq!(log.level, LogLevel::Warn);
        assert_eq!(log.data["warnings"].as_array().map(Vec::len), Some(2));
    }
}
