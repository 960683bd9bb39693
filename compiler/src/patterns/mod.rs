//! Pattern templates: shorthand for common action shapes, expanded into
//! primitive steps before compilation.

mod batch;
mod multi_entity;
mod state_machine;

use crate::error::ErrorKind;
use specql_model::{
    ActionPattern, ActionSpec, EntitySpec, ErrorPolicy, Expr, PatternTemplate, Step,
};

pub trait PatternExpander {
    /// Primitive steps equivalent to the template, run before the action's
    /// own steps.
    fn expand(&self, entity: &EntitySpec) -> Result<Vec<Step>, ErrorKind>;

    /// Error policy the template imposes, if any.
    fn error_policy(&self) -> Option<ErrorPolicy> {
        None
    }
}

/// An action's full step list after template expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedAction {
    pub steps: Vec<Step>,
    /// How many leading steps came from the template.
    pub template_steps: usize,
    pub error_policy: Option<ErrorPolicy>,
}

pub fn expand(entity: &EntitySpec, action: &ActionSpec) -> Result<ExpandedAction, ErrorKind> {
    let expander: Option<&dyn PatternExpander> = match &action.template {
        Some(PatternTemplate::StateMachine(t)) => Some(t),
        Some(PatternTemplate::MultiEntity(t)) => Some(t),
        Some(PatternTemplate::Batch(t)) => Some(t),
        None => None,
    };

    let (mut steps, template_policy) = match expander {
        Some(expander) => (expander.expand(entity)?, expander.error_policy()),
        None => (Vec::new(), None),
    };
    let template_steps = steps.len();

    let error_policy = match (template_policy, action.error_policy) {
        (Some(_), Some(_)) => {
            return Err(ErrorKind::expansion(
                "error_policy is declared on both the action and its batch template",
            ))
        }
        (Some(p), None) | (None, Some(p)) => Some(p),
        (None, None) => None,
    };

    steps.extend(action.steps.iter().cloned());
    if steps.is_empty() {
        return Err(ErrorKind::expansion(format!(
            "action '{}' has neither steps nor a template",
            action.name
        )));
    }
    Ok(ExpandedAction {
        steps,
        template_steps,
        error_policy,
    })
}

/// Visit every step, depth first, including branch and loop bodies.
pub fn walk_steps<'a>(steps: &'a [Step], f: &mut impl FnMut(&'a Step)) {
    for step in steps {
        f(step);
        match step {
            Step::If(s) => {
                walk_steps(&s.then_steps, f);
                walk_steps(&s.else_steps, f);
            }
            Step::ForEach(s) => walk_steps(&s.body, f),
            _ => {}
        }
    }
}

/// Expressions a step holds directly, in the order they are evaluated.
pub fn step_expressions(step: &Step) -> Vec<&Expr> {
    match step {
        Step::Validate(s) => vec![&s.condition],
        Step::Insert(s) => s.values.values().collect(),
        Step::Update(s) => s.filter.iter().chain(s.set.values()).collect(),
        Step::Delete(s) => s.filter.iter().collect(),
        Step::If(s) => vec![&s.condition],
        Step::ForEach(s) => vec![&s.collection],
        Step::Call(s) => s.args.values().collect(),
        Step::Notify(s) => s.payload.values().collect(),
    }
}

/// Whether the action operates on an existing row of its own entity: update
/// and delete actions always do, others when a step updates or deletes
/// without a `where` clause.
pub fn needs_current_row(entity: &EntitySpec, pattern: ActionPattern, steps: &[Step]) -> bool {
    if matches!(pattern, ActionPattern::Update | ActionPattern::Delete) {
        return true;
    }
    let own = |target: &Option<String>| target.as_deref().map_or(true, |t| t == entity.name);
    let mut found = false;
    walk_steps(steps, &mut |step| match step {
        Step::Update(s) if s.filter.is_none() && own(&s.entity) => found = true,
        Step::Delete(s) if s.filter.is_none() && own(&s.entity) => found = true,
        _ => {}
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(value: serde_json::Value) -> ActionSpec {
        serde_json::from_value(value).unwrap()
    }

    fn entity() -> EntitySpec {
        serde_json::from_value(json!({
            "name": "Contact",
            "fields": [{"name": "status", "type": "enum(lead, qualified)"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_template_steps_come_first() {
        let a = action(json!({
            "name": "qualify_lead",
            "template": {"kind": "state_machine", "from_states": ["lead"], "to_state": "qualified"},
            "steps": [{"type": "notify", "event": "lead_qualified"}]
        }));
        let expanded = expand(&entity(), &a).unwrap();
        assert_eq!(expanded.template_steps, 2);
        assert_eq!(expanded.steps.len(), 3);
        assert!(matches!(expanded.steps[2], Step::Notify(_)));
    }

    #[test]
    fn test_conflicting_error_policies() {
        let a = action(json!({
            "name": "bulk",
            "error_policy": {"mode": "stop_on_error"},
            "template": {
                "kind": "batch", "items": "rows",
                "operation": {"type": "notify", "event": "x"},
                "error_policy": {"mode": "continue_on_error"}
            }
        }));
        assert!(matches!(
            expand(&entity(), &a),
            Err(ErrorKind::PatternExpansion { .. })
        ));
    }

    #[test]
    fn test_empty_action_is_rejected() {
        assert!(expand(&entity(), &action(json!({"name": "noop"}))).is_err());
    }

    #[test]
    fn test_current_row_detection() {
        let e = entity();
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "if", "condition": "$input.flag = TRUE", "then": [
                {"type": "update", "set": {"status": "'qualified'"}}
            ]}
        ]))
        .unwrap();
        assert!(needs_current_row(&e, ActionPattern::Custom, &steps));

        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "update", "entity": "Contact", "set": {"status": "'lead'"}, "where": "status = 'qualified'"}
        ]))
        .unwrap();
        assert!(!needs_current_row(&e, ActionPattern::Custom, &steps));
        assert!(needs_current_row(&e, ActionPattern::Delete, &[]));
    }
}
