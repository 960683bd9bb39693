use super::PatternExpander;
use crate::error::ErrorKind;
use specql_model::{
    EntitySpec, Expr, FieldType, Literal, StateMachineTemplate, Step, UpdateStep, ValidateStep,
};
use std::collections::BTreeMap;

impl PatternExpander for StateMachineTemplate {
    fn expand(&self, entity: &EntitySpec) -> Result<Vec<Step>, ErrorKind> {
        let field = entity.field(&self.state_field).ok_or_else(|| {
            ErrorKind::expansion(format!(
                "state field '{}' is not a field of {}",
                self.state_field, entity.name
            ))
        })?;
        if self.from_states.is_empty() {
            return Err(ErrorKind::expansion("from_states is empty"));
        }
        if let FieldType::Enum(values) = &field.field_type {
            let all = self.from_states.iter().chain(std::iter::once(&self.to_state));
            if let Some(unknown) = all.into_iter().find(|s| !values.contains(*s)) {
                return Err(ErrorKind::expansion(format!(
                    "'{}' is not a value of {}.{}",
                    unknown, entity.name, self.state_field
                )));
            }
        }

        let mut steps = Vec::with_capacity(2 + self.validations.len() + self.side_effects.len());
        steps.push(Step::Validate(ValidateStep {
            condition: Expr::in_list(
                Expr::path(&self.state_field),
                self.from_states.iter().map(|s| Expr::text(s.as_str())).collect(),
            ),
            error: Some("invalid_state_transition".to_string()),
            message: Some(format!(
                "Cannot move {} to '{}' unless {} is one of: {}",
                entity.name,
                self.to_state,
                self.state_field,
                self.from_states.join(", ")
            )),
        }));
        steps.extend(self.validations.iter().cloned().map(Step::Validate));

        let mut set = BTreeMap::new();
        set.insert(
            self.state_field.clone(),
            Expr::Literal(Literal::Text(self.to_state.clone())),
        );
        for name in &self.input_fields {
            if name == &self.state_field {
                return Err(ErrorKind::expansion(format!(
                    "input field '{}' would overwrite the state field",
                    name
                )));
            }
            if entity.field(name).is_none() {
                return Err(ErrorKind::expansion(format!(
                    "input field '{}' is not a field of {}",
                    name, entity.name
                )));
            }
            set.insert(name.clone(), Expr::input(name.as_str()));
        }
        steps.push(Step::Update(UpdateStep {
            entity: None,
            set,
            filter: None,
            store_as: None,
        }));

        for effect in &self.side_effects {
            match effect {
                Step::Update(_) | Step::Insert(_) => steps.push(effect.clone()),
                other => {
                    return Err(ErrorKind::expansion(format!(
                        "side effects are update or insert steps, found {}",
                        other.kind()
                    )))
                }
            }
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact() -> EntitySpec {
        serde_json::from_value(json!({
            "name": "Contact",
            "fields": [
                {"name": "status", "type": "enum(lead, qualified, lost)"},
                {"name": "note", "type": "text"}
            ]
        }))
        .unwrap()
    }

    fn template(value: serde_json::Value) -> StateMachineTemplate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_transition_expansion() {
        let t = template(json!({
            "from_states": ["lead"],
            "to_state": "qualified",
            "input_fields": ["note"],
            "validations": [{"condition": "$input.note IS NOT NULL", "error": "note_required"}]
        }));
        let steps = t.expand(&contact()).unwrap();
        assert_eq!(steps.len(), 3);
        match &steps[0] {
            Step::Validate(v) => {
                assert_eq!(v.condition.to_string(), "status IN ('lead')");
                assert_eq!(v.error.as_deref(), Some("invalid_state_transition"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &steps[2] {
            Step::Update(u) => {
                assert!(u.filter.is_none());
                assert_eq!(u.set["status"].to_string(), "'qualified'");
                assert_eq!(u.set["note"], Expr::input("note"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_states_and_fields() {
        let bad_state = template(json!({"from_states": ["lead"], "to_state": "won"}));
        assert!(bad_state.expand(&contact()).is_err());

        let bad_field = template(json!({
            "state_field": "stage", "from_states": ["lead"], "to_state": "qualified"
        }));
        assert!(bad_field.expand(&contact()).is_err());

        let overwrite = template(json!({
            "from_states": ["lead"], "to_state": "qualified", "input_fields": ["status"]
        }));
        assert!(overwrite.expand(&contact()).is_err());

        let empty = template(json!({"from_states": [], "to_state": "qualified"}));
        assert!(empty.expand(&contact()).is_err());
    }

    #[test]
    fn test_side_effects_must_write() {
        let t = template(json!({
            "from_states": ["lead"], "to_state": "lost",
            "side_effects": [{"type": "notify", "event": "lost"}]
        }));
        assert!(matches!(
            t.expand(&contact()),
            Err(ErrorKind::PatternExpansion { .. })
        ));
    }
}
