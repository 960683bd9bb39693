//! Input record derived from what an action reads, and the shared output
//! record every action returns.

use crate::error::ErrorKind;
use crate::ir::{CompiledExpr, LoopSource, Op, SqlType};
use crate::patterns::{expand, needs_current_row, step_expressions, walk_steps};
use serde::Serialize;
use specql_model::{ActionSpec, EntitySpec};

/// Name of the composite every generated function returns.
pub const OUTPUT_TYPE: &str = "app.mutation_result";

const OUTPUT_ALIASES: &[&str] = &["mutation_result", "app.mutation_result", "MutationResult"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeField {
    pub name: String,
    pub sql_type: SqlType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeType {
    pub name: String,
    pub fields: Vec<CompositeField>,
}

impl CompositeType {
    pub fn field(&self, name: &str) -> Option<&CompositeField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

pub fn input_type_name(action: &str) -> String {
    format!("app.type_{}_input", action)
}

/// Reject a declared return type other than the shared mutation result.
pub fn check_output(action: &ActionSpec) -> Result<(), ErrorKind> {
    match action.returns.as_deref() {
        None => Ok(()),
        Some(declared) if OUTPUT_ALIASES.contains(&declared) => Ok(()),
        Some(declared) => Err(ErrorKind::OutputTypeDivergence {
            declared: declared.to_string(),
        }),
    }
}

/// Input keys an action accepts, read straight from its spec: `id` when the
/// action loads its own row, then every `$input.*` in first-read order.
pub fn input_signature(entity: &EntitySpec, action: &ActionSpec) -> Result<Vec<String>, ErrorKind> {
    let expanded = expand(entity, action)?;
    let mut keys: Vec<String> = Vec::new();
    let mut add = |key: &str| {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    };

    if needs_current_row(entity, action.effective_pattern(), &expanded.steps) {
        add("id");
    }
    if let Some(requires) = &action.requires {
        requires.input_refs().into_iter().for_each(&mut add);
    }
    walk_steps(&expanded.steps, &mut |step| {
        for expr in step_expressions(step) {
            expr.input_refs().into_iter().for_each(&mut add);
        }
    });
    Ok(keys)
}

/// Build the input record from the compiled ops. Each key takes the type its
/// uses agree on; numeric disagreements widen to NUMERIC, anything else falls
/// back to TEXT with a warning.
pub fn derive_input_type(action: &str, ops: &[Op]) -> (CompositeType, Vec<String>) {
    let mut order: Vec<String> = Vec::new();
    let mut hints: Vec<Vec<SqlType>> = Vec::new();
    let mut note = |key: &str, ty: Option<SqlType>| {
        let i = match order.iter().position(|k| k == key) {
            Some(i) => i,
            None => {
                order.push(key.to_string());
                hints.push(Vec::new());
                order.len() - 1
            }
        };
        if let Some(ty) = ty {
            hints[i].push(ty);
        }
    };

    for op in ops {
        op.walk(&mut |op| {
            if let Op::Loop(l) = op {
                if let LoopSource::InputArray { key } = &l.source {
                    note(key, Some(SqlType::Jsonb));
                }
            }
            for expr in op.expressions() {
                expr.walk(&mut |e| {
                    if let CompiledExpr::Input { key, sql_type } = e {
                        note(key, *sql_type);
                    }
                });
            }
        });
    }

    let mut warnings = Vec::new();
    let fields = order
        .into_iter()
        .zip(hints)
        .map(|(name, hints)| {
            let sql_type = match hints.first() {
                None => SqlType::Text,
                Some(first) if hints.iter().all(|h| h == first) => *first,
                Some(_) if hints.iter().all(SqlType::is_numeric) => SqlType::Numeric,
                Some(_) => {
                    warnings.push(format!(
                        "input '{}' is used as {}; typed as TEXT",
                        name,
                        hints
                            .iter()
                            .map(SqlType::as_sql)
                            .collect::<Vec<_>>()
                            .join(" and ")
                    ));
                    SqlType::Text
                }
            };
            CompositeField { name, sql_type }
        })
        .collect();

    (
        CompositeType {
            name: input_type_name(action),
            fields,
        },
        warnings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Termination;
    use serde_json::json;

    fn input(key: &str, ty: Option<SqlType>) -> CompiledExpr {
        CompiledExpr::Input {
            key: key.to_string(),
            sql_type: ty,
        }
    }

    fn guard(condition: CompiledExpr) -> Op {
        Op::Guard {
            condition,
            on_fail: Termination::validation("x", "x"),
        }
    }

    #[test]
    fn test_types_follow_usage() {
        let ops = vec![
            guard(CompiledExpr::is_not_null(input("email", Some(SqlType::Text)))),
            guard(CompiledExpr::and(vec![
                CompiledExpr::is_not_null(input("qty", Some(SqlType::Integer))),
                CompiledExpr::is_not_null(input("qty", Some(SqlType::Numeric))),
            ])),
            guard(CompiledExpr::and(vec![
                CompiledExpr::is_not_null(input("flag", Some(SqlType::Boolean))),
                CompiledExpr::is_not_null(input("flag", Some(SqlType::Date))),
            ])),
            guard(CompiledExpr::is_not_null(input("note", None))),
        ];
        let (ty, warnings) = derive_input_type("place_order", &ops);
        assert_eq!(ty.name, "app.type_place_order_input");
        let types: Vec<(&str, SqlType)> =
            ty.fields.iter().map(|f| (f.name.as_str(), f.sql_type)).collect();
        assert_eq!(
            types,
            vec![
                ("email", SqlType::Text),
                ("qty", SqlType::Numeric),
                ("flag", SqlType::Text),
                ("note", SqlType::Text),
            ]
        );
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_signature_puts_id_first() {
        let entity: EntitySpec = serde_json::from_value(json!({
            "name": "Contact",
            "fields": [{"name": "status", "type": "text"}, {"name": "note", "type": "text"}]
        }))
        .unwrap();
        let action: ActionSpec = serde_json::from_value(json!({
            "name": "update_note",
            "requires": "$input.reason IS NOT NULL",
            "steps": [{"type": "update", "set": {"note": "$input.note", "status": "$input.status"}}]
        }))
        .unwrap();
        assert_eq!(
            input_signature(&entity, &action).unwrap(),
            vec!["id", "reason", "note", "status"]
        );
    }

    #[test]
    fn test_output_type_divergence() {
        let mut action: ActionSpec =
            serde_json::from_value(json!({"name": "x", "returns": "mutation_result"})).unwrap();
        assert!(check_output(&action).is_ok());
        action.returns = Some("contact".to_string());
        assert!(matches!(
            check_output(&action),
            Err(ErrorKind::OutputTypeDivergence { .. })
        ));
    }
}
