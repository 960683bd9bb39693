use super::{
    compile_condition, compile_expr, current_row, field_guards, typed_for, unknown_field,
    StepCompiler,
};
use crate::error::{CompileError, ErrorKind};
use crate::expression::RowContext;
use crate::ir::{
    Assignment, CompiledExpr, IdentifierTemplate, InsertOp, LocalType, Op, Presence, RowSource,
    Termination, UniqueCheck,
};
use crate::scope::{ActionContext, Binding, Scope};
use crate::trinity;
use serde_json::Value;
use specql_model::InsertStep;
use std::collections::HashMap;

pub struct InsertCompiler;

impl StepCompiler for InsertCompiler {
    type Step = InsertStep;

    fn compile(
        &self,
        step: &InsertStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        let (target, table) = cx.target(&step.entity).map_err(|k| cx.error(k))?;
        if let Some(key) = step.values.keys().find(|k| target.field(k).is_none()) {
            return Err(cx.error(unknown_field(target, key)));
        }

        let row = current_row(cx);
        let mut ops = Vec::new();
        let mut assignments = Vec::new();
        let mut defaults = Vec::new();
        // Values as written, before reference resolution.
        let mut raw: HashMap<&str, CompiledExpr> = HashMap::new();
        // Values as stored.
        let mut stored: HashMap<&str, CompiledExpr> = HashMap::new();

        for field in &target.fields {
            let Some(source) = step.values.get(&field.name) else {
                if field.is_required() {
                    return Err(cx.error(ErrorKind::MissingRequiredField {
                        entity: target.name.clone(),
                        field: field.name.clone(),
                    }));
                }
                if let Some(default) = &field.default {
                    defaults.push((field.column_name(), default.clone()));
                    stored.insert(&field.name, CompiledExpr::Literal(default.clone()));
                    raw.insert(&field.name, CompiledExpr::Literal(default.clone()));
                }
                continue;
            };

            let value = typed_for(field, compile_expr(cx, scope, source, &row)?);
            ops.extend(field_guards(target, field, &value, &Presence::Always));
            raw.insert(&field.name, value.clone());
            let value = match field.reference() {
                Some(referenced) => trinity::reference_value(cx, field, referenced, value, &mut ops)
                    .map_err(|k| cx.error(k))?,
                None => value,
            };
            stored.insert(&field.name, value.clone());
            assignments.push(Assignment {
                field: field.name.clone(),
                column: field.column_name(),
                value,
                presence: Presence::Always,
                default: field.default.clone(),
            });
        }

        let column_of = |name: &str| {
            target
                .field(name)
                .map(|f| f.column_name())
                .unwrap_or_else(|| name.to_string())
        };

        let unique = target
            .unique_constraints()
            .filter(|c| c.on.on_create())
            .filter_map(|c| {
                let columns = c
                    .unique
                    .iter()
                    .map(|f| stored.get(f.as_str()).map(|v| (column_of(f), v.clone())))
                    .collect::<Option<Vec<_>>>()?;
                Some(UniqueCheck {
                    constraint: c.name.clone(),
                    columns,
                    on_conflict: Termination::noop(
                        "already_exists",
                        c.message.clone().unwrap_or_else(|| {
                            format!("{} already exists ({})", target.name, c.name)
                        }),
                    ),
                })
            })
            .collect();

        let reuse = match &step.reuse_existing {
            None => None,
            Some(fields) => {
                let fields: Vec<&str> = if fields.is_empty() {
                    assignments.iter().map(|a| a.field.as_str()).collect()
                } else {
                    fields.iter().map(String::as_str).collect()
                };
                let mut lookup = Vec::with_capacity(fields.len());
                for name in fields {
                    let value = stored.get(name).ok_or_else(|| {
                        cx.error(ErrorKind::invalid_target(format!(
                            "reuse_existing field '{}' is not assigned",
                            name
                        )))
                    })?;
                    lookup.push((column_of(name), value.clone()));
                }
                Some(lookup)
            }
        };

        let identifier = target.identifier.as_ref().map(|pattern| IdentifierTemplate {
            parts: pattern
                .fields
                .iter()
                .map(|f| {
                    raw.get(f.as_str())
                        .cloned()
                        .unwrap_or(CompiledExpr::Literal(Value::Null))
                })
                .collect(),
            separator: pattern.separator.clone(),
        });

        let primary = cx.claim_primary(&target.name);
        let record = match &step.store_as {
            Some(alias) => cx.declare(&format!("v_{}", alias), LocalType::Row(table.qualified())),
            None if primary => "v_current".to_string(),
            None => cx.declare(
                &format!("v_{}_row", table.snake),
                LocalType::Row(table.qualified()),
            ),
        };

        let checks: Vec<Op> = target
            .constraints
            .iter()
            .filter(|c| c.on.on_create())
            .filter_map(|c| c.check.as_ref().map(|check| (c, check)))
            .map(|(c, check)| {
                let row = RowContext::new(target, RowSource::Record(record.clone()));
                Ok(Op::Guard {
                    condition: compile_condition(cx, scope, check, &row)?,
                    on_fail: Termination::validation(
                        c.name.clone(),
                        c.message
                            .clone()
                            .unwrap_or_else(|| format!("{} violates {}", target.name, c.name)),
                    ),
                })
            })
            .collect::<Result<_, CompileError>>()?;

        if let Some(alias) = &step.store_as {
            scope
                .bind(
                    alias,
                    Binding::Row {
                        entity: target.name.clone(),
                        record: record.clone(),
                    },
                )
                .map_err(|k| cx.error(k))?;
        }

        ops.push(Op::Insert(InsertOp {
            table,
            assignments,
            defaults,
            unique,
            reuse,
            identifier,
            record,
            primary,
        }));
        ops.extend(checks);
        Ok(ops)
    }
}
