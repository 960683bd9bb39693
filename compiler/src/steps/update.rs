use super::{
    compile_condition, compile_expr, current_row, field_guards, presence_of, step_target,
    typed_for, unknown_field, StepCompiler,
};
use crate::error::{CompileError, ErrorKind};
use crate::expression::RowContext;
use crate::ir::{
    Assignment, CompiledExpr, LocalType, Op, RowSource, RowTarget, SqlType, TableRef,
    Termination, UpdateOp,
};
use crate::scope::{ActionContext, Binding, Scope};
use crate::trinity;
use specql_model::{CompareOp, EntitySpec, Expr, UpdateStep};

pub struct UpdateCompiler;

impl StepCompiler for UpdateCompiler {
    type Step = UpdateStep;

    fn compile(
        &self,
        step: &UpdateStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        let (target, table) = step_target(cx, step.entity.as_deref())?;
        if step.set.is_empty() {
            return Err(cx.error(ErrorKind::invalid_target("update sets no fields")));
        }
        if let Some(key) = step.set.keys().find(|k| target.field(k).is_none()) {
            return Err(cx.error(unknown_field(target, key)));
        }

        let mut ops = Vec::new();
        let (row_target, source) =
            single_row_target(cx, scope, target, &table, step.filter.as_ref(), true, &mut ops)?;
        let row = RowContext::new(target, source.clone());

        let mut assignments = Vec::new();
        for field in &target.fields {
            let Some(expr) = step.set.get(&field.name) else {
                continue;
            };
            let presence = presence_of(expr, scope);
            let value = typed_for(field, compile_expr(cx, scope, expr, &row)?);
            ops.extend(field_guards(target, field, &value, &presence));
            let value = match field.reference() {
                Some(referenced) => trinity::reference_value(cx, field, referenced, value, &mut ops)
                    .map_err(|k| cx.error(k))?,
                None => value,
            };
            assignments.push(Assignment {
                field: field.name.clone(),
                column: field.column_name(),
                value,
                presence,
                default: None,
            });
        }

        let key = match &row_target {
            RowTarget::Current => Some(CompiledExpr::local("v_pk", SqlType::Integer)),
            RowTarget::Pk { local, .. } => Some(CompiledExpr::local(local.clone(), SqlType::Integer)),
            RowTarget::Filter(_) => None,
        };
        if let Some(key) = &key {
            ops.extend(unique_guards(target, &table, &assignments, key));
        }

        let checks = match &row_target {
            RowTarget::Filter(_) => Vec::new(),
            _ => check_guards(cx, scope, target, &source)?,
        };

        if let Some(alias) = &step.store_as {
            let record = match &row_target {
                RowTarget::Current => "v_current".to_string(),
                RowTarget::Pk { record, .. } => record.clone(),
                RowTarget::Filter(_) => {
                    return Err(cx.error(ErrorKind::invalid_target(
                        "store_as needs an update of a single row",
                    )))
                }
            };
            scope
                .bind(
                    alias,
                    Binding::Row {
                        entity: target.name.clone(),
                        record,
                    },
                )
                .map_err(|k| cx.error(k))?;
        }

        let track_changes = !matches!(row_target, RowTarget::Filter(_));
        ops.push(Op::Update(UpdateOp {
            table,
            target: row_target,
            assignments,
            track_changes,
        }));
        ops.extend(checks);
        Ok(ops)
    }
}

/// Work out which rows an update or delete touches. No filter means the
/// action's own row; a filter naming one row by `id` or `identifier` resolves
/// and locks that row; anything else is a set filter.
pub(super) fn single_row_target(
    cx: &mut ActionContext<'_>,
    scope: &Scope,
    target: &EntitySpec,
    table: &TableRef,
    filter: Option<&Expr>,
    require_active: bool,
    ops: &mut Vec<Op>,
) -> Result<(RowTarget, RowSource), CompileError> {
    match filter {
        None => {
            if target.name != cx.entity.name {
                return Err(cx.error(ErrorKind::invalid_target(format!(
                    "a step on {} needs a where clause",
                    target.name
                ))));
            }
            if !cx.has_current() {
                return Err(cx.error(ErrorKind::invalid_target(
                    "the action has no current row to operate on",
                )));
            }
            Ok((RowTarget::Current, RowSource::Current))
        }
        Some(filter) => match trinity::single_row_key(filter) {
            Some(key) => {
                let value = compile_expr(cx, scope, key, &current_row(cx))?;
                let local = trinity::resolve_row(
                    cx,
                    table,
                    &format!("v_{}_pk", table.snake),
                    value,
                    require_active,
                    ops,
                );
                let record = cx.declare(
                    &format!("v_{}_row", table.snake),
                    LocalType::Row(table.qualified()),
                );
                ops.push(Op::Load {
                    table: table.clone(),
                    pk: local.clone(),
                    record: record.clone(),
                    capture_before: false,
                });
                Ok((
                    RowTarget::Pk {
                        local,
                        record: record.clone(),
                    },
                    RowSource::Record(record),
                ))
            }
            None => {
                let row = RowContext::new(target, RowSource::Target);
                let condition = compile_condition(cx, scope, filter, &row)?;
                Ok((RowTarget::Filter(condition), RowSource::Target))
            }
        },
    }
}

/// Uniqueness on update: for every constraint whose fields are all being
/// set, no other active row may already hold the new values.
fn unique_guards(
    target: &EntitySpec,
    table: &TableRef,
    assignments: &[Assignment],
    key: &CompiledExpr,
) -> Vec<Op> {
    target
        .unique_constraints()
        .filter(|c| c.on.on_update())
        .filter_map(|c| {
            let parts: Vec<&Assignment> = c
                .unique
                .iter()
                .map(|f| assignments.iter().find(|a| &a.field == f))
                .collect::<Option<_>>()?;
            let mut matches: Vec<CompiledExpr> = parts
                .iter()
                .map(|a| {
                    CompiledExpr::compare(
                        CompareOp::Eq,
                        CompiledExpr::column(
                            RowSource::Target,
                            a.column.clone(),
                            a.value.sql_type().unwrap_or(SqlType::Text),
                        ),
                        a.value.clone(),
                    )
                })
                .collect();
            matches.push(CompiledExpr::compare(
                CompareOp::Ne,
                CompiledExpr::column(RowSource::Target, table.pk_column.clone(), SqlType::Integer),
                key.clone(),
            ));
            let taken = CompiledExpr::Exists {
                table: table.clone(),
                condition: Some(Box::new(CompiledExpr::and(matches))),
                negated: true,
            };
            let present: Vec<CompiledExpr> =
                parts.iter().filter_map(|a| a.presence.condition()).collect();
            let condition = if present.is_empty() {
                taken
            } else {
                CompiledExpr::or(vec![
                    CompiledExpr::negate(CompiledExpr::and(present)),
                    taken,
                ])
            };
            Some(Op::Guard {
                condition,
                on_fail: Termination::validation(
                    "already_exists",
                    c.message.clone().unwrap_or_else(|| {
                        format!("another {} already has the same {}", target.name, c.unique.join(", "))
                    }),
                ),
            })
        })
        .collect()
}

/// Check constraints evaluated against the row after it was written.
fn check_guards(
    cx: &ActionContext<'_>,
    scope: &Scope,
    target: &EntitySpec,
    source: &RowSource,
) -> Result<Vec<Op>, CompileError> {
    let row = RowContext::new(target, source.clone());
    let mut guards = Vec::new();
    for constraint in target.constraints.iter().filter(|c| c.on.on_update()) {
        let Some(check) = &constraint.check else {
            continue;
        };
        guards.push(Op::Guard {
            condition: compile_condition(cx, scope, check, &row)?,
            on_fail: Termination::validation(
                constraint.name.clone(),
                constraint
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} violates {}", target.name, constraint.name)),
            ),
        });
    }
    Ok(guards)
}
