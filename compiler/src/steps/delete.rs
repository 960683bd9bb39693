use super::update::single_row_target;
use super::{step_target, StepCompiler};
use crate::error::{CompileError, ErrorKind};
use crate::ir::{
    CompiledExpr, DeleteOp, Dependent, Op, RowTarget, SqlType, TableRef, Termination,
};
use crate::scope::{ActionContext, Scope};
use specql_model::DeleteStep;

pub struct DeleteCompiler;

impl StepCompiler for DeleteCompiler {
    type Step = DeleteStep;

    fn compile(
        &self,
        step: &DeleteStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        if step.hard && !cx.action.allow_hard_delete {
            return Err(cx.error(ErrorKind::HardDeleteNotAllowed {
                reason: format!("action '{}' does not set allow_hard_delete", cx.action.name),
            }));
        }
        let (target, table) = step_target(cx, step.entity.as_deref())?;

        let mut ops = Vec::new();
        // Already-deleted rows must still resolve so they can report a noop.
        let (row_target, source) =
            single_row_target(cx, scope, target, &table, step.filter.as_ref(), false, &mut ops)?;

        if step.hard && matches!(row_target, RowTarget::Filter(_)) {
            return Err(cx.error(ErrorKind::HardDeleteNotAllowed {
                reason: "hard delete needs a single-row target".to_string(),
            }));
        }

        if !step.hard && !matches!(row_target, RowTarget::Filter(_)) {
            ops.push(Op::Guard {
                condition: CompiledExpr::is_null(CompiledExpr::column(
                    source,
                    "deleted_at",
                    SqlType::Timestamptz,
                )),
                on_fail: Termination::noop(
                    "already_deleted",
                    format!("{} is already deleted", target.name),
                ),
            });
        }

        let dependents: Vec<Dependent> = if step.hard {
            cx.catalog
                .referencing(&target.name)
                .into_iter()
                .map(|(entity, field)| Dependent {
                    table: TableRef::new(cx.catalog, entity),
                    column: field.column_name(),
                })
                .collect()
        } else {
            Vec::new()
        };
        let referenced_by: Vec<&str> = dependents.iter().map(|d| d.table.entity.as_str()).collect();
        let on_dependents = Termination::validation(
            "has_dependencies",
            format!(
                "{} is still referenced by {}",
                target.name,
                referenced_by.join(", ")
            ),
        );

        ops.push(Op::Delete(DeleteOp {
            table,
            target: row_target,
            hard: step.hard,
            dependents,
            on_dependents,
        }));
        Ok(ops)
    }
}
