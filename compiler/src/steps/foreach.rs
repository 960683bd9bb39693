use super::{compile_condition, compile_steps, StepCompiler};
use crate::error::{CompileError, ErrorKind};
use crate::expression::RowContext;
use crate::ir::{LocalType, LoopOp, LoopSource, Op, RowSource, SqlType};
use crate::scope::{ActionContext, Binding, Scope};
use specql_model::{Expr, ForEachStep};

pub struct ForEachCompiler;

impl StepCompiler for ForEachCompiler {
    type Step = ForEachStep;

    fn compile(
        &self,
        step: &ForEachStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        if step.body.is_empty() {
            return Err(cx.error(ErrorKind::invalid_target("foreach body is empty")));
        }

        let (source, var, binding) = match &step.collection {
            Expr::Input(key) => {
                let var = cx.declare(&format!("v_{}", step.item), LocalType::Scalar(SqlType::Jsonb));
                (
                    LoopSource::InputArray { key: key.clone() },
                    var.clone(),
                    Binding::Item { var },
                )
            }
            Expr::Path(path) if path.len() == 2 => {
                let outer = match scope.lookup(&path[0]) {
                    Some(Binding::Item { var }) => var.clone(),
                    _ => {
                        return Err(cx.error(ErrorKind::malformed(
                            &step.collection,
                            "only loop items hold nested arrays",
                        )))
                    }
                };
                let var = cx.declare(&format!("v_{}", step.item), LocalType::Scalar(SqlType::Jsonb));
                (
                    LoopSource::ItemArray {
                        var: outer,
                        key: path[1].clone(),
                    },
                    var.clone(),
                    Binding::Item { var },
                )
            }
            Expr::Rows { entity, condition } => {
                let (target, table) = cx.target(entity).map_err(|k| cx.error(k))?;
                let condition = match condition {
                    Some(c) => Some(compile_condition(
                        cx,
                        scope,
                        c,
                        &RowContext::new(target, RowSource::Target),
                    )?),
                    None => None,
                };
                let var = cx.declare(&format!("v_{}", step.item), LocalType::Row(table.qualified()));
                (
                    LoopSource::Rows { table, condition },
                    var.clone(),
                    Binding::Row {
                        entity: target.name.clone(),
                        record: var,
                    },
                )
            }
            other => {
                return Err(cx.error(ErrorKind::malformed(
                    other,
                    "foreach iterates $input.<field>, an item array or ROWS(...)",
                )))
            }
        };
        let index = cx.declare_scalar(&format!("v_{}_idx", step.item), SqlType::Integer);

        let policy = if cx.loop_depth() == 0 {
            let policy = cx.error_policy;
            cx.set_batch_policy(policy);
            Some(policy)
        } else {
            None
        };

        cx.enter_loop();
        scope.push();
        let body = match scope.bind(&step.item, binding) {
            Ok(()) => compile_steps(&step.body, "body", cx, scope),
            Err(kind) => Err(cx.error(kind)),
        };
        scope.pop();
        cx.leave_loop();

        Ok(vec![Op::Loop(LoopOp {
            var,
            index,
            source,
            body: body?,
            policy,
        })])
    }
}
