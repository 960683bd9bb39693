use super::{compile_expr, current_row, StepCompiler};
use crate::composite::{input_signature, input_type_name};
use crate::error::{CompileError, ErrorKind};
use crate::ir::{InvokeOp, LocalType, Op, TableRef};
use crate::orchestrator::core_function_name;
use crate::scope::{ActionContext, Binding, Scope};
use crate::trinity;
use specql_model::{suggestion_names, CallStep};

pub struct CallCompiler;

impl StepCompiler for CallCompiler {
    type Step = CallStep;

    fn compile(
        &self,
        step: &CallStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        let (callee_entity, callee) = cx
            .catalog
            .find_action(&step.action, cx.entity)
            .map_err(|e| cx.error(ErrorKind::from(e)))?;
        if callee_entity.name == cx.entity.name && callee.name == cx.action.name {
            return Err(cx.error(ErrorKind::invalid_target(format!(
                "action '{}' calls itself",
                callee.name
            ))));
        }
        let qualified = format!("{}.{}", callee_entity.name, callee.name);

        let accepted = input_signature(callee_entity, callee).map_err(|k| cx.error(k))?;
        let row = current_row(cx);
        let mut args = Vec::with_capacity(step.args.len());
        for (name, expr) in &step.args {
            if !accepted.iter().any(|a| a == name) {
                let candidates: Vec<&str> = accepted.iter().map(String::as_str).collect();
                return Err(cx.error(ErrorKind::UnknownArgument {
                    action: qualified,
                    argument: name.clone(),
                    suggestions: suggestion_names(name, &candidates),
                }));
            }
            let value = compile_expr(cx, scope, expr, &row)?;
            let value = trinity::externalize(cx, value).map_err(|k| cx.error(k))?;
            args.push((name.clone(), value));
        }

        let record = cx.declare(&format!("v_{}_result", callee.name), LocalType::MutationResult);
        if let Some(alias) = &step.store_as {
            scope
                .bind(
                    alias,
                    Binding::Call {
                        record: record.clone(),
                    },
                )
                .map_err(|k| cx.error(k))?;
        }

        let table = TableRef::new(cx.catalog, callee_entity);
        Ok(vec![Op::Invoke(InvokeOp {
            entity: callee_entity.name.clone(),
            action: callee.name.clone(),
            function: core_function_name(&table, &callee.name),
            input_type: input_type_name(&callee.name),
            args,
            non_fatal: step.non_fatal,
            record,
        })])
    }
}
