use super::{compile_expr, current_row, StepCompiler};
use crate::error::{CompileError, ErrorKind};
use crate::ir::{EmitOp, Op};
use crate::scope::{ActionContext, Scope};
use crate::trinity;
use specql_model::NotifyStep;

pub struct NotifyCompiler;

impl StepCompiler for NotifyCompiler {
    type Step = NotifyStep;

    fn compile(
        &self,
        step: &NotifyStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        if step.event.trim().is_empty() {
            return Err(cx.error(ErrorKind::invalid_target("notify needs an event name")));
        }
        let row = current_row(cx);
        let mut payload = Vec::with_capacity(step.payload.len());
        for (key, expr) in &step.payload {
            let value = compile_expr(cx, scope, expr, &row)?;
            let value = trinity::externalize(cx, value).map_err(|k| cx.error(k))?;
            payload.push((key.clone(), value));
        }
        Ok(vec![Op::Emit(EmitOp {
            event: step.event.clone(),
            entity: cx.entity.name.clone(),
            payload,
        })])
    }
}
