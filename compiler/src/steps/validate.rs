use super::{compile_condition, current_row, StepCompiler};
use crate::error::CompileError;
use crate::ir::{Op, Termination};
use crate::scope::{ActionContext, Scope};
use specql_model::ValidateStep;

pub struct ValidateCompiler;

impl StepCompiler for ValidateCompiler {
    type Step = ValidateStep;

    fn compile(
        &self,
        step: &ValidateStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        let condition = compile_condition(cx, scope, &step.condition, &current_row(cx))?;
        let detail = step
            .error
            .clone()
            .unwrap_or_else(|| "condition_failed".to_string());
        let message = step
            .message
            .clone()
            .unwrap_or_else(|| format!("Validation failed: {}", step.condition));
        Ok(vec![Op::Guard {
            condition,
            on_fail: Termination::validation(detail, message),
        }])
    }
}
