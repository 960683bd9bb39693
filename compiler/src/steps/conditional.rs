use super::{compile_condition, compile_steps, current_row, StepCompiler};
use crate::error::CompileError;
use crate::ir::Op;
use crate::scope::{ActionContext, Scope};
use specql_model::IfStep;

pub struct ConditionalCompiler;

impl StepCompiler for ConditionalCompiler {
    type Step = IfStep;

    fn compile(
        &self,
        step: &IfStep,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError> {
        let condition = compile_condition(cx, scope, &step.condition, &current_row(cx))?;

        cx.enter_branch();
        scope.push();
        let then_ops = compile_steps(&step.then_steps, "then", cx, scope);
        scope.pop();
        scope.push();
        let else_ops = compile_steps(&step.else_steps, "else", cx, scope);
        scope.pop();
        cx.leave_branch();

        Ok(vec![Op::Branch {
            condition,
            then_ops: then_ops?,
            else_ops: else_ops?,
        }])
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::Op;
    use crate::{CallContext, FunctionGenerator, MemoryStore, Vm};
    use serde_json::json;
    use specql_model::parse::parse_spec_content;
    use specql_model::EntityCatalog;
    use uuid::Uuid;

    const ROUTING: &str = r#"{"entities": [
        {"name": "Lead", "schema": "crm",
         "fields": [{"name": "email", "type": "text"}],
         "actions": [
            {"name": "route_lead", "steps": [
                {"type": "if", "condition": "$input.score > 10",
                 "then": [{"type": "notify", "event": "lead.hot"}],
                 "else": [{"type": "notify", "event": "lead.cold"}]}
            ]}
         ]}
    ]}"#;

    fn catalog() -> EntityCatalog {
        EntityCatalog::new(parse_spec_content(ROUTING).unwrap()).unwrap()
    }

    #[test]
    fn test_branch_compiles_both_arms() {
        let catalog = catalog();
        let output = FunctionGenerator::new(&catalog).generate().unwrap();
        let plan = &output.plans()[0];
        let branch = plan
            .body
            .iter()
            .find_map(|op| match op {
                Op::Branch {
                    then_ops, else_ops, ..
                } => Some((then_ops.len(), else_ops.len())),
                _ => None,
            })
            .unwrap();
        assert_eq!(branch, (1, 1));
    }

    #[test]
    fn test_branch_takes_one_arm() {
        let catalog = catalog();
        let plans = FunctionGenerator::new(&catalog).generate().unwrap().plan_set();
        let vm = Vm::new(&plans);
        let ctx = CallContext::new(Uuid::new_v4(), Uuid::new_v4());
        let mut store = MemoryStore::from_catalog(&catalog);

        vm.execute(&mut store, "app.route_lead", ctx, json!({"score": 20}))
            .unwrap();
        vm.execute(&mut store, "app.route_lead", ctx, json!({"score": 3}))
            .unwrap();

        let events: Vec<&str> = store.outbox().iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, vec!["lead.hot", "lead.cold"]);
    }
}
