use super::PatternExpander;
use crate::error::ErrorKind;
use specql_model::{BatchTemplate, EntitySpec, ErrorPolicy, Expr, ForEachStep, Step};

impl PatternExpander for BatchTemplate {
    fn expand(&self, _entity: &EntitySpec) -> Result<Vec<Step>, ErrorKind> {
        if self.items.trim().is_empty() {
            return Err(ErrorKind::expansion("batch template names no items field"));
        }
        Ok(vec![Step::ForEach(ForEachStep {
            collection: Expr::input(self.items.as_str()),
            item: self.item.clone(),
            body: vec![(*self.operation).clone()],
        })])
    }

    fn error_policy(&self) -> Option<ErrorPolicy> {
        self.error_policy
    }
}
