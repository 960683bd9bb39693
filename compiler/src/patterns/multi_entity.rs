use super::PatternExpander;
use crate::error::ErrorKind;
use specql_model::{
    DeleteStep, EntityOpKind, EntityOperation, EntitySpec, Expr, InsertStep, MultiEntityTemplate,
    Step, UpdateStep,
};
use std::collections::HashSet;

impl PatternExpander for MultiEntityTemplate {
    fn expand(&self, entity: &EntitySpec) -> Result<Vec<Step>, ErrorKind> {
        if self.operations.is_empty() {
            return Err(ErrorKind::expansion("multi_entity template has no operations"));
        }
        let declared: HashSet<&str> = self
            .operations
            .iter()
            .filter_map(|op| op.store_as.as_deref())
            .collect();

        let mut bound: HashSet<&str> = HashSet::new();
        let mut steps = Vec::with_capacity(self.operations.len());
        for (i, op) in self.operations.iter().enumerate() {
            check_aliases(entity, op, i, &declared, &bound)?;
            steps.push(operation_step(op, i)?);
            if let Some(alias) = op.store_as.as_deref() {
                if !bound.insert(alias) {
                    return Err(ErrorKind::expansion(format!(
                        "operations[{}]: alias '{}' is declared more than once",
                        i, alias
                    )));
                }
            }
        }
        Ok(steps)
    }
}

/// Every `alias.field` an operation reads must name an alias stored by an
/// earlier operation.
fn check_aliases(
    entity: &EntitySpec,
    op: &EntityOperation,
    index: usize,
    declared: &HashSet<&str>,
    bound: &HashSet<&str>,
) -> Result<(), ErrorKind> {
    let exprs = op.values.values().chain(op.set.values()).chain(op.filter.iter());
    for expr in exprs {
        let mut failure = None;
        expr.walk(&mut |e| {
            let Expr::Path(path) = e else { return };
            if path.len() != 2 || failure.is_some() {
                return;
            }
            let head = path[0].as_str();
            if bound.contains(head) {
                return;
            }
            let own_row = head == entity.name
                || head == entity.snake_name()
                || head == op.entity
                || head == specql_model::utils::to_snake_case(&op.entity);
            if own_row && !declared.contains(head) {
                return;
            }
            failure = Some(if declared.contains(head) {
                format!(
                    "operations[{}] reads '{}' before the operation storing it",
                    index, head
                )
            } else {
                format!("operations[{}] reads undeclared alias '{}'", index, head)
            });
        });
        if let Some(reason) = failure {
            return Err(ErrorKind::expansion(reason));
        }
    }
    Ok(())
}

fn operation_step(op: &EntityOperation, index: usize) -> Result<Step, ErrorKind> {
    Ok(match op.op {
        EntityOpKind::GetOrCreate | EntityOpKind::Insert => {
            let reuse = match op.op {
                EntityOpKind::GetOrCreate => {
                    if let Some(key) = op.match_on.iter().find(|k| !op.values.contains_key(*k)) {
                        return Err(ErrorKind::expansion(format!(
                            "operations[{}]: match field '{}' has no value",
                            index, key
                        )));
                    }
                    Some(op.match_on.clone())
                }
                _ => None,
            };
            Step::Insert(InsertStep {
                entity: op.entity.clone(),
                values: op.values.clone(),
                store_as: op.store_as.clone(),
                reuse_existing: reuse,
            })
        }
        EntityOpKind::Update => {
            if op.set.is_empty() {
                return Err(ErrorKind::expansion(format!(
                    "operations[{}]: update sets no fields",
                    index
                )));
            }
            Step::Update(UpdateStep {
                entity: Some(op.entity.clone()),
                set: op.set.clone(),
                filter: op.filter.clone(),
                store_as: op.store_as.clone(),
            })
        }
        EntityOpKind::Delete => Step::Delete(DeleteStep {
            entity: Some(op.entity.clone()),
            filter: op.filter.clone(),
            hard: false,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order() -> EntitySpec {
        serde_json::from_value(json!({"name": "Order"})).unwrap()
    }

    fn template(value: serde_json::Value) -> MultiEntityTemplate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_operations_in_order() {
        let t = template(json!({"operations": [
            {"op": "get_or_create", "entity": "Customer",
             "values": {"email": "$input.email", "name": "$input.name"},
             "match": ["email"], "store_as": "customer"},
            {"op": "insert", "entity": "Order",
             "values": {"customer": "customer.id", "total": "$input.total"}, "store_as": "order"},
            {"op": "update", "entity": "Customer", "set": {"last_order_total": "order.total"},
             "where": "id = customer.id"}
        ]}));
        let steps = t.expand(&order()).unwrap();
        assert_eq!(steps.len(), 3);
        match &steps[0] {
            Step::Insert(i) => assert_eq!(i.reuse_existing, Some(vec!["email".to_string()])),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&steps[2], Step::Update(u) if u.entity.as_deref() == Some("Customer")));
    }

    #[test]
    fn test_alias_errors() {
        let forward = template(json!({"operations": [
            {"op": "insert", "entity": "Order", "values": {"customer": "customer.id"}},
            {"op": "insert", "entity": "Customer", "values": {}, "store_as": "customer"}
        ]}));
        let err = forward.expand(&order()).unwrap_err();
        assert!(err.to_string().contains("before the operation storing it"), "{}", err);

        let undeclared = template(json!({"operations": [
            {"op": "insert", "entity": "Order", "values": {"customer": "buyer.id"}}
        ]}));
        assert!(undeclared.expand(&order()).unwrap_err().to_string().contains("undeclared alias 'buyer'"));

        let duplicate = template(json!({"operations": [
            {"op": "insert", "entity": "Order", "values": {}, "store_as": "o"},
            {"op": "insert", "entity": "Order", "values": {}, "store_as": "o"}
        ]}));
        assert!(duplicate.expand(&order()).is_err());
    }

    #[test]
    fn test_match_fields_need_values() {
        let t = template(json!({"operations": [
            {"op": "get_or_create", "entity": "Customer", "values": {"name": "$input.name"},
             "match": ["email"]}
        ]}));
        assert!(matches!(
            t.expand(&order()),
            Err(ErrorKind::PatternExpansion { .. })
        ));
    }
}
