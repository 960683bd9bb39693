//! What an action actually writes, derived from its compiled ops and
//! compared against the declared impact.

use crate::ir::Op;
use serde::Serialize;
use serde_json::{json, Value};
use specql_model::{CacheInvalidation, ImpactEntry, ImpactSpec, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ImpactMetadata {
    pub primary: Option<ImpactEntry>,
    pub side_effects: Vec<ImpactEntry>,
    pub cache_invalidations: Vec<CacheInvalidation>,
}

impl ImpactMetadata {
    /// The first write is the primary impact; every later write, in
    /// execution order, is a side effect.
    pub fn from_ops(ops: &[Op]) -> Self {
        let mut writes = Vec::new();
        for op in ops {
            op.walk(&mut |op| {
                let entry = match op {
                    Op::Insert(insert) => ImpactEntry {
                        entity: insert.table.entity.clone(),
                        operation: Operation::Create,
                        fields: insert.assignments.iter().map(|a| a.field.clone()).collect(),
                    },
                    Op::Update(update) => ImpactEntry {
                        entity: update.table.entity.clone(),
                        operation: Operation::Update,
                        fields: update.assignments.iter().map(|a| a.field.clone()).collect(),
                    },
                    Op::Delete(delete) => ImpactEntry {
                        entity: delete.table.entity.clone(),
                        operation: Operation::Delete,
                        fields: Vec::new(),
                    },
                    _ => return,
                };
                writes.push(entry);
            });
        }
        let mut writes = writes.into_iter();
        Self {
            primary: writes.next(),
            side_effects: writes.collect(),
            cache_invalidations: Vec::new(),
        }
    }

    /// Carry the declared cache invalidations over and describe every
    /// difference between declared and actual impact. A declared entry
    /// without fields leaves its fields unchecked.
    pub fn cross_check(&mut self, declared: &ImpactSpec) -> Vec<String> {
        self.cache_invalidations = declared.cache_invalidations.clone();
        let mut warnings = Vec::new();

        match &self.primary {
            None => warnings.push(format!(
                "declared primary impact {} {} but the action writes nothing",
                declared.primary.operation, declared.primary.entity
            )),
            Some(actual) if !same_write(actual, &declared.primary) => warnings.push(format!(
                "declared primary impact {} {} but the first write is {} {}",
                declared.primary.operation,
                declared.primary.entity,
                actual.operation,
                actual.entity
            )),
            Some(actual) => field_differences(&declared.primary, actual, "primary", &mut warnings),
        }

        let mut unmatched: Vec<&ImpactEntry> = self.side_effects.iter().collect();
        for expected in &declared.side_effects {
            match unmatched.iter().position(|a| same_write(a, expected)) {
                Some(i) => {
                    let actual = unmatched.remove(i);
                    field_differences(expected, actual, "side effect", &mut warnings);
                }
                None => warnings.push(format!(
                    "declared side effect {} {} does not happen",
                    expected.operation, expected.entity
                )),
            }
        }
        for actual in unmatched {
            warnings.push(format!(
                "undeclared side effect {} {}",
                actual.operation, actual.entity
            ));
        }
        warnings
    }

    /// Entities written, in order of first write.
    pub fn entities(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for entry in self.primary.iter().chain(&self.side_effects) {
            if !out.contains(&entry.entity.as_str()) {
                out.push(&entry.entity);
            }
        }
        out
    }

    /// The `_meta` object embedded in every result's metadata.
    pub fn to_meta(&self) -> Value {
        json!({
            "primary_entity": self.primary.as_ref().map(|p| p.entity.clone()),
            "primary_operation": self.primary.as_ref().map(|p| p.operation.to_string()),
            "actual_side_effects": self.side_effects,
            "cache_invalidations": self.cache_invalidations,
        })
    }
}

fn same_write(a: &ImpactEntry, b: &ImpactEntry) -> bool {
    a.entity == b.entity && a.operation == b.operation
}

fn field_differences(
    declared: &ImpactEntry,
    actual: &ImpactEntry,
    role: &str,
    warnings: &mut Vec<String>,
) {
    if declared.fields.is_empty() {
        return;
    }
    for field in declared.fields.iter().filter(|f| !actual.fields.contains(f)) {
        warnings.push(format!(
            "{} {}.{} is declared but never written",
            role, actual.entity, field
        ));
    }
    for field in actual.fields.iter().filter(|f| !declared.fields.contains(f)) {
        warnings.push(format!(
            "{} {}.{} is written but not declared",
            role, actual.entity, field
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CompiledExpr, DeleteOp, Dependent, RowTarget, TableRef, Termination};

    fn table(entity: &str) -> TableRef {
        TableRef {
            entity: entity.to_string(),
            schema: "crm".to_string(),
            table: format!("tb_{}", entity.to_lowercase()),
            pk_column: format!("pk_{}", entity.to_lowercase()),
            snake: entity.to_lowercase(),
            tenant_scoped: true,
        }
    }

    fn delete(entity: &str) -> Op {
        Op::Delete(DeleteOp {
            table: table(entity),
            target: RowTarget::Filter(CompiledExpr::literal(true)),
            hard: false,
            dependents: Vec::<Dependent>::new(),
            on_dependents: Termination::validation("has_dependencies", "x"),
        })
    }

    #[test]
    fn test_first_write_is_primary() {
        let ops = vec![
            delete("Contact"),
            Op::Branch {
                condition: CompiledExpr::literal(true),
                then_ops: vec![delete("Note")],
                else_ops: vec![],
            },
        ];
        let impact = ImpactMetadata::from_ops(&ops);
        assert_eq!(impact.primary.as_ref().map(|p| p.entity.as_str()), Some("Contact"));
        assert_eq!(impact.side_effects.len(), 1);
        assert_eq!(impact.entities(), vec!["Contact", "Note"]);
        let meta = impact.to_meta();
        assert_eq!(meta["primary_operation"], "delete");
        assert_eq!(meta["actual_side_effects"][0]["entity"], "Note");
    }

    #[test]
    fn test_cross_check_reports_differences() {
        let mut impact = ImpactMetadata::from_ops(&[delete("Contact"), delete("Note")]);
        let declared: ImpactSpec = serde_json::from_value(json!({
            "primary": {"entity": "Contact", "operation": "delete"},
            "side_effects": [{"entity": "Activity", "operation": "create"}],
            "cache_invalidations": [{"query": "contacts"}]
        }))
        .unwrap();
        let warnings = impact.cross_check(&declared);
        assert_eq!(warnings.len(), 2, "{:?}", warnings);
        assert_eq!(impact.cache_invalidations[0].strategy, "invalidate");
    }

    fn entry(entity: &str, operation: Operation, fields: &[&str]) -> ImpactEntry {
        ImpactEntry {
            entity: entity.to_string(),
            operation,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn test_cross_check_compares_fields_both_ways() {
        let mut impact = ImpactMetadata {
            primary: Some(entry("Item", Operation::Create, &["label", "score"])),
            side_effects: vec![entry("Log", Operation::Create, &["message"])],
            cache_invalidations: Vec::new(),
        };
        let declared: ImpactSpec = serde_json::from_value(json!({
            "primary": {"entity": "Item", "operation": "create", "fields": ["label"]},
            "side_effects": [{"entity": "Log", "operation": "create", "fields": ["message", "level"]}]
        }))
        .unwrap();
        let warnings = impact.cross_check(&declared);
        assert_eq!(
            warnings,
            vec![
                "primary Item.score is written but not declared".to_string(),
                "side effect Log.level is declared but never written".to_string(),
            ]
        );
    }

    #[test]
    fn test_cross_check_counts_side_effects() {
        let mut impact = ImpactMetadata {
            primary: Some(entry("Order", Operation::Update, &["status"])),
            side_effects: vec![
                entry("Note", Operation::Create, &["body"]),
                entry("Note", Operation::Create, &["body"]),
            ],
            cache_invalidations: Vec::new(),
        };
        let declared: ImpactSpec = serde_json::from_value(json!({
            "primary": {"entity": "Order", "operation": "update"},
            "side_effects": [{"entity": "Note", "operation": "create"}]
        }))
        .unwrap();
        let warnings = impact.cross_check(&declared);
        assert_eq!(warnings, vec!["undeclared side effect create Note".to_string()]);
    }
}
