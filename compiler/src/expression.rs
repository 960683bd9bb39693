//! Compiles spec expressions into [`CompiledExpr`], resolving every name
//! against the entity catalog and the current scope.

use crate::error::ErrorKind;
use crate::ir::{CompiledExpr, RowSource, SqlType};
use crate::scope::{ActionContext, Binding, Scope};
use crate::trinity;
use specql_model::{suggestion_names, EntitySpec, Expr, SYSTEM_COLUMNS};

/// Which entity bare field names refer to, and where that row lives.
#[derive(Debug, Clone)]
pub struct RowContext<'e> {
    pub entity: &'e EntitySpec,
    pub source: RowSource,
}

impl<'e> RowContext<'e> {
    pub fn new(entity: &'e EntitySpec, source: RowSource) -> Self {
        Self { entity, source }
    }
}

/// Result fields of a nested call that can be read through its alias.
const CALL_FIELDS: &[&str] = &["entity_id", "entity_name", "mutation_status", "message"];

pub struct ExpressionCompiler<'c, 'a> {
    cx: &'c ActionContext<'a>,
    scope: &'c Scope,
}

impl<'c, 'a> ExpressionCompiler<'c, 'a> {
    pub fn new(cx: &'c ActionContext<'a>, scope: &'c Scope) -> Self {
        Self { cx, scope }
    }

    pub fn compile(&self, expr: &Expr, row: &RowContext<'_>) -> Result<CompiledExpr, ErrorKind> {
        match expr {
            Expr::Literal(lit) => Ok(CompiledExpr::Literal(lit.to_json())),
            Expr::Path(path) => self.path(path, row),
            Expr::Input(key) => Ok(CompiledExpr::Input {
                key: key.clone(),
                sql_type: None,
            }),
            Expr::Context(var) => Ok(CompiledExpr::Context(*var)),
            Expr::Compare { op, left, right } => {
                let mut left = self.compile(left, row)?;
                let mut right = self.compile(right, row)?;
                self.reconcile(&mut left, &mut right)?;
                Ok(CompiledExpr::compare(*op, left, right))
            }
            Expr::Logical { op, operands } => {
                let operands = operands
                    .iter()
                    .map(|e| self.boolean(e, row))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledExpr::Logical { op: *op, operands })
            }
            Expr::Not(inner) => Ok(CompiledExpr::negate(self.boolean(inner, row)?)),
            Expr::IsNull { expr, negated } => Ok(CompiledExpr::IsNull {
                expr: Box::new(self.compile(expr, row)?),
                negated: *negated,
            }),
            Expr::In {
                expr,
                list,
                negated,
            } => {
                let subject = self.compile(expr, row)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    let mut subject_copy = subject.clone();
                    let mut compiled = self.compile(item, row)?;
                    self.reconcile(&mut subject_copy, &mut compiled)?;
                    items.push(compiled);
                }
                let mut subject = subject;
                if let Some(ty) = items.iter().find_map(CompiledExpr::sql_type) {
                    subject.apply_hint(ty);
                }
                Ok(CompiledExpr::In {
                    expr: Box::new(subject),
                    list: items,
                    negated: *negated,
                })
            }
            Expr::Arith { op, left, right } => {
                let mut left = self.compile(left, row)?;
                let mut right = self.compile(right, row)?;
                left.apply_hint(SqlType::Numeric);
                right.apply_hint(SqlType::Numeric);
                Ok(CompiledExpr::Arith {
                    op: *op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            Expr::Exists {
                entity,
                condition,
                negated,
            } => {
                let (target, table) = self.cx.target(entity)?;
                let condition = self.subquery_condition(target, condition.as_deref())?;
                Ok(CompiledExpr::Exists {
                    table,
                    condition,
                    negated: *negated,
                })
            }
            Expr::Count { entity, condition } => {
                let (target, table) = self.cx.target(entity)?;
                let condition = self.subquery_condition(target, condition.as_deref())?;
                Ok(CompiledExpr::Count { table, condition })
            }
            Expr::Rows { .. } => Err(ErrorKind::malformed(
                expr,
                "ROWS(...) is only valid as a foreach collection",
            )),
        }
    }

    /// Compile a condition, typing bare inputs as booleans.
    pub fn boolean(&self, expr: &Expr, row: &RowContext<'_>) -> Result<CompiledExpr, ErrorKind> {
        let mut compiled = self.compile(expr, row)?;
        compiled.apply_hint(SqlType::Boolean);
        Ok(compiled)
    }

    fn subquery_condition(
        &self,
        target: &EntitySpec,
        condition: Option<&Expr>,
    ) -> Result<Option<Box<CompiledExpr>>, ErrorKind> {
        let row = RowContext::new(target, RowSource::Target);
        condition
            .map(|c| self.boolean(c, &row).map(Box::new))
            .transpose()
    }

    /// Make both sides of a comparison agree: an internal key is compared
    /// with the resolved key of an external value, and untyped inputs take
    /// the other side's type.
    fn reconcile(&self, a: &mut CompiledExpr, b: &mut CompiledExpr) -> Result<(), ErrorKind> {
        trinity::align_reference(self.cx, a, b)?;
        trinity::align_reference(self.cx, b, a)?;
        if let Some(ty) = a.sql_type() {
            b.apply_hint(ty);
        }
        if let Some(ty) = b.sql_type() {
            a.apply_hint(ty);
        }
        Ok(())
    }

    fn path(&self, path: &[String], row: &RowContext<'_>) -> Result<CompiledExpr, ErrorKind> {
        match path {
            [name] => match self.scope.lookup(name) {
                Some(binding) => self.whole_binding(binding),
                None => column(row.entity, row.source.clone(), name),
            },
            [head, field] => match self.scope.lookup(head) {
                Some(binding) => self.binding_field(binding, head, field),
                None if *head == row.entity.name || *head == row.entity.snake_name() => {
                    column(row.entity, row.source.clone(), field)
                }
                None => Err(self.scope.unknown(head)),
            },
            _ => Err(ErrorKind::malformed(
                path.join("."),
                "paths have at most two segments",
            )),
        }
    }

    fn whole_binding(&self, binding: &Binding) -> Result<CompiledExpr, ErrorKind> {
        match binding {
            Binding::Item { var } => Ok(CompiledExpr::Item {
                var: var.clone(),
                key: None,
                cast: None,
            }),
            Binding::Row { entity, record } => {
                let (spec, _) = self.cx.target(entity)?;
                Ok(CompiledExpr::Column {
                    source: RowSource::Record(record.clone()),
                    column: spec.pk_column(),
                    sql_type: SqlType::Integer,
                    reference: Some(spec.name.clone()),
                })
            }
            Binding::Call { record } => Ok(CompiledExpr::CallField {
                record: record.clone(),
                field: "entity_id".to_string(),
            }),
        }
    }

    fn binding_field(
        &self,
        binding: &Binding,
        name: &str,
        field: &str,
    ) -> Result<CompiledExpr, ErrorKind> {
        match binding {
            Binding::Item { var } => Ok(CompiledExpr::Item {
                var: var.clone(),
                key: Some(field.to_string()),
                cast: None,
            }),
            Binding::Row { entity, record } => {
                let (spec, _) = self.cx.target(entity)?;
                column(spec, RowSource::Record(record.clone()), field)
            }
            Binding::Call { record } => {
                let canonical = match field {
                    "status" => "mutation_status",
                    "id" => "entity_id",
                    other => other,
                };
                if !CALL_FIELDS.contains(&canonical) {
                    return Err(ErrorKind::UnknownField {
                        entity: name.to_string(),
                        field: field.to_string(),
                        suggestions: suggestion_names(field, CALL_FIELDS),
                    });
                }
                Ok(CompiledExpr::CallField {
                    record: record.clone(),
                    field: canonical.to_string(),
                })
            }
        }
    }
}

/// A column of `entity` read from `source`: a declared field, a system
/// column or the internal key.
pub fn column(entity: &EntitySpec, source: RowSource, name: &str) -> Result<CompiledExpr, ErrorKind> {
    if let Some(field) = entity.field(name) {
        return Ok(CompiledExpr::Column {
            source,
            column: field.column_name(),
            sql_type: SqlType::for_column(field),
            reference: field.reference().map(str::to_string),
        });
    }
    if name == entity.pk_column() {
        return Ok(CompiledExpr::Column {
            source,
            column: name.to_string(),
            sql_type: SqlType::Integer,
            reference: Some(entity.name.clone()),
        });
    }
    if let Some(ty) = SqlType::for_system_column(name) {
        return Ok(CompiledExpr::column(source, name, ty));
    }
    let mut candidates = entity.field_names();
    candidates.extend(SYSTEM_COLUMNS.iter().copied());
    Err(ErrorKind::UnknownField {
        entity: entity.name.clone(),
        field: name.to_string(),
        suggestions: suggestion_names(name, &candidates),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_model::parse::parse_spec_content;
    use specql_model::{CompareOp, EntityCatalog, ErrorPolicy};

    fn catalog() -> EntityCatalog {
        let doc = parse_spec_content(
            r#"{"entities": [
                {"name": "Company", "schema": "crm", "fields": [{"name": "name", "type": "text"}]},
                {"name": "Contact", "schema": "crm",
                 "fields": [
                    {"name": "email", "type": "email"},
                    {"name": "status", "type": "enum(lead, qualified)"},
                    {"name": "score", "type": "integer"},
                    {"name": "company", "type": "ref(Company)"}
                 ],
                 "actions": [{"name": "qualify_lead"}]}
            ]}"#,
        )
        .unwrap();
        EntityCatalog::new(doc).unwrap()
    }

    fn compile(src: &str, scope: &Scope) -> Result<CompiledExpr, ErrorKind> {
        let cat = catalog();
        let contact = cat.entity("Contact").unwrap();
        let action = &contact.actions[0];
        let cx = ActionContext::new(&cat, contact, action, ErrorPolicy::default(), true);
        let expr: Expr = src.parse().unwrap();
        let row = RowContext::new(contact, RowSource::Current);
        ExpressionCompiler::new(&cx, scope).compile(&expr, &row)
    }

    #[test]
    fn test_input_takes_column_type() {
        let compiled = compile("score > $input.min_score", &Scope::new()).unwrap();
        match compiled {
            CompiledExpr::Compare { op, right, .. } => {
                assert_eq!(op, CompareOp::Gt);
                assert_eq!(right.sql_type(), Some(SqlType::Integer));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reference_comparison_resolves_external_side() {
        let compiled = compile("company = $input.company", &Scope::new()).unwrap();
        match compiled {
            CompiledExpr::Compare { left, right, .. } => {
                assert!(matches!(*left, CompiledExpr::Column { ref column, .. } if column == "fk_company"));
                match *right {
                    CompiledExpr::ResolvePk { table, value } => {
                        assert_eq!(table.entity, "Company");
                        assert_eq!(value.sql_type(), Some(SqlType::Text));
                    }
                    other => panic!("expected key resolution, got {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_field_suggests() {
        let err = compile("stauts = 'lead'", &Scope::new()).unwrap_err();
        assert_eq!(err.suggestions()[0], "status");
    }

    #[test]
    fn test_binding_paths() {
        let mut scope = Scope::new();
        scope
            .bind("line", Binding::Item { var: "v_line".into() })
            .unwrap();
        scope
            .bind(
                "acme",
                Binding::Row {
                    entity: "Company".into(),
                    record: "v_acme".into(),
                },
            )
            .unwrap();

        let item = compile("line.qty * 2", &scope).unwrap();
        match item {
            CompiledExpr::Arith { left, .. } => assert_eq!(
                *left,
                CompiledExpr::Item {
                    var: "v_line".into(),
                    key: Some("qty".into()),
                    cast: Some(SqlType::Numeric)
                }
            ),
            other => panic!("unexpected {:?}", other),
        }

        // A stored row compared to a reference column stays internal.
        match compile("company = acme", &scope).unwrap() {
            CompiledExpr::Compare { right, .. } => {
                assert_eq!(right.internal_reference(), Some("Company"))
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = compile("lien.qty > 1", &scope).unwrap_err();
        assert!(matches!(err, ErrorKind::UnknownBinding { .. }));
        assert_eq!(err.suggestions()[0], "line");
    }

    #[test]
    fn test_exists_reads_target_rows() {
        let compiled = compile("NOT EXISTS(Contact WHERE email = $input.email)", &Scope::new()).unwrap();
        match compiled {
            CompiledExpr::Exists {
                table,
                condition: Some(cond),
                negated: true,
            } => {
                assert_eq!(table.qualified(), "crm.tb_contact");
                match *cond {
                    CompiledExpr::Compare { left, .. } => assert!(matches!(
                        *left,
                        CompiledExpr::Column {
                            source: RowSource::Target,
                            ..
                        }
                    )),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rows_outside_foreach_is_rejected() {
        assert!(matches!(
            compile("ROWS(Contact)", &Scope::new()),
            Err(ErrorKind::MalformedExpression { .. })
        ));
    }
}
