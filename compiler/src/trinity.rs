//! Trinity identifiers: every row has an internal integer key, an external
//! UUID `id` and a human-readable `identifier`.
//!
//! Callers only ever see the external forms. References between rows are
//! stored as internal keys, so every external value headed for a reference
//! column is resolved first, and every internal key handed back to a caller
//! is mapped to its `id`.

use crate::error::ErrorKind;
use crate::ir::{CompiledExpr, Op, SqlType, TableRef, Termination};
use crate::scope::ActionContext;
use serde_json::Value;
use specql_model::{CompareOp, Expr, FieldSpec};

/// Helper function names generated once per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrinityHelpers {
    /// `(p_ref TEXT, p_tenant_id UUID) -> INTEGER`: id or identifier to key.
    pub pk: String,
    /// `(p_pk INTEGER) -> UUID`
    pub id: String,
    /// `(p_pk INTEGER) -> TEXT`
    pub identifier: String,
}

impl TrinityHelpers {
    pub fn for_table(table: &TableRef) -> Self {
        Self {
            pk: table.helper("pk"),
            id: table.helper("id"),
            identifier: table.helper("identifier"),
        }
    }
}

/// When `internal` holds a key of some entity and `other` is an external
/// value, wrap `other` in a key lookup so both sides compare keys.
pub(crate) fn align_reference(
    cx: &ActionContext<'_>,
    internal: &CompiledExpr,
    other: &mut CompiledExpr,
) -> Result<(), ErrorKind> {
    let Some(entity) = internal.internal_reference() else {
        return Ok(());
    };
    if other.internal_reference().is_some() || matches!(other, CompiledExpr::Literal(Value::Null)) {
        return Ok(());
    }
    let (_, table) = cx.target(entity)?;
    let mut value = std::mem::replace(other, CompiledExpr::Literal(Value::Null));
    value.apply_hint(SqlType::Text);
    *other = CompiledExpr::ResolvePk {
        table,
        value: Box::new(value),
    };
    Ok(())
}

/// Value to store in reference `field` (pointing at `target`). Internal keys
/// pass through unchanged; external values are resolved into a fresh local
/// by a `Resolve` op appended to `ops`.
pub fn reference_value(
    cx: &mut ActionContext<'_>,
    field: &FieldSpec,
    target: &str,
    value: CompiledExpr,
    ops: &mut Vec<Op>,
) -> Result<CompiledExpr, ErrorKind> {
    match value.internal_reference() {
        Some(entity) if entity == target => return Ok(value),
        Some(entity) => {
            return Err(ErrorKind::invalid_target(format!(
                "'{}' expects a {} reference but was given a {} key",
                field.name, target, entity
            )))
        }
        None => {}
    }
    if matches!(value, CompiledExpr::Literal(Value::Null)) {
        return Ok(value);
    }

    let (_, table) = cx.target(target)?;
    let mut value = value;
    value.apply_hint(SqlType::Text);
    let dest = cx.declare_scalar(&format!("v_{}_pk", field.name), SqlType::Integer);
    ops.push(Op::Resolve {
        dest: dest.clone(),
        table,
        value,
        optional: true,
        require_active: true,
        on_missing: Termination::validation(
            "reference_not_found",
            format!("{} referenced by '{}' was not found", target, field.name),
        ),
    });
    Ok(CompiledExpr::Local {
        name: dest,
        sql_type: SqlType::Integer,
        reference: Some(target.to_string()),
    })
}

/// Resolve the single row an action or step targets. The key lands in the
/// returned local; a missing row terminates with `validation:not_found`.
pub fn resolve_row(
    cx: &mut ActionContext<'_>,
    table: &TableRef,
    dest_base: &str,
    value: CompiledExpr,
    require_active: bool,
    ops: &mut Vec<Op>,
) -> String {
    let mut value = value;
    value.apply_hint(SqlType::Text);
    let dest = if dest_base == "v_pk" {
        dest_base.to_string()
    } else {
        cx.declare_scalar(dest_base, SqlType::Integer)
    };
    ops.push(Op::Resolve {
        dest: dest.clone(),
        table: table.clone(),
        value,
        optional: false,
        require_active,
        on_missing: Termination::validation("not_found", format!("{} not found", table.entity)),
    });
    dest
}

/// Express an internal key in external form before it leaves the action.
pub fn externalize(cx: &ActionContext<'_>, value: CompiledExpr) -> Result<CompiledExpr, ErrorKind> {
    match value.internal_reference() {
        Some(entity) => {
            let (_, table) = cx.target(entity)?;
            Ok(CompiledExpr::IdOf {
                table,
                pk: Box::new(value),
            })
        }
        None => Ok(value),
    }
}

/// `id = X` or `identifier = X` (either side), where `X` does not read the
/// filtered row: the filter names exactly one row by its external key.
pub fn single_row_key(filter: &Expr) -> Option<&Expr> {
    let Expr::Compare {
        op: CompareOp::Eq,
        left,
        right,
    } = filter
    else {
        return None;
    };
    let is_key = |e: &Expr| matches!(e, Expr::Path(p) if p.len() == 1 && (p[0] == "id" || p[0] == "identifier"));
    let reads_row = |e: &Expr| {
        let mut found = false;
        e.walk(&mut |sub| {
            if matches!(sub, Expr::Path(p) if p.len() == 1) {
                found = true;
            }
        });
        found
    };
    if is_key(left) && !reads_row(right) {
        Some(right)
    } else if is_key(right) && !reads_row(left) {
        Some(left)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row_key() {
        let parse = |s: &str| -> Expr { s.parse().unwrap() };
        let filter = parse("id = $input.contact");
        assert_eq!(single_row_key(&filter), Some(&Expr::input("contact")));

        let filter = parse("line.order = identifier");
        assert_eq!(single_row_key(&filter), Some(&Expr::path("line.order")));

        assert!(single_row_key(&parse("email = $input.email")).is_none());
        assert!(single_row_key(&parse("id = identifier")).is_none());
        assert!(single_row_key(&parse("id = $input.a AND status = 'x'")).is_none());
    }

    #[test]
    fn test_helper_names() {
        let table = TableRef {
            entity: "OrderLine".to_string(),
            schema: "sales".to_string(),
            table: "tb_order_line".to_string(),
            pk_column: "pk_order_line".to_string(),
            snake: "order_line".to_string(),
            tenant_scoped: true,
        };
        let helpers = TrinityHelpers::for_table(&table);
        assert_eq!(helpers.pk, "sales.order_line_pk");
        assert_eq!(helpers.id, "sales.order_line_id");
        assert_eq!(helpers.identifier, "sales.order_line_identifier");
    }
}
