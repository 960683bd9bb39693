//! Typed intermediate representation produced by the step compilers.
//!
//! Every op refers to tables, columns and locals by name, with all spec-level
//! names already resolved. The PL/pgSQL renderer and the plan executor both
//! consume this form; neither looks at the ActionSpec again.

use crate::mutation::MutationStatus;
use serde::Serialize;
use serde_json::Value;
use specql_model::{
    ArithOp, CompareOp, ContextVar, EntityCatalog, EntitySpec, ErrorPolicy, FieldSpec, FieldType,
    LogicalOp, ScalarType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Text,
    Integer,
    Numeric,
    Boolean,
    Date,
    Timestamptz,
    Uuid,
    Jsonb,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Numeric => "NUMERIC",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Timestamptz => "TIMESTAMPTZ",
            SqlType::Uuid => "UUID",
            SqlType::Jsonb => "JSONB",
        }
    }

    pub fn from_scalar(scalar: ScalarType) -> Self {
        match scalar {
            ScalarType::Text => SqlType::Text,
            ScalarType::Integer => SqlType::Integer,
            ScalarType::Decimal => SqlType::Numeric,
            ScalarType::Boolean => SqlType::Boolean,
            ScalarType::Date => SqlType::Date,
            ScalarType::Timestamp => SqlType::Timestamptz,
            ScalarType::Uuid => SqlType::Uuid,
            ScalarType::Json => SqlType::Jsonb,
        }
    }

    /// Storage type of a field's column. References hold internal keys.
    pub fn for_column(field: &FieldSpec) -> Self {
        Self::from_scalar(field.field_type.base_scalar())
    }

    /// Type a caller supplies for a field. References arrive as UUID or
    /// identifier text.
    pub fn for_input(field: &FieldSpec) -> Self {
        match field.field_type {
            FieldType::Ref(_) => SqlType::Text,
            ref other => Self::from_scalar(other.base_scalar()),
        }
    }

    /// Type of a system column, or `None` if `name` is not one.
    pub fn for_system_column(name: &str) -> Option<Self> {
        Some(match name {
            "id" | "tenant_id" | "created_by" | "updated_by" | "deleted_by" => SqlType::Uuid,
            "identifier" => SqlType::Text,
            "created_at" | "updated_at" | "deleted_at" => SqlType::Timestamptz,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::Numeric)
    }
}

/// A resolved table together with the names the generator derives from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub entity: String,
    pub schema: String,
    pub table: String,
    pub pk_column: String,
    /// snake_case entity name, used for helper and local names.
    pub snake: String,
    pub tenant_scoped: bool,
}

impl TableRef {
    pub fn new(catalog: &EntityCatalog, entity: &EntitySpec) -> Self {
        let location = catalog.location(entity);
        Self {
            entity: entity.name.clone(),
            schema: location.schema,
            table: location.table,
            pk_column: entity.pk_column(),
            snake: entity.snake_name(),
            tenant_scoped: entity.tenant_scoped(),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// `<schema>.<snake>_<suffix>`, e.g. `crm.contact_pk`.
    pub fn helper(&self, suffix: &str) -> String {
        format!("{}.{}_{}", self.schema, self.snake, suffix)
    }
}

/// Whether a value is a raw internal key or something a caller supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Internal integer key referencing a row.
    Internal,
    /// Anything else: caller input, literals, loop items, external ids.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RowSource {
    /// The row the action operates on (`v_current`).
    Current,
    /// The row under evaluation in a filter or subquery.
    Target,
    /// A named row variable: a stored alias or a row loop variable.
    Record(String),
}

/// Whether an optional assignment applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Presence {
    Always,
    /// Applies only when the caller's payload carries the key.
    InputKey(String),
    /// Applies only when the loop item carries the key.
    ItemKey { var: String, key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpr {
    Literal(Value),
    Column {
        source: RowSource,
        column: String,
        sql_type: SqlType,
        /// Entity whose internal key this column holds.
        reference: Option<String>,
    },
    Input {
        key: String,
        sql_type: Option<SqlType>,
    },
    /// A key of a JSON loop item, or the whole item when `key` is `None`.
    Item {
        var: String,
        key: Option<String>,
        cast: Option<SqlType>,
    },
    Local {
        name: String,
        sql_type: SqlType,
        reference: Option<String>,
    },
    Context(ContextVar),
    /// A field of a nested action's result.
    CallField {
        record: String,
        field: String,
    },
    Present(Presence),
    Compare {
        op: CompareOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    Logical {
        op: LogicalOp,
        operands: Vec<CompiledExpr>,
    },
    Not(Box<CompiledExpr>),
    IsNull {
        expr: Box<CompiledExpr>,
        negated: bool,
    },
    In {
        expr: Box<CompiledExpr>,
        list: Vec<CompiledExpr>,
        negated: bool,
    },
    Arith {
        op: ArithOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    Matches {
        expr: Box<CompiledExpr>,
        pattern: String,
    },
    Exists {
        table: TableRef,
        condition: Option<Box<CompiledExpr>>,
        negated: bool,
    },
    Count {
        table: TableRef,
        condition: Option<Box<CompiledExpr>>,
    },
    /// External id or identifier to internal key, via `<entity>_pk`.
    ResolvePk {
        table: TableRef,
        value: Box<CompiledExpr>,
    },
    /// Internal key to external id, via `<entity>_id`.
    IdOf {
        table: TableRef,
        pk: Box<CompiledExpr>,
    },
}

impl CompiledExpr {
    pub fn literal(value: impl Into<Value>) -> Self {
        CompiledExpr::Literal(value.into())
    }

    pub fn local(name: impl Into<String>, sql_type: SqlType) -> Self {
        CompiledExpr::Local {
            name: name.into(),
            sql_type,
            reference: None,
        }
    }

    pub fn column(source: RowSource, column: impl Into<String>, sql_type: SqlType) -> Self {
        CompiledExpr::Column {
            source,
            column: column.into(),
            sql_type,
            reference: None,
        }
    }

    pub fn compare(op: CompareOp, left: CompiledExpr, right: CompiledExpr) -> Self {
        CompiledExpr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(operands: Vec<CompiledExpr>) -> Self {
        Self::logical(LogicalOp::And, operands)
    }

    pub fn or(operands: Vec<CompiledExpr>) -> Self {
        Self::logical(LogicalOp::Or, operands)
    }

    fn logical(op: LogicalOp, mut operands: Vec<CompiledExpr>) -> Self {
        if operands.len() == 1 {
            return operands.remove(0);
        }
        CompiledExpr::Logical { op, operands }
    }

    pub fn is_null(expr: CompiledExpr) -> Self {
        CompiledExpr::IsNull {
            expr: Box::new(expr),
            negated: false,
        }
    }

    pub fn is_not_null(expr: CompiledExpr) -> Self {
        CompiledExpr::IsNull {
            expr: Box::new(expr),
            negated: true,
        }
    }

    pub fn negate(expr: CompiledExpr) -> Self {
        CompiledExpr::Not(Box::new(expr))
    }

    /// Entity whose internal key this expression yields, if any.
    pub fn internal_reference(&self) -> Option<&str> {
        match self {
            CompiledExpr::Column { reference, .. } | CompiledExpr::Local { reference, .. } => {
                reference.as_deref()
            }
            CompiledExpr::ResolvePk { table, .. } => Some(&table.entity),
            _ => None,
        }
    }

    pub fn provenance(&self) -> Provenance {
        if self.internal_reference().is_some() {
            Provenance::Internal
        } else {
            Provenance::External
        }
    }

    /// Statically known type, if any. Untyped inputs and items return `None`.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            CompiledExpr::Column { sql_type, .. } | CompiledExpr::Local { sql_type, .. } => {
                Some(*sql_type)
            }
            CompiledExpr::Input { sql_type, .. } => *sql_type,
            CompiledExpr::Item { cast, key, .. } => match key {
                Some(_) => *cast,
                None => Some(SqlType::Jsonb),
            },
            CompiledExpr::Literal(value) => match value {
                Value::Bool(_) => Some(SqlType::Boolean),
                Value::Number(n) if n.is_i64() => Some(SqlType::Integer),
                Value::Number(_) => Some(SqlType::Numeric),
                Value::String(_) => Some(SqlType::Text),
                Value::Null => None,
                _ => Some(SqlType::Jsonb),
            },
            CompiledExpr::Context(var) => Some(match var {
                ContextVar::Now => SqlType::Timestamptz,
                _ => SqlType::Uuid,
            }),
            CompiledExpr::Compare { .. }
            | CompiledExpr::Logical { .. }
            | CompiledExpr::Not(_)
            | CompiledExpr::IsNull { .. }
            | CompiledExpr::In { .. }
            | CompiledExpr::Matches { .. }
            | CompiledExpr::Exists { .. }
            | CompiledExpr::Present(_) => Some(SqlType::Boolean),
            CompiledExpr::Count { .. } | CompiledExpr::ResolvePk { .. } => Some(SqlType::Integer),
            CompiledExpr::Arith { left, right, .. } => {
                match (left.sql_type(), right.sql_type()) {
                    (Some(SqlType::Integer), Some(SqlType::Integer)) => Some(SqlType::Integer),
                    _ => Some(SqlType::Numeric),
                }
            }
            CompiledExpr::IdOf { .. } => Some(SqlType::Uuid),
            CompiledExpr::CallField { field, .. } => Some(match field.as_str() {
                "entity_id" => SqlType::Uuid,
                _ => SqlType::Text,
            }),
        }
    }

    /// Give untyped inputs and item keys a type from their context. Already
    /// typed leaves are left alone.
    pub fn apply_hint(&mut self, ty: SqlType) {
        match self {
            CompiledExpr::Input { sql_type, .. } if sql_type.is_none() => *sql_type = Some(ty),
            CompiledExpr::Item {
                key: Some(_), cast, ..
            } if cast.is_none() => *cast = Some(ty),
            _ => {}
        }
    }

    /// Visit this expression and every sub-expression, pre-order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a CompiledExpr)) {
        f(self);
        match self {
            CompiledExpr::Compare { left, right, .. } | CompiledExpr::Arith { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            CompiledExpr::Logical { operands, .. } => operands.iter().for_each(|e| e.walk(f)),
            CompiledExpr::Not(inner) => inner.walk(f),
            CompiledExpr::IsNull { expr, .. } | CompiledExpr::Matches { expr, .. } => expr.walk(f),
            CompiledExpr::In { expr, list, .. } => {
                expr.walk(f);
                list.iter().for_each(|e| e.walk(f));
            }
            CompiledExpr::Exists { condition, .. } | CompiledExpr::Count { condition, .. } => {
                if let Some(c) = condition {
                    c.walk(f);
                }
            }
            CompiledExpr::ResolvePk { value, .. } => value.walk(f),
            CompiledExpr::IdOf { pk, .. } => pk.walk(f),
            CompiledExpr::Literal(_)
            | CompiledExpr::Column { .. }
            | CompiledExpr::Input { .. }
            | CompiledExpr::Item { .. }
            | CompiledExpr::Local { .. }
            | CompiledExpr::Context(_)
            | CompiledExpr::CallField { .. }
            | CompiledExpr::Present(_) => {}
        }
    }
}

impl Presence {
    /// Condition under which the assignment applies; `None` means always.
    pub fn condition(&self) -> Option<CompiledExpr> {
        match self {
            Presence::Always => None,
            _ => Some(CompiledExpr::Present(self.clone())),
        }
    }
}

/// Ends the action with a non-success status and rolls back its writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub status: MutationStatus,
    pub message: String,
}

impl Termination {
    pub fn validation(detail: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: MutationStatus::validation(detail),
            message: message.into(),
        }
    }

    pub fn noop(detail: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: MutationStatus::noop(detail),
            message: message.into(),
        }
    }
}

/// Declared type of a PL/pgSQL local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalType {
    Scalar(SqlType),
    /// `<table>%ROWTYPE`
    Row(String),
    MutationResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDecl {
    pub name: String,
    pub ty: LocalType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub field: String,
    pub column: String,
    pub value: CompiledExpr,
    pub presence: Presence,
    /// Written instead of a NULL value.
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueCheck {
    pub constraint: String,
    pub columns: Vec<(String, CompiledExpr)>,
    pub on_conflict: Termination,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierTemplate {
    pub parts: Vec<CompiledExpr>,
    pub separator: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOp {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    /// Declared defaults for fields the step leaves out.
    pub defaults: Vec<(String, Value)>,
    pub unique: Vec<UniqueCheck>,
    /// Get-or-create lookup: bind a matching active row instead of inserting.
    pub reuse: Option<Vec<(String, CompiledExpr)>>,
    pub identifier: Option<IdentifierTemplate>,
    /// Row variable receiving the written (or reused) row.
    pub record: String,
    /// The action's primary row: also becomes `v_current`.
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowTarget {
    /// The row loaded by the prologue.
    Current,
    /// A single row whose key was resolved into `local` and loaded into `record`.
    Pk { local: String, record: String },
    /// Every active row matching the condition.
    Filter(CompiledExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub table: TableRef,
    pub target: RowTarget,
    pub assignments: Vec<Assignment>,
    /// Record changed fields into `updated_fields`.
    pub track_changes: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dependent {
    pub table: TableRef,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOp {
    pub table: TableRef,
    pub target: RowTarget,
    pub hard: bool,
    pub dependents: Vec<Dependent>,
    pub on_dependents: Termination,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopSource {
    /// A JSON array supplied as `$input.<key>`.
    InputArray { key: String },
    /// A JSON array held by an enclosing loop item.
    ItemArray { var: String, key: String },
    Rows {
        table: TableRef,
        condition: Option<CompiledExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOp {
    pub var: String,
    pub index: String,
    pub source: LoopSource,
    pub body: Vec<Op>,
    /// Set on top-level loops only; nested loops propagate failures.
    pub policy: Option<ErrorPolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOp {
    pub entity: String,
    pub action: String,
    pub function: String,
    pub input_type: String,
    pub args: Vec<(String, CompiledExpr)>,
    pub non_fatal: bool,
    pub record: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmitOp {
    pub event: String,
    pub entity: String,
    pub payload: Vec<(String, CompiledExpr)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Terminates unless `condition` is true.
    Guard {
        condition: CompiledExpr,
        on_fail: Termination,
    },
    /// Resolve an external reference into an internal key local.
    Resolve {
        dest: String,
        table: TableRef,
        value: CompiledExpr,
        /// A NULL value leaves `dest` NULL instead of terminating.
        optional: bool,
        require_active: bool,
        on_missing: Termination,
    },
    /// Lock a row and load it into `record`.
    Load {
        table: TableRef,
        pk: String,
        record: String,
        /// Capture the row as the result's `payload_before`.
        capture_before: bool,
    },
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    Branch {
        condition: CompiledExpr,
        then_ops: Vec<Op>,
        else_ops: Vec<Op>,
    },
    Loop(LoopOp),
    Invoke(InvokeOp),
    Emit(EmitOp),
    Refresh {
        function: String,
        pk: Option<CompiledExpr>,
    },
}

impl Op {
    /// Visit this op and every nested op, in execution order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Op)) {
        f(self);
        match self {
            Op::Branch {
                then_ops, else_ops, ..
            } => {
                then_ops.iter().for_each(|op| op.walk(f));
                else_ops.iter().for_each(|op| op.walk(f));
            }
            Op::Loop(l) => l.body.iter().for_each(|op| op.walk(f)),
            _ => {}
        }
    }

    /// Expressions this op evaluates directly (not those of nested ops), in
    /// evaluation order.
    pub fn expressions(&self) -> Vec<&CompiledExpr> {
        let mut out: Vec<&CompiledExpr> = Vec::new();
        match self {
            Op::Guard { condition, .. } => out.push(condition),
            Op::Resolve { value, .. } => out.push(value),
            Op::Load { .. } => {}
            Op::Insert(insert) => {
                if let Some(reuse) = &insert.reuse {
                    out.extend(reuse.iter().map(|(_, e)| e));
                }
                out.extend(insert.assignments.iter().map(|a| &a.value));
                for check in &insert.unique {
                    out.extend(check.columns.iter().map(|(_, e)| e));
                }
                if let Some(ident) = &insert.identifier {
                    out.extend(ident.parts.iter());
                }
            }
            Op::Update(update) => {
                if let RowTarget::Filter(cond) = &update.target {
                    out.push(cond);
                }
                out.extend(update.assignments.iter().map(|a| &a.value));
            }
            Op::Delete(delete) => {
                if let RowTarget::Filter(cond) = &delete.target {
                    out.push(cond);
                }
            }
            Op::Branch { condition, .. } => out.push(condition),
            Op::Loop(l) => {
                if let LoopSource::Rows {
                    condition: Some(cond),
                    ..
                } = &l.source
                {
                    out.push(cond);
                }
            }
            Op::Invoke(invoke) => out.extend(invoke.args.iter().map(|(_, e)| e)),
            Op::Emit(emit) => out.extend(emit.payload.iter().map(|(_, e)| e)),
            Op::Refresh { pk, .. } => out.extend(pk.iter()),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_only_fills_untyped_leaves() {
        let mut input = CompiledExpr::Input {
            key: "price".to_string(),
            sql_type: None,
        };
        input.apply_hint(SqlType::Numeric);
        input.apply_hint(SqlType::Text);
        assert_eq!(input.sql_type(), Some(SqlType::Numeric));

        let mut whole_item = CompiledExpr::Item {
            var: "v_item".to_string(),
            key: None,
            cast: None,
        };
        whole_item.apply_hint(SqlType::Integer);
        assert_eq!(whole_item.sql_type(), Some(SqlType::Jsonb));
    }

    #[test]
    fn test_internal_reference_tracks_keys() {
        let fk = CompiledExpr::Column {
            source: RowSource::Current,
            column: "fk_company".to_string(),
            sql_type: SqlType::Integer,
            reference: Some("Company".to_string()),
        };
        assert_eq!(fk.provenance(), Provenance::Internal);
        let input = CompiledExpr::Input {
            key: "company".to_string(),
            sql_type: Some(SqlType::Text),
        };
        assert_eq!(input.provenance(), Provenance::External);
    }

    #[test]
    fn test_walk_reaches_nested_ops() {
        let guard = Op::Guard {
            condition: CompiledExpr::literal(true),
            on_fail: Termination::validation("x", "x"),
        };
        let branch = Op::Branch {
            condition: CompiledExpr::literal(true),
            then_ops: vec![guard.clone()],
            else_ops: vec![guard],
        };
        let mut count = 0;
        branch.walk(&mut |_| count += 1);
        assert_eq!(count, 3);
    }
}
