//! Step compilers: one per primitive step kind, each turning a step into
//! IR ops.

mod call;
mod conditional;
mod delete;
mod foreach;
mod insert;
mod notify;
mod update;
mod validate;

pub use call::CallCompiler;
pub use conditional::ConditionalCompiler;
pub use delete::DeleteCompiler;
pub use foreach::ForEachCompiler;
pub use insert::InsertCompiler;
pub use notify::NotifyCompiler;
pub use update::UpdateCompiler;
pub use validate::ValidateCompiler;

use crate::error::{CompileError, ErrorKind};
use crate::expression::{ExpressionCompiler, RowContext};
use crate::ir::{CompiledExpr, Op, Presence, RowSource, SqlType, TableRef, Termination};
use crate::scope::{ActionContext, Binding, Scope};
use serde_json::json;
use specql_model::{EntitySpec, Expr, FieldSpec, FieldType, RichCheck, Step};

pub trait StepCompiler {
    type Step;

    fn compile(
        &self,
        step: &Self::Step,
        cx: &mut ActionContext<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Op>, CompileError>;
}

pub fn compile_step(
    step: &Step,
    cx: &mut ActionContext<'_>,
    scope: &mut Scope,
) -> Result<Vec<Op>, CompileError> {
    match step {
        Step::Validate(s) => ValidateCompiler.compile(s, cx, scope),
        Step::Insert(s) => InsertCompiler.compile(s, cx, scope),
        Step::Update(s) => UpdateCompiler.compile(s, cx, scope),
        Step::Delete(s) => DeleteCompiler.compile(s, cx, scope),
        Step::If(s) => ConditionalCompiler.compile(s, cx, scope),
        Step::ForEach(s) => ForEachCompiler.compile(s, cx, scope),
        Step::Call(s) => CallCompiler.compile(s, cx, scope),
        Step::Notify(s) => NotifyCompiler.compile(s, cx, scope),
    }
}

/// Compile `steps` in order, naming each `<label>[i]` in error paths.
pub fn compile_steps(
    steps: &[Step],
    label: &str,
    cx: &mut ActionContext<'_>,
    scope: &mut Scope,
) -> Result<Vec<Op>, CompileError> {
    let mut ops = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        let compiled = cx.at(format!("{}[{}]", label, i), |cx| compile_step(step, cx, scope))?;
        ops.extend(compiled);
    }
    Ok(ops)
}

pub(crate) fn compile_expr(
    cx: &ActionContext<'_>,
    scope: &Scope,
    expr: &Expr,
    row: &RowContext<'_>,
) -> Result<CompiledExpr, CompileError> {
    ExpressionCompiler::new(cx, scope)
        .compile(expr, row)
        .map_err(|kind| cx.error(kind))
}

pub(crate) fn compile_condition(
    cx: &ActionContext<'_>,
    scope: &Scope,
    expr: &Expr,
    row: &RowContext<'_>,
) -> Result<CompiledExpr, CompileError> {
    ExpressionCompiler::new(cx, scope)
        .boolean(expr, row)
        .map_err(|kind| cx.error(kind))
}

/// Bare names in action-level expressions read the action's own row.
pub(crate) fn current_row<'a>(cx: &ActionContext<'a>) -> RowContext<'a> {
    RowContext::new(cx.entity, RowSource::Current)
}

/// Resolve the entity a step names, defaulting to the action's own.
pub(crate) fn step_target<'a>(
    cx: &ActionContext<'a>,
    entity: Option<&str>,
) -> Result<(&'a EntitySpec, TableRef), CompileError> {
    match entity {
        None => Ok((cx.entity, cx.table.clone())),
        Some(name) => cx.target(name).map_err(|kind| cx.error(kind)),
    }
}

pub(crate) fn unknown_field(entity: &EntitySpec, name: &str) -> ErrorKind {
    ErrorKind::UnknownField {
        entity: entity.name.clone(),
        field: name.to_string(),
        suggestions: specql_model::suggestion_names(name, &entity.field_names()),
    }
}

/// An assignment from `$input.x` or `item.x` applies only when the key is
/// present; anything else always applies.
pub(crate) fn presence_of(expr: &Expr, scope: &Scope) -> Presence {
    match expr {
        Expr::Input(key) => Presence::InputKey(key.clone()),
        Expr::Path(path) if path.len() == 2 => match scope.lookup(&path[0]) {
            Some(Binding::Item { var }) => Presence::ItemKey {
                var: var.clone(),
                key: path[1].clone(),
            },
            _ => Presence::Always,
        },
        _ => Presence::Always,
    }
}

/// Value checks run before a field is written: format and range of rich
/// types, enum membership, and presence of required fields.
pub(crate) fn field_guards(
    entity: &EntitySpec,
    field: &FieldSpec,
    value: &CompiledExpr,
    presence: &Presence,
) -> Vec<Op> {
    let mut guards = Vec::new();
    let nullable_check = |check: CompiledExpr| {
        CompiledExpr::or(vec![CompiledExpr::is_null(value.clone()), check])
    };

    match &field.field_type {
        FieldType::Rich(rich) => {
            let condition = match rich.check() {
                RichCheck::Pattern(pattern) => Some(CompiledExpr::Matches {
                    expr: Box::new(value.clone()),
                    pattern: pattern.to_string(),
                }),
                RichCheck::Range { min, max } => Some(CompiledExpr::and(vec![
                    CompiledExpr::compare(
                        specql_model::CompareOp::Ge,
                        value.clone(),
                        CompiledExpr::literal(json!(min)),
                    ),
                    CompiledExpr::compare(
                        specql_model::CompareOp::Le,
                        value.clone(),
                        CompiledExpr::literal(json!(max)),
                    ),
                ])),
                RichCheck::Unchecked => None,
            };
            if let Some(condition) = condition {
                guards.push((
                    nullable_check(condition),
                    Termination::validation(
                        format!("invalid_{}", rich.name()),
                        format!("{}.{} is not a valid {}", entity.name, field.name, rich.name()),
                    ),
                ));
            }
        }
        FieldType::Enum(values) => {
            guards.push((
                nullable_check(CompiledExpr::In {
                    expr: Box::new(value.clone()),
                    list: values.iter().map(|v| CompiledExpr::literal(v.as_str())).collect(),
                    negated: false,
                }),
                Termination::validation(
                    "invalid_enum_value",
                    format!(
                        "{}.{} must be one of: {}",
                        entity.name,
                        field.name,
                        values.join(", ")
                    ),
                ),
            ));
        }
        FieldType::Scalar(_) | FieldType::Ref(_) => {}
    }

    if field.is_required() {
        guards.push((
            CompiledExpr::is_not_null(value.clone()),
            Termination::validation(
                "required_field",
                format!("{}.{} is required", entity.name, field.name),
            ),
        ));
    }

    guards
        .into_iter()
        .map(|(condition, on_fail)| {
            let condition = match presence.condition() {
                Some(present) => CompiledExpr::or(vec![CompiledExpr::negate(present), condition]),
                None => condition,
            };
            Op::Guard { condition, on_fail }
        })
        .collect()
}

/// Type a value by the field it is written to.
pub(crate) fn typed_for(field: &FieldSpec, mut value: CompiledExpr) -> CompiledExpr {
    value.apply_hint(SqlType::for_input(field));
    value
}
