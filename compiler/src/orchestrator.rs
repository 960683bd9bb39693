//! Assembles a complete action: permission guard, current-row prologue,
//! compiled steps, projection refresh, result and audit metadata.

use crate::canonical_log::CanonicalLog;
use crate::composite::{check_output, derive_input_type, CompositeType, OUTPUT_TYPE};
use crate::error::{CompileError, ErrorKind, StepPath};
use crate::expression::RowContext;
use crate::impact::ImpactMetadata;
use crate::ir::{CompiledExpr, LocalDecl, Op, RowSource, SqlType, TableRef, Termination};
use crate::patterns::{expand, needs_current_row};
use crate::scope::{ActionContext, Scope};
use crate::steps::{compile_condition, compile_steps};
use crate::trinity;
use serde::Serialize;
use specql_model::utils::{to_camel_case, to_pascal_case};
use specql_model::{ActionPattern, ActionSpec, EntityCatalog, EntitySpec, ErrorPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Failure list bound for batch actions that declare no error policy.
    pub default_max_errors: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            default_max_errors: ErrorPolicy::default().max_errors,
        }
    }
}

/// How the action is exposed to the API annotation emitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationDescriptor {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub impact: ImpactMetadata,
}

/// A fully compiled action, ready to render or execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    pub entity: String,
    pub action: String,
    pub pattern: ActionPattern,
    pub table: TableRef,
    pub core_function: String,
    pub app_function: String,
    pub input: CompositeType,
    pub locals: Vec<LocalDecl>,
    pub body: Vec<Op>,
    /// Error policy of the top-level loop, when the action is a batch.
    pub batch: Option<ErrorPolicy>,
    pub has_current: bool,
    pub impact: ImpactMetadata,
    pub warnings: Vec<String>,
    pub descriptor: MutationDescriptor,
    pub fingerprint: String,
    pub success_message: String,
}

impl ActionPlan {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.entity, self.action)
    }

    pub fn mutation_type(&self) -> &'static str {
        self.pattern.mutation_type()
    }
}

pub fn core_function_name(table: &TableRef, action: &str) -> String {
    format!("{}.{}", table.schema, action)
}

pub fn app_function_name(action: &str) -> String {
    format!("app.{}", action)
}

pub fn compile_action(
    catalog: &EntityCatalog,
    entity: &EntitySpec,
    action: &ActionSpec,
    options: &CompileOptions,
) -> Result<ActionPlan, CompileError> {
    let mut log = CanonicalLog::new("compile_action");
    log.set("entity", &entity.name).set("action", &action.name);

    let located = |kind: ErrorKind| CompileError {
        path: StepPath::new(entity.name.clone(), action.name.clone()),
        kind,
    };
    check_output(action).map_err(located)?;
    let expanded = expand(entity, action).map_err(located)?;

    let pattern = action.effective_pattern();
    let has_current = needs_current_row(entity, pattern, &expanded.steps);
    let policy = expanded.error_policy.unwrap_or(ErrorPolicy {
        max_errors: options.default_max_errors,
        ..ErrorPolicy::default()
    });
    let mut cx = ActionContext::new(catalog, entity, action, policy, has_current);
    let mut scope = Scope::new();
    let mut body = Vec::new();

    if has_current {
        let table = cx.table.clone();
        let id = CompiledExpr::Input {
            key: "id".to_string(),
            sql_type: Some(SqlType::Text),
        };
        let pk = trinity::resolve_row(
            &mut cx,
            &table,
            "v_pk",
            id,
            pattern != ActionPattern::Delete,
            &mut body,
        );
        body.push(Op::Load {
            table,
            pk,
            record: "v_current".to_string(),
            capture_before: true,
        });
    }

    if let Some(requires) = &action.requires {
        let row = RowContext::new(entity, RowSource::Current);
        let condition = cx.at("requires", |cx| compile_condition(cx, &scope, requires, &row))?;
        body.push(Op::Guard {
            condition,
            on_fail: Termination::validation(
                "permission_denied",
                format!("Permission denied for {}", action.name),
            ),
        });
    }

    let (template, own) = expanded.steps.split_at(expanded.template_steps);
    body.extend(compile_steps(template, "template", &mut cx, &mut scope)?);
    body.extend(compile_steps(own, "steps", &mut cx, &mut scope)?);
    tracing::debug!(
        entity = %entity.name,
        action = %action.name,
        steps = expanded.steps.len(),
        "compiled steps"
    );

    let mut impact = ImpactMetadata::from_ops(&body);
    let mut warnings = match &action.impact {
        Some(declared) => impact.cross_check(declared),
        None => Vec::new(),
    };
    body.extend(refresh_ops(catalog, entity, &impact, &cx.table));

    let (input, type_warnings) = derive_input_type(&action.name, &body);
    warnings.extend(type_warnings);
    for warning in &warnings {
        tracing::warn!(entity = %entity.name, action = %action.name, "{}", warning);
        log.warn(warning.clone());
    }

    let batch = cx.batch_policy();
    let table = cx.table.clone();
    let locals = cx.into_locals();
    let app_function = app_function_name(&action.name);
    let descriptor = MutationDescriptor {
        name: to_camel_case(&action.name),
        input_type: format!("{}Input", to_pascal_case(&action.name)),
        output_type: "MutationResult".to_string(),
        function: app_function.clone(),
        description: action.description.clone(),
        impact: impact.clone(),
    };

    let op_count = body.iter().map(count_ops).sum::<usize>();
    log.set("ops", op_count)
        .set("locals", locals.len())
        .set("input_fields", input.fields.len())
        .set("output", OUTPUT_TYPE);

    Ok(ActionPlan {
        entity: entity.name.clone(),
        action: action.name.clone(),
        pattern,
        core_function: core_function_name(&table, &action.name),
        app_function,
        table,
        input,
        locals,
        body,
        batch,
        has_current,
        impact,
        warnings,
        descriptor,
        fingerprint: action.fingerprint(),
        success_message: success_message(entity, action, pattern),
    })
}

/// Refresh every projection of every entity the action writes. The primary
/// entity's refresh is keyed by the action's row.
fn refresh_ops(
    catalog: &EntityCatalog,
    entity: &EntitySpec,
    impact: &ImpactMetadata,
    own: &TableRef,
) -> Vec<Op> {
    let mut ops = Vec::new();
    for name in impact.entities() {
        let Ok(written) = catalog.entity(name) else {
            continue;
        };
        let schema = catalog.location(written).schema;
        for projection in &written.projections {
            let pk = (written.name == entity.name)
                .then(|| CompiledExpr::local("v_pk", SqlType::Integer));
            ops.push(Op::Refresh {
                function: format!("{}.{}", schema, projection.refresh_function()),
                pk,
            });
        }
    }
    if !ops.is_empty() {
        tracing::debug!(entity = %own.entity, refreshes = ops.len(), "projection refresh");
    }
    ops
}

fn count_ops(op: &Op) -> usize {
    let mut n = 0;
    op.walk(&mut |_| n += 1);
    n
}

fn success_message(entity: &EntitySpec, action: &ActionSpec, pattern: ActionPattern) -> String {
    match pattern {
        ActionPattern::Create => format!("{} created", entity.name),
        ActionPattern::Update => format!("{} updated", entity.name),
        ActionPattern::Delete => format!("{} deleted", entity.name),
        ActionPattern::Custom => format!("{} completed", action.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_model::parse::parse_spec_content;

    fn catalog() -> EntityCatalog {
        let doc = parse_spec_content(
            r#"{"entities": [
                {"name": "Contact", "schema": "crm",
                 "fields": [
                    {"name": "email", "type": "email", "nullable": false},
                    {"name": "status", "type": "enum(lead, qualified)", "default": "lead"}
                 ],
                 "projections": [{"name": "contact_summary"}],
                 "actions": [
                    {"name": "create_contact", "steps": [
                        {"type": "insert", "entity": "Contact", "values": {"email": "$input.email"}}
                    ]},
                    {"name": "qualify_lead",
                     "requires": "$auth_user_id IS NOT NULL",
                     "template": {"kind": "state_machine", "from_states": ["lead"], "to_state": "qualified"},
                     "impact": {"primary": {"entity": "Contact", "operation": "update", "fields": ["status"]},
                                "side_effects": [{"entity": "Note", "operation": "create"}]}},
                    {"name": "broken", "steps": [{"type": "validate", "condition": "stauts = 'x'"}]},
                    {"name": "odd_output", "returns": "contact", "steps": [
                        {"type": "notify", "event": "x"}
                    ]}
                 ]}
            ]}"#,
        )
        .unwrap();
        EntityCatalog::new(doc).unwrap()
    }

    fn compile(name: &str) -> Result<ActionPlan, CompileError> {
        let cat = catalog();
        let entity = cat.entity("Contact").unwrap().clone();
        let action = entity.action(name).unwrap().clone();
        compile_action(&cat, &entity, &action, &CompileOptions::default())
    }

    #[test]
    fn test_create_plan() {
        let plan = compile("create_contact").unwrap();
        assert!(!plan.has_current);
        assert_eq!(plan.core_function, "crm.create_contact");
        assert_eq!(plan.app_function, "app.create_contact");
        assert_eq!(plan.descriptor.name, "createContact");
        assert_eq!(plan.descriptor.input_type, "CreateContactInput");
        assert_eq!(plan.input.fields[0].name, "email");
        assert_eq!(plan.success_message, "Contact created");
        assert!(matches!(plan.body.last(), Some(Op::Refresh { pk: Some(_), .. })));
        let primary = plan.impact.primary.as_ref().unwrap();
        assert_eq!(primary.fields, vec!["email".to_string()]);
    }

    #[test]
    fn test_transition_plan_has_prologue_and_guard() {
        let plan = compile("qualify_lead").unwrap();
        assert!(plan.has_current);
        assert!(matches!(&plan.body[0], Op::Resolve { dest, .. } if dest == "v_pk"));
        assert!(matches!(&plan.body[1], Op::Load { capture_before: true, .. }));
        match &plan.body[2] {
            Op::Guard { on_fail, .. } => {
                assert_eq!(on_fail.status.to_string(), "validation:permission_denied")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(plan.input.fields[0].name, "id");
        assert_eq!(plan.warnings.len(), 1, "{:?}", plan.warnings);
    }

    #[test]
    fn test_errors_carry_step_path() {
        let err = compile("broken").unwrap_err();
        assert_eq!(err.path.to_string(), "Contact.broken/steps[0]");
        assert!(matches!(err.kind, ErrorKind::UnknownField { .. }));

        let err = compile("odd_output").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::OutputTypeDivergence { .. }));
    }
}
