//! Function generator: compiles every action of a catalog and renders the
//! complete PL/pgSQL output.

use crate::error::{CompileError, CompileErrors, ErrorKind, StepPath};
use crate::ir::TableRef;
use crate::orchestrator::{compile_action, ActionPlan, CompileOptions};
use crate::plpgsql;
use crate::vm::PlanSet;
use serde_json::{json, Value};
use specql_model::EntityCatalog;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Emit the shared schema objects (result type, audit and outbox tables).
    pub emit_base: bool,
    /// Emit `<entity>_pk`, `<entity>_id` and `<entity>_identifier` helpers.
    pub emit_helpers: bool,
    pub default_max_errors: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            emit_base: true,
            emit_helpers: true,
            default_max_errors: CompileOptions::default().default_max_errors,
        }
    }
}

/// One generated file, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
}

pub struct FunctionGenerator<'c> {
    catalog: &'c EntityCatalog,
    config: GeneratorConfig,
}

impl<'c> FunctionGenerator<'c> {
    pub fn new(catalog: &'c EntityCatalog) -> Self {
        Self::with_config(catalog, GeneratorConfig::default())
    }

    pub fn with_config(catalog: &'c EntityCatalog, config: GeneratorConfig) -> Self {
        Self { catalog, config }
    }

    /// Compile every action in declaration order. All failures are collected
    /// before the run fails.
    pub fn generate(&self) -> Result<GenerationOutput, CompileErrors> {
        let options = CompileOptions {
            default_max_errors: self.config.default_max_errors,
        };
        let mut plans = Vec::new();
        let mut errors = Vec::new();
        let mut owners: HashMap<String, String> = HashMap::new();

        for entity in self.catalog.entities() {
            for action in &entity.actions {
                match compile_action(self.catalog, entity, action, &options) {
                    Ok(plan) => {
                        if let Some(first) =
                            owners.insert(plan.app_function.clone(), plan.qualified_name())
                        {
                            tracing::debug!(function = %plan.app_function, first = %first, "duplicate function");
                            errors.push(CompileError {
                                path: StepPath::new(entity.name.clone(), action.name.clone()),
                                kind: ErrorKind::DuplicateFunction {
                                    name: plan.app_function.clone(),
                                },
                            });
                            continue;
                        }
                        tracing::info!(
                            function = %plan.core_function,
                            ops = plan.body.len(),
                            warnings = plan.warnings.len(),
                            "generated action"
                        );
                        plans.push(plan);
                    }
                    Err(err) => errors.push(err),
                }
            }
        }

        if !errors.is_empty() {
            return Err(CompileErrors(errors));
        }
        let tables = self
            .catalog
            .entities()
            .iter()
            .map(|e| TableRef::new(self.catalog, e))
            .collect();
        Ok(GenerationOutput {
            config: self.config,
            tables,
            plans,
        })
    }
}

/// Compiled plans of a successful run, with everything needed to render them.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    config: GeneratorConfig,
    tables: Vec<TableRef>,
    plans: Vec<ActionPlan>,
}

const HEADER: &str = "-- Generated by specql. Do not edit.";

impl GenerationOutput {
    pub fn plans(&self) -> &[ActionPlan] {
        &self.plans
    }

    /// Plans indexed for the executor.
    pub fn plan_set(&self) -> PlanSet {
        PlanSet::new(self.plans.clone())
    }

    pub fn warnings(&self) -> Vec<(String, &str)> {
        self.plans
            .iter()
            .flat_map(|p| p.warnings.iter().map(move |w| (p.qualified_name(), w.as_str())))
            .collect()
    }

    fn render_base(&self) -> String {
        let mut sections = Vec::new();
        if self.config.emit_base {
            sections.push(plpgsql::render_base());
        }
        if self.config.emit_helpers {
            sections.extend(self.tables.iter().map(plpgsql::render_helpers));
        }
        sections.join("\n")
    }

    fn render_plan(plan: &ActionPlan) -> String {
        [
            format!("-- {}", plan.qualified_name()),
            format!("-- fingerprint: sha256:{}", plan.fingerprint),
            String::new(),
            plpgsql::render_input_type(&plan.input),
            plpgsql::render_core_function(plan),
            plpgsql::render_app_wrapper(plan),
        ]
        .join("\n")
    }

    /// Everything in one script.
    pub fn to_sql(&self) -> String {
        let mut out = String::from(HEADER);
        out.push_str("\n\n");
        let base = self.render_base();
        if !base.is_empty() {
            out.push_str(&base);
            out.push('\n');
        }
        for plan in &self.plans {
            out.push_str(&Self::render_plan(plan));
            out.push('\n');
        }
        out
    }

    /// One file for the shared objects and one per action.
    pub fn files(&self) -> Vec<GeneratedFile> {
        let mut files = Vec::new();
        let base = self.render_base();
        if !base.is_empty() {
            files.push(GeneratedFile {
                path: "000_base.sql".to_string(),
                contents: format!("{}\n\n{}", HEADER, base),
            });
        }
        for plan in &self.plans {
            files.push(GeneratedFile {
                path: format!("{}/{}.sql", plan.table.schema, plan.action),
                contents: format!("{}\n\n{}", HEADER, Self::render_plan(plan)),
            });
        }
        files
    }

    /// Impact metadata and mutation descriptor of every action.
    pub fn impact_json(&self) -> Value {
        Value::Array(
            self.plans
                .iter()
                .map(|plan| {
                    json!({
                        "entity": plan.entity,
                        "action": plan.action,
                        "fingerprint": plan.fingerprint,
                        "mutation": plan.descriptor,
                        "warnings": plan.warnings,
                    })
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_model::parse::parse_spec_content;

    fn catalog(json: &str) -> EntityCatalog {
        EntityCatalog::new(parse_spec_content(json).unwrap()).unwrap()
    }

    const CONTACTS: &str = r#"{"entities": [
        {"name": "Contact", "schema": "crm",
         "fields": [{"name": "email", "type": "email", "nullable": false}],
         "actions": [
            {"name": "create_contact", "steps": [
                {"type": "insert", "entity": "Contact", "values": {"email": "$input.email"}}
            ]}
         ]}
    ]}"#;

    #[test]
    fn test_output_is_deterministic() {
        let cat = catalog(CONTACTS);
        let a = FunctionGenerator::new(&cat).generate().unwrap().to_sql();
        let b = FunctionGenerator::new(&cat).generate().unwrap().to_sql();
        assert_eq!(a, b);
        assert!(a.starts_with(HEADER));
        assert!(a.contains("-- Contact.create_contact"));
        assert!(a.contains("-- fingerprint: sha256:"));
    }

    #[test]
    fn test_files_split_base_and_actions() {
        let cat = catalog(CONTACTS);
        let output = FunctionGenerator::new(&cat).generate().unwrap();
        let files = output.files();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["000_base.sql", "crm/create_contact.sql"]);

        let bare = FunctionGenerator::with_config(
            &cat,
            GeneratorConfig {
                emit_base: false,
                emit_helpers: false,
                ..GeneratorConfig::default()
            },
        )
        .generate()
        .unwrap();
        assert_eq!(bare.files().len(), 1);
        let sql = bare.to_sql();
        assert!(!sql.contains("CREATE TABLE IF NOT EXISTS app.tb_mutation_audit"));
        assert!(sql.contains("INSERT INTO app.tb_mutation_audit ("));
    }

    #[test]
    fn test_errors_are_collected() {
        let cat = catalog(
            r#"{"entities": [
                {"name": "A", "fields": [{"name": "x", "type": "text"}], "actions": [
                    {"name": "touch", "steps": [{"type": "validate", "condition": "nope = 1"}]},
                    {"name": "other", "steps": [{"type": "call", "action": "missing"}]}
                ]},
                {"name": "B", "fields": [{"name": "x", "type": "text"}], "actions": [
                    {"name": "ping", "steps": [{"type": "notify", "event": "ping"}]}
                ]},
                {"name": "C", "fields": [{"name": "x", "type": "text"}], "actions": [
                    {"name": "ping", "steps": [{"type": "notify", "event": "ping"}]}
                ]}
            ]}"#,
        );
        let errors = FunctionGenerator::new(&cat).generate().unwrap_err();
        assert_eq!(errors.len(), 3, "{}", errors);
        assert!(matches!(errors.0[2].kind, ErrorKind::DuplicateFunction { .. }));
        assert_eq!(errors.0[2].path.to_string(), "C.ping");
    }
}
