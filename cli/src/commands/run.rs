use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use specql_compiler::ir::TableRef;
use specql_compiler::{CallContext, MemoryStore, MutationResult, Vm};
use specql_model::EntityCatalog;
use std::fs;
use uuid::Uuid;

use crate::ui;

/// Execute one action against a fresh in-memory store, optionally seeded
/// from a JSON file of `{"Entity": [row, ...]}`.
pub fn run(
    config_path: &str,
    function: &str,
    payload: &str,
    seed: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let catalog = config.load_catalog()?;
    let output = match super::compile(&config, &catalog) {
        Ok(output) => output,
        Err(errors) => {
            super::check::report_errors(&errors, json)?;
            anyhow::bail!("{}", ui::plural(errors.len(), "compile error"));
        }
    };
    let plans = output.plan_set();

    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let ctx = CallContext::new(Uuid::new_v4(), Uuid::new_v4());
    let mut store = MemoryStore::from_catalog(&catalog);
    if let Some(path) = seed {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read seed file: {}", path))?;
        let rows: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse seed file: {}", path))?;
        let seeded = seed_store(&mut store, &catalog, ctx.tenant_id, rows)?;
        tracing::debug!(rows = seeded, "seeded store");
    }

    let result = Vm::new(&plans).execute(&mut store, function, ctx, payload)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    print_result(&result)
}

fn seed_store(
    store: &mut MemoryStore,
    catalog: &EntityCatalog,
    tenant_id: Uuid,
    rows: Value,
) -> Result<usize> {
    let Value::Object(by_entity) = rows else {
        anyhow::bail!("Seed file must be an object keyed by entity name");
    };
    let mut count = 0;
    for (name, rows) in by_entity {
        let entity = catalog.entity(&name)?;
        let table = TableRef::new(catalog, entity);
        let Value::Array(rows) = rows else {
            anyhow::bail!("Seed rows for {} must be an array", name);
        };
        for row in rows {
            store.seed(&table, tenant_id, row);
            count += 1;
        }
    }
    Ok(count)
}

fn print_result(result: &MutationResult) -> Result<()> {
    println!(
        "{} {} {}",
        ui::symbols::ARROW.blue().bold(),
        result.mutation_type.bold(),
        ui::format_status(&result.mutation_status)
    );
    if let Some(message) = &result.message {
        ui::print_info(message);
    }
    if let Some(id) = result.entity_id {
        println!("  {}: {}", "entity_id".dimmed(), id);
    }
    if !result.updated_fields.is_empty() {
        println!(
            "  {}: {}",
            "updated_fields".dimmed(),
            result.updated_fields.join(", ")
        );
    }
    if let Some(after) = &result.payload_after {
        println!("  {}:", "payload_after".dimmed());
        println!("{}", indent(&serde_json::to_string_pretty(after)?));
    }
    Ok(())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::generate::{write_project, CONTACT_SPEC};
    use specql_model::parse::parse_spec_content;

    #[test]
    fn test_seed_store_by_entity() {
        let catalog = EntityCatalog::new(parse_spec_content(CONTACT_SPEC).unwrap()).unwrap();
        let mut store = MemoryStore::from_catalog(&catalog);
        let rows = serde_json::json!({
            "Contact": [{"email": "ada@example.com"}, {"email": "grace@example.com"}]
        });
        let seeded = seed_store(&mut store, &catalog, Uuid::new_v4(), rows).unwrap();
        assert_eq!(seeded, 2);
        assert_eq!(store.rows("crm.tb_contact").len(), 2);

        let err = seed_store(
            &mut store,
            &catalog,
            Uuid::new_v4(),
            serde_json::json!({"Contcat": []}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Contact"));
    }

    #[test]
    fn test_run_executes_action() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_project(dir.path(), CONTACT_SPEC);
        run(
            config.to_str().unwrap(),
            "app.create_contact",
            r#"{"email": "ada@example.com"}"#,
            None,
            true,
        )
        .unwrap();

        let err = run(config.to_str().unwrap(), "app.missing", "{}", None, true).unwrap_err();
        assert!(err.to_string().contains("app.missing"));
    }
}
