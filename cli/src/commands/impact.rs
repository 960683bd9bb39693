use anyhow::{Context, Result};
use colored::Colorize;
use specql_model::{ImpactEntry, Operation};
use std::fs;

use crate::ui;

/// Print (or write) the impact metadata and mutation descriptor of every
/// action.
pub fn impact(config_path: &str, output_path: Option<&str>, json: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let catalog = config.load_catalog()?;
    let output = match super::compile(&config, &catalog) {
        Ok(output) => output,
        Err(errors) => {
            super::check::report_errors(&errors, json)?;
            anyhow::bail!("{}", ui::plural(errors.len(), "compile error"));
        }
    };

    let document = serde_json::to_string_pretty(&output.impact_json())?;
    if let Some(path) = output_path {
        fs::write(path, &document).with_context(|| format!("Failed to write {}", path))?;
        if !json {
            ui::print_success(&format!("Wrote impact metadata to {}", path.bold()));
        }
        return Ok(());
    }
    if json {
        println!("{}", document);
        return Ok(());
    }

    for plan in output.plans() {
        ui::print_section(&format!(
            "{} {}",
            plan.qualified_name(),
            format!("→ {}", plan.descriptor.name).dimmed()
        ));
        match &plan.impact.primary {
            Some(primary) => print_entry(primary, "primary"),
            None => ui::print_info("no writes"),
        }
        for effect in &plan.impact.side_effects {
            print_entry(effect, "side effect");
        }
        for cache in &plan.impact.cache_invalidations {
            ui::print_info(&format!("invalidates {} ({})", cache.query, cache.strategy));
        }
        for warning in &plan.warnings {
            ui::print_warning(warning);
        }
    }
    Ok(())
}

fn print_entry(entry: &ImpactEntry, role: &str) {
    let symbol = match entry.operation {
        Operation::Create => ui::symbols::PLUS.green(),
        Operation::Update => ui::symbols::TILDE.yellow(),
        Operation::Delete => ui::symbols::MINUS.red(),
    };
    let fields = if entry.fields.is_empty() {
        String::new()
    } else {
        format!(" [{}]", entry.fields.join(", "))
    };
    println!(
        "  {} {} {}{} {}",
        symbol,
        entry.operation,
        entry.entity.bold(),
        fields,
        format!("({})", role).dimmed()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::generate::{write_project, CONTACT_SPEC};

    #[test]
    fn test_impact_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_project(dir.path(), CONTACT_SPEC);
        let out = dir.path().join("impact.json");
        impact(config.to_str().unwrap(), out.to_str(), true).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["action"], "create_contact");
        assert_eq!(entries[1]["mutation"]["name"], "qualifyLead");
    }
}
