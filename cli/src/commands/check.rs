use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use specql_compiler::CompileErrors;

use crate::ui;

/// Compile every action without writing anything.
pub fn check(config_path: &str, json: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let catalog = config.load_catalog()?;

    let output = match super::compile(&config, &catalog) {
        Ok(output) => output,
        Err(errors) => {
            report_errors(&errors, json)?;
            anyhow::bail!("{}", ui::plural(errors.len(), "compile error"));
        }
    };

    let warnings = output.warnings();
    if json {
        let report = json!({
            "ok": true,
            "actions": output.plans().iter().map(|p| p.qualified_name()).collect::<Vec<_>>(),
            "warnings": warnings
                .iter()
                .map(|(action, w)| json!({"action": action, "message": w}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    ui::print_section("Actions");
    for plan in output.plans() {
        println!(
            "  {} {} {}",
            ui::symbols::SUCCESS.green(),
            plan.qualified_name().bold(),
            format!("({})", plan.core_function).dimmed()
        );
    }
    if !warnings.is_empty() {
        ui::print_section("Warnings");
        for (action, warning) in &warnings {
            ui::print_warning(&format!("{}: {}", action, warning));
        }
    }
    println!();
    ui::print_success(&format!(
        "{} compiled, {}",
        ui::plural(output.plans().len(), "action"),
        ui::plural(warnings.len(), "warning")
    ));
    Ok(())
}

pub(crate) fn report_errors(errors: &CompileErrors, json: bool) -> Result<()> {
    if json {
        let report = json!({
            "ok": false,
            "errors": errors
                .iter()
                .map(|e| json!({"path": e.path.to_string(), "message": e.kind.to_string()}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    ui::print_section("Compile errors");
    for error in errors.iter() {
        ui::print_error(&format!("{}: {}", error.path.to_string().bold(), error.kind));
    }
    Ok(())
}
