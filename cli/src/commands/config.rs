use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::config::{discover_spec_files, SpecConfig, SpecqlConfig};
use crate::ui;

pub fn init(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);

    if path.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse a different path or remove the existing file.",
            path.display()
        );
    }

    ui::print_step("Initializing SpecQL project...");
    println!();
    ui::print_step("Scanning specs/ for spec documents...");
    let root = path.parent().filter(|p| !p.as_os_str().is_empty());
    let specs_dir = root.map_or_else(|| Path::new("specs").to_path_buf(), |r| r.join("specs"));
    let discovered = discover_spec_files(Some(&specs_dir))?;

    if discovered.is_empty() {
        println!("  {}", "No spec documents found.".yellow());
        println!("  Add entity specs as JSON under specs/ and list them in specql.toml.\n");
    } else {
        println!("  {} Found {}:", "✓".green(), ui::plural(discovered.len(), "spec document"));
        for spec in &discovered {
            println!("    {} {}", ui::symbols::BULLET.dimmed(), spec.display());
        }
        println!();
    }

    let project_name = prompt_project_name()?;
    let specs = discovered
        .iter()
        .map(|p| SpecConfig {
            path: root
                .and_then(|r| p.strip_prefix(r).ok())
                .unwrap_or(p)
                .display()
                .to_string(),
        })
        .collect();
    let config = SpecqlConfig::new(project_name, specs);
    write_config(path, &config)?;

    ui::print_success(&format!("Created {}", path.display()));
    println!();
    println!("{}", "Next steps:".bold());
    if config.specs.is_empty() {
        println!("  1. Write your entity specs under {}", "specs/".cyan());
        println!("  2. List them as [[specs]] entries in specql.toml");
        println!("  3. Generate SQL: {}", "specql generate".cyan());
    } else {
        println!("  {} to verify your configuration", "specql config validate".cyan());
        println!("  {} to compile every action", "specql check".cyan());
        println!("  {} to write the PL/pgSQL", "specql generate".cyan());
    }

    Ok(())
}

fn write_config(path: &Path, config: &SpecqlConfig) -> Result<()> {
    let config_toml = toml::to_string_pretty(config)?;
    fs::write(path, &config_toml)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

fn prompt_project_name() -> Result<String> {
    let default_name = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "my-project".to_string());

    print!("Project name [{}]: ", default_name.dimmed());
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    if input.is_empty() {
        Ok(default_name)
    } else {
        Ok(input.to_string())
    }
}

pub fn validate(config_path: &str) -> Result<()> {
    ui::print_step("Validating configuration...");

    let config = super::load_config(config_path)?;

    let missing: Vec<_> = config.spec_paths().into_iter().filter(|p| !p.exists()).collect();
    if !missing.is_empty() {
        for path in &missing {
            ui::print_error(&format!("Spec file not found: {}", path.display()));
        }
        anyhow::bail!("{} missing", ui::plural(missing.len(), "spec file"));
    }
    config.load_catalog()?;

    ui::print_success("Configuration is valid!");
    println!();
    println!("  Project: {}", config.project.name.bold());
    println!(
        "  Output: {}{}",
        config.output.dir,
        if config.output.single_file {
            " (single file)"
        } else {
            ""
        }
    );
    println!("  Max recorded batch errors: {}", config.compiler.max_errors);

    let overrides: Vec<_> = config.registry.entries().collect();
    if !overrides.is_empty() {
        println!("  Registry overrides:");
        for (entity, entry) in overrides {
            println!(
                "    {} {} → {}.{}",
                ui::symbols::BULLET.dimmed(),
                entity.bold(),
                entry.schema.as_deref().unwrap_or("<schema>"),
                entry.table.as_deref().unwrap_or("<table>")
            );
        }
    }

    println!();
    if config.specs.is_empty() {
        ui::print_warning("No specs defined");
        println!("  Add [[specs]] entries to specql.toml or run {}", "specql init".cyan());
    } else {
        println!("  {} Specs ({}):", ui::symbols::BULLET.dimmed(), config.specs.len());
        for spec in &config.specs {
            println!("    {} {}", ui::symbols::BULLET.dimmed(), spec.path);
        }
    }

    Ok(())
}
