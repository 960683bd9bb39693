use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::config::SINGLE_FILE_NAME;
use crate::ui;

#[derive(Debug, Serialize)]
struct GenerateSummary {
    actions: usize,
    files: Vec<String>,
    warnings: Vec<String>,
}

pub fn generate(
    config_path: &str,
    out: Option<&str>,
    single_file: bool,
    json: bool,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let catalog = config.load_catalog()?;

    let spinner = (!json).then(|| ui::create_spinner("Compiling actions..."));
    let compiled = super::compile(&config, &catalog);
    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }
    let output = match compiled {
        Ok(output) => output,
        Err(errors) => {
            super::check::report_errors(&errors, json)?;
            anyhow::bail!("{}", ui::plural(errors.len(), "compile error"));
        }
    };

    let out_dir = config.output_dir(out);
    let files = if single_file || config.output.single_file {
        let path = out_dir.join(SINGLE_FILE_NAME);
        write_file(&path, &output.to_sql())?;
        vec![path]
    } else {
        let files = output.files();
        let bar = (!json).then(|| ui::create_progress_bar(files.len() as u64, "Writing files"));
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let path = out_dir.join(&file.path);
            write_file(&path, &file.contents)?;
            if let Some(bar) = &bar {
                bar.inc(1);
            }
            written.push(path);
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        written
    };

    let warnings: Vec<String> = output
        .warnings()
        .into_iter()
        .map(|(action, w)| format!("{}: {}", action, w))
        .collect();

    if json {
        let summary = GenerateSummary {
            actions: output.plans().len(),
            files: files.iter().map(|p| p.display().to_string()).collect(),
            warnings,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for warning in &warnings {
        ui::print_warning(warning);
    }
    ui::print_success(&format!(
        "Generated {} into {}",
        ui::plural(output.plans().len(), "action"),
        out_dir.display().to_string().bold()
    ));
    ui::print_info(&ui::plural(files.len(), "file"));
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = contents.len(), "wrote file");
    Ok(())
}

/// Project layout used by the command tests: one spec and a config next to it.
#[cfg(test)]
pub(crate) fn write_project(dir: &Path, spec: &str) -> std::path::PathBuf {
    fs::create_dir_all(dir.join("specs")).unwrap();
    fs::write(dir.join("specs/crm.json"), spec).unwrap();
    let config = dir.join("specql.toml");
    fs::write(
        &config,
        "[project]\nname = \"crm\"\n\n[[specs]]\npath = \"specs/crm.json\"\n\n[output]\ndir = \"generated\"\n",
    )
    .unwrap();
    config
}

#[cfg(test)]
pub(crate) const CONTACT_SPEC: &str = r#"{"entities": [
    {"name": "Contact", "schema": "crm",
     "fields": [
        {"name": "email", "type": "email", "nullable": false},
        {"name": "status", "type": "enum(lead, qualified)", "default": "lead"}
     ],
     "actions": [
        {"name": "create_contact", "steps": [
            {"type": "insert", "entity": "Contact", "values": {"email": "$input.email"}}
        ]},
        {"name": "qualify_lead",
         "template": {"kind": "state_machine", "from_states": ["lead"], "to_state": "qualified"}}
     ]}
]}"#;
