pub mod check;
pub mod config;
pub mod generate;
pub mod impact;
pub mod run;

use crate::config::SpecqlConfig;
use anyhow::{Context, Result};
use specql_compiler::{CompileErrors, FunctionGenerator, GenerationOutput, GeneratorConfig};
use specql_model::EntityCatalog;

pub(crate) fn load_config(config_path: &str) -> Result<SpecqlConfig> {
    SpecqlConfig::load(config_path)
        .context("Failed to load configuration. Run `specql init` to create a configuration file.")
}

pub(crate) fn compile(
    config: &SpecqlConfig,
    catalog: &EntityCatalog,
) -> Result<GenerationOutput, CompileErrors> {
    FunctionGenerator::with_config(
        catalog,
        GeneratorConfig {
            default_max_errors: config.compiler.max_errors,
            ..GeneratorConfig::default()
        },
    )
    .generate()
}
