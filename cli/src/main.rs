//! # specql-cli
//!
//! Command-line tool for compiling SpecQL entity actions into PL/pgSQL.
//!
//! ## Commands
//!
//! - `specql init` - Create `specql.toml`
//! - `specql check` - Compile every action, report errors and warnings
//! - `specql generate` - Write the generated SQL
//! - `specql impact` - Print impact metadata and mutation descriptors
//! - `specql run <function>` - Execute an action against an in-memory store
//! - `specql config validate` - Validate the configuration file
//!
//! See `specql --help` for the full command reference.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use std::io;
use std::process;

mod commands;
mod config;
mod telemetry;
mod ui;

#[derive(Parser)]
#[command(name = "specql")]
#[command(about = "SpecQL CLI - Compile entity actions into PL/pgSQL", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to specql.toml configuration file
    #[arg(short, long, global = true, default_value = "specql.toml", env = "SPECQL_CONFIG")]
    config: String,

    /// Output as JSON (machine-readable format)
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new SpecQL project (auto-detects specs/*.json)
    Init,

    /// Compile every action without writing files
    Check,

    /// Generate PL/pgSQL for every action
    Generate {
        /// Output directory (overrides config)
        #[arg(short, long)]
        out: Option<String>,

        /// Write one script instead of one file per action
        #[arg(long)]
        single_file: bool,
    },

    /// Show what each action writes
    Impact {
        /// Write the impact JSON to a file instead of printing it
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Execute an action against an empty in-memory store
    Run {
        /// Function to call, e.g. app.create_contact or Contact.create_contact
        function: String,

        /// JSON input payload
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// JSON file of rows to load first, keyed by entity name
        #[arg(long)]
        seed: Option<String>,
    },

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Validate the configuration file
    Validate,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "specql", &mut io::stdout());
        return;
    }

    if let Err(e) = telemetry::init(telemetry::LogConfig {
        verbose: cli.verbose,
    }) {
        eprintln!("{} {}", "Warning:".yellow().bold(), e);
    }

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Init => commands::config::init(&cli.config),
        Commands::Check => commands::check::check(&cli.config, cli.json),
        Commands::Generate { out, single_file } => {
            commands::generate::generate(&cli.config, out.as_deref(), single_file, cli.json)
        }
        Commands::Impact { output } => {
            commands::impact::impact(&cli.config, output.as_deref(), cli.json)
        }
        Commands::Run {
            function,
            payload,
            seed,
        } => commands::run::run(&cli.config, &function, &payload, seed.as_deref(), cli.json),
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Validate => commands::config::validate(&cli.config),
        },
    }
}
