//! Tracing initialization for the CLI.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub verbose: bool,
}

impl LogConfig {
    /// `RUST_LOG` wins; otherwise `--verbose` raises the specql crates to
    /// debug and everything else stays at warn.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if self.verbose {
                EnvFilter::new("warn,specql_model=debug,specql_compiler=debug,specql=debug")
            } else {
                EnvFilter::new("warn")
            }
        })
    }
}

pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.verbose);

    tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
