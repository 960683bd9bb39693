//! Shared terminal output helpers.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use specql_compiler::MutationStatus;
use std::time::Duration;

/// Symbols used throughout the CLI.
pub mod symbols {
    pub const ARROW: &str = "→";
    pub const SUCCESS: &str = "✓";
    pub const FAILURE: &str = "✗";
    pub const WARNING: &str = "!";
    pub const BULLET: &str = "•";
    pub const PLUS: &str = "+";
    pub const MINUS: &str = "-";
    pub const TILDE: &str = "~";
}

pub fn print_step(message: &str) {
    println!("{} {}", symbols::ARROW.blue().bold(), message);
}

pub fn print_success(message: &str) {
    println!("{} {}", symbols::SUCCESS.green().bold(), message);
}

pub fn print_error(message: &str) {
    println!("{} {}", symbols::FAILURE.red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", symbols::WARNING.yellow().bold(), message);
}

/// Print a dimmed info line (indented).
pub fn print_info(message: &str) {
    println!("  {}", message.dimmed());
}

pub fn print_section(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(50).dimmed());
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Progress bar for writing `total` generated files.
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.blue} [{bar:30.green/dim}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("█░░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(message.to_string());
    bar
}

/// Color a mutation status the way the result would be read: success green,
/// noop dimmed, partial yellow, failures red.
pub fn format_status(status: &MutationStatus) -> String {
    let text = status.to_string();
    match status {
        MutationStatus::Success => text.green().to_string(),
        MutationStatus::Noop(_) => text.dimmed().to_string(),
        MutationStatus::Partial(_) => text.yellow().to_string(),
        MutationStatus::Validation(_) | MutationStatus::Failed(_) => text.red().to_string(),
    }
}

/// Pluralize `word` for `count`.
pub fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{} {}", count, word)
    } else {
        format!("{} {}s", count, word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plural() {
        assert_eq!(plural(1, "action"), "1 action");
        assert_eq!(plural(0, "warning"), "0 warnings");
        assert_eq!(plural(3, "file"), "3 files");
    }
}
