//! Terminal output for the CLI.

use std::fmt::Display;

use colored::*;
use terminal_size::{terminal_size, Width};

const LABEL_WIDTH: usize = 14;

fn rule() -> ColoredString {
    let width = terminal_size().map(|(Width(w), _)| w as usize).unwrap_or(80);
    "─".repeat(width.min(100)).black().bold()
}

/// Banner with the crate version and a subtitle for the current command.
pub fn print_header(subtitle: &str) {
    println!("{}", rule());
    println!(
        "  ✎ {} {}",
        "Scribe".yellow().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).black().bold()
    );
    println!("  {}", subtitle.cyan());
    println!("{}", rule());
}

pub fn print_step(msg: &str) {
    println!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("  {} {}", "!".yellow().bold(), msg.yellow());
}

pub fn print_thinking(msg: &str) {
    println!("  {} {}...", "∴".magenta(), msg);
}

/// Aligned `label: value` row.
pub fn print_field(label: &str, value: impl Display) {
    let label = format!("{label}:");
    println!("  {:<width$} {}", label.bold(), value, width = LABEL_WIDTH);
}

/// Render a secret as set / not set without echoing it.
pub fn presence(value: &str) -> ColoredString {
    if value.is_empty() {
        "not set".red()
    } else {
        "set".green()
    }
}
