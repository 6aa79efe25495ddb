//! Console output for operators running the lifecycle commands.
//!
//! Logs go through `tracing`; these helpers are the human-facing progress view.

use colored::Colorize;

use crate::state::{Direction, RunState};

/// Print the run header.
pub fn print_banner(direction: Direction, dry_run: bool) {
    println!();
    let title = match direction {
        Direction::Shutdown => "Cluster shutdown",
        Direction::Start => "Cluster start",
    };
    if dry_run {
        println!("{} {}", title.cyan().bold(), "(dry run)".yellow());
    } else {
        println!("{}", title.cyan().bold());
    }
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a state transition.
pub fn print_state(state: RunState) {
    let marker = match state {
        RunState::Done => "✓".green().bold(),
        RunState::Aborted => "✗".red().bold(),
        _ => "▶".cyan(),
    };
    println!("{marker} {}", state.description().bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a check result line.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {item}", "•".bright_black());
}
