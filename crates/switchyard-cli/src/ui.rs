//! Terminal output helpers.

use colored::Colorize;

pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Error with a suggested fix on the next line.
pub fn error_with_fix(msg: &str, fix: &str) {
    error(msg);
    eprintln!("    {} {}", "fix:".yellow(), fix);
}

pub fn section(title: &str) {
    println!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("    {:<14}{}", format!("{label}:").dimmed(), value);
}

pub fn hint(msg: &str) {
    println!("  {}", msg.dimmed());
}

pub fn blank() {
    println!();
}
