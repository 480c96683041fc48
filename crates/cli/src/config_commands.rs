use std::path::Path;

use {anyhow::Result, clap::Subcommand};

use courier_config::{CourierConfig, Severity, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the effective configuration and report errors/warnings.
    Check,
    /// Print the effective configuration (after env overrides) as TOML.
    Show,
}

pub fn handle_config(action: ConfigAction, config: &CourierConfig, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check => check(config, path),
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &CourierConfig, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("Checking discovered configuration (defaults if none found).\n"),
    }

    let result = validate(config);
    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if !result.diagnostics.is_empty() {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}
