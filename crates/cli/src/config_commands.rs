use std::process::ExitCode;

use {
    anyhow::Result,
    botbox_config::{BackendKind, BotboxConfig, Severity, validate},
    clap::{Subcommand, ValueEnum},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the loaded configuration and report errors/warnings.
    Check,
    /// Print the effective configuration.
    Show {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Toml,
    Json,
}

pub fn handle_config(config: &BotboxConfig, action: ConfigAction) -> Result<ExitCode> {
    match action {
        ConfigAction::Check => check(config),
        ConfigAction::Show { format } => {
            let rendered = match format {
                Format::Toml => toml::to_string_pretty(config)?,
                Format::Json => serde_json::to_string_pretty(config)?,
            };
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &BotboxConfig) -> Result<ExitCode> {
    let result = validate(config);

    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let missing = missing_binaries(config);
    for (path, program) in &missing {
        eprintln!("  {BOLD}{YELLOW}warning{RESET} {path}: `{program}` not found on PATH");
    }

    let errors = count(&result.diagnostics, Severity::Error);
    let warnings = count(&result.diagnostics, Severity::Warning) + missing.len();

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("\n{errors} error(s), {warnings} warning(s)");
    }

    if result.has_errors() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Host binaries the configured backend will invoke directly.
fn required_binaries(config: &BotboxConfig) -> Vec<(&'static str, &str)> {
    let mut out = Vec::new();
    if config.vm.is_active() {
        // ctr and the CNI plugins run inside the VM.
        if let Some(shell) = config.vm.shell.first() {
            out.push(("vm.shell", shell.as_str()));
        }
    } else if config.runtime.backend != BackendKind::Proxy {
        out.push(("containerd.ctr", config.containerd.ctr.as_str()));
    }
    if config.runtime.backend != BackendKind::Containerd {
        out.push(("proxy.binary", config.proxy.binary.as_str()));
    }
    out
}

fn missing_binaries(config: &BotboxConfig) -> Vec<(&'static str, String)> {
    required_binaries(config)
        .into_iter()
        .filter(|(_, program)| which::which(program).is_err())
        .map(|(path, program)| (path, program.to_string()))
        .collect()
}

fn count(diagnostics: &[botbox_config::Diagnostic], severity: Severity) -> usize {
    diagnostics.iter().filter(|d| d.severity == severity).count()
}
