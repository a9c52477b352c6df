//! Semantic checks on a loaded configuration.
//!
//! Parsing already rejects malformed files; this catches values that parse but
//! cannot work (relative data roots, empty VM shells, and so on).

use crate::schema::{BackendKind, BotboxConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "storage.data_root"
    pub path: &'static str,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn error(&mut self, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path,
            message: message.into(),
        });
    }

    fn warn(&mut self, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            path,
            message: message.into(),
        });
    }
}

/// Validate a configuration.
#[must_use]
pub fn validate(config: &BotboxConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !config.storage.data_root.is_absolute() {
        result.error("storage.data_root", "must be an absolute path");
    }
    if !config.storage.mount_path.starts_with('/') {
        result.error("storage.mount_path", "must be an absolute container path");
    }
    if config.runtime.image.trim().is_empty() {
        result.error("runtime.image", "must not be empty");
    }
    if config.runtime.snapshotter.trim().is_empty() {
        result.error("runtime.snapshotter", "must not be empty");
    }
    if config.runtime.container_prefix.contains('/') {
        result.error("runtime.container_prefix", "must not contain '/'");
    }
    if config.runtime.stop_timeout_secs == 0 {
        result.warn(
            "runtime.stop_timeout_secs",
            "0 kills tasks immediately without a graceful stop",
        );
    }
    if config.vm.is_active() && config.vm.shell.is_empty() {
        result.error("vm.shell", "VM delegation is active but no shell command is set");
    }
    if config.runtime.backend == BackendKind::Proxy && config.proxy.binary.trim().is_empty() {
        result.error("proxy.binary", "proxy backend selected but no binary configured");
    }
    if config.network.bin_dirs.is_empty() {
        result.warn("network.bin_dirs", "no CNI plugin directories; networking will fail");
    }

    result
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::schema::{VmConfig, VmMode},
        std::path::PathBuf,
    };

    #[test]
    fn default_config_is_valid() {
        assert!(!validate(&BotboxConfig::default()).has_errors());
    }

    #[test]
    fn relative_data_root_is_error() {
        let mut cfg = BotboxConfig::default();
        cfg.storage.data_root = PathBuf::from("relative/dir");
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "storage.data_root");
    }

    #[test]
    fn active_vm_without_shell_is_error() {
        let cfg = BotboxConfig {
            vm: VmConfig {
                enabled: VmMode::On,
                shell: Vec::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(
            validate(&cfg)
                .diagnostics
                .iter()
                .any(|d| d.path == "vm.shell" && d.severity == Severity::Error)
        );
    }

    #[test]
    fn zero_stop_timeout_is_only_a_warning() {
        let mut cfg = BotboxConfig::default();
        cfg.runtime.stop_timeout_secs = 0;
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.diagnostics.len(), 1);
    }
}
