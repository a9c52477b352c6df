//! Configuration loading, validation and env substitution.
//!
//! Config files: `botbox.toml`, `botbox.yaml`, or `botbox.json`
//! Searched in `./` then `~/.config/botbox/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, load_config, load_or_discover},
    schema::{
        BackendKind, BotboxConfig, ContainerdConfig, NetworkConfig, ProxyConfig, RuntimeConfig,
        StorageConfig, VmConfig, VmMode,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
