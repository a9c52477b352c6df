use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::BotboxConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["botbox.toml", "botbox.yaml", "botbox.yml", "botbox.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<BotboxConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&substitute_env(&raw), path)
}

/// Load an explicit config file, or discover one when `path` is `None`.
///
/// An explicit path that fails to load is an error; a discovered file that
/// fails to load falls back to defaults with a warning.
pub fn load_or_discover(path: Option<&Path>) -> anyhow::Result<BotboxConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(discover_and_load()),
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./botbox.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/botbox/botbox.{toml,yaml,yml,json}` (user-global)
///
/// Returns `BotboxConfig::default()` if no config file is found.
pub fn discover_and_load() -> BotboxConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return BotboxConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        BotboxConfig::default()
    })
}

/// Returns the user-global config directory (`~/.config/botbox/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "botbox").map(|d| d.config_dir().to_path_buf())
}

fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<BotboxConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::BackendKind};

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botbox.toml");
        std::fs::write(
            &path,
            "[runtime]\nbackend = \"containerd\"\n[storage]\nmount_path = \"/work\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.runtime.backend, BackendKind::Containerd);
        assert_eq!(cfg.storage.mount_path, "/work");
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("botbox.yaml");
        std::fs::write(&yaml, "runtime:\n  snapshotter: native\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().runtime.snapshotter, "native");

        let json = dir.path().join("botbox.json");
        std::fs::write(&json, r#"{"network":{"ifname":"veth0"}}"#).unwrap();
        assert_eq!(load_config(&json).unwrap().network.ifname, "veth0");
    }

    #[test]
    fn substitutes_env_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botbox.toml");
        std::fs::write(
            &path,
            "[storage]\ndata_root = \"${BOTBOX_UNSET_FOR_TEST:-/opt/botbox}\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.storage.data_root, PathBuf::from("/opt/botbox"));
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botbox.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn explicit_missing_path_is_error() {
        assert!(load_or_discover(Some(Path::new("/nonexistent/botbox.toml"))).is_err());
    }
}
