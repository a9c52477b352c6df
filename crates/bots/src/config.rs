//! Settings the bot manager needs, derived from the full config.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use botbox_config::BotboxConfig;

/// Resolver files tried in order when none is configured. The systemd one
/// lists the real upstream servers instead of the host-local stub.
const RESOLV_CANDIDATES: &[&str] = &["/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"];

const FALLBACK_RESOLV: &str = "nameserver 1.1.1.1\nnameserver 8.8.8.8\n";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub image: String,
    pub snapshotter: String,
    pub container_prefix: String,
    /// Host data root; bot directories live under `<data_root>/bots/<id>`.
    pub data_root: PathBuf,
    /// In-container path the bot directory is bound to.
    pub mount_path: String,
    pub resolv_conf: Option<PathBuf>,
    pub stop_timeout: Duration,
    /// Number of events returned when callers do not ask for a limit.
    pub default_event_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&BotboxConfig::default())
    }
}

impl From<&BotboxConfig> for ManagerConfig {
    fn from(cfg: &BotboxConfig) -> Self {
        Self {
            image: cfg.runtime.image.clone(),
            snapshotter: cfg.runtime.snapshotter.clone(),
            container_prefix: cfg.runtime.container_prefix.clone(),
            data_root: cfg.storage.data_root.clone(),
            mount_path: cfg.storage.mount_path.clone(),
            resolv_conf: cfg.storage.resolv_conf.clone(),
            stop_timeout: Duration::from_secs(cfg.runtime.stop_timeout_secs),
            default_event_limit: 50,
        }
    }
}

impl ManagerConfig {
    pub fn container_id(&self, bot_id: &str) -> String {
        format!("{}{bot_id}", self.container_prefix)
    }

    pub fn bot_dir(&self, bot_id: &str) -> PathBuf {
        self.data_root.join("bots").join(bot_id)
    }

    /// Host file bound to `/etc/resolv.conf` in bot containers.
    ///
    /// The configured path wins; otherwise the first existing system file.
    /// When the host has none, a public-resolver file is written under the
    /// data root.
    pub fn resolve_resolv_conf(&self) -> std::io::Result<PathBuf> {
        if let Some(path) = &self.resolv_conf {
            return Ok(path.clone());
        }
        if let Some(found) = RESOLV_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
        {
            return Ok(found.to_path_buf());
        }
        let fallback = self.data_root.join("resolv.conf");
        if !fallback.is_file() {
            std::fs::create_dir_all(&self.data_root)?;
            std::fs::write(&fallback, FALLBACK_RESOLV)?;
        }
        Ok(fallback)
    }
}
