//! Config schema types (runtime, containerd, proxy, storage, network, vm).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default image for new bot containers.
pub const DEFAULT_IMAGE: &str = "docker.io/library/debian:bookworm-slim";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotboxConfig {
    pub runtime: RuntimeConfig,
    pub containerd: ContainerdConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub vm: VmConfig,
}

/// Which container runtime backend drives bot containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// containerd when its socket exists, the proxy otherwise.
    #[default]
    Auto,
    Containerd,
    Proxy,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Containerd => f.write_str("containerd"),
            Self::Proxy => f.write_str("proxy"),
        }
    }
}

/// Settings shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    /// Image reference used when a bot container is first created.
    pub image: String,
    pub snapshotter: String,
    /// containerd namespace holding bot containers.
    pub namespace: String,
    /// Container IDs are `container_prefix + bot_id`.
    pub container_prefix: String,
    /// Grace period before a stopping task is killed.
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            image: DEFAULT_IMAGE.into(),
            snapshotter: "overlayfs".into(),
            namespace: "botbox".into(),
            container_prefix: "botbox-".into(),
            stop_timeout_secs: 10,
        }
    }
}

/// Native containerd backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerdConfig {
    /// containerd socket path.
    pub address: PathBuf,
    /// `ctr` binary name or path.
    pub ctr: String,
    /// Host-reachable socket for the gRPC API when `address` only exists
    /// inside the VM. Defaults to `address`.
    pub api_address: Option<PathBuf>,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            address: PathBuf::from("/run/containerd/containerd.sock"),
            ctr: "ctr".into(),
            api_address: None,
        }
    }
}

impl ContainerdConfig {
    #[must_use]
    pub fn api_socket(&self) -> &std::path::Path {
        self.api_address.as_deref().unwrap_or(&self.address)
    }
}

/// Daemon-proxied backend: a local proxy binary exposing a Docker-compatible
/// API on a unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub binary: String,
    pub args: Vec<String>,
    /// Socket the proxy listens on. Relative paths resolve against the data root.
    pub socket: PathBuf,
    pub ping_timeout_secs: u64,
    pub startup_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: "socktainer".into(),
            args: Vec::new(),
            socket: PathBuf::from("proxy.sock"),
            ping_timeout_secs: 3,
            startup_timeout_secs: 15,
        }
    }
}

/// Host-side persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Host data root; bot directories live under `<data_root>/bots/<id>`.
    pub data_root: PathBuf,
    /// Where the bot directory is bind-mounted inside the container.
    pub mount_path: String,
    /// Resolver file bound to `/etc/resolv.conf`. Auto-detected when unset.
    pub resolv_conf: Option<PathBuf>,
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/botbox"),
            mount_path: "/data".into(),
            resolv_conf: None,
            database_url: "sqlite:///var/lib/botbox/botbox.db?mode=rwc".into(),
        }
    }
}

/// CNI plugin locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bin_dirs: Vec<PathBuf>,
    pub conf_dir: PathBuf,
    /// Interface name created inside the container namespace.
    pub ifname: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bin_dirs: vec![PathBuf::from("/opt/cni/bin")],
            conf_dir: PathBuf::from("/etc/cni/net.d"),
            ifname: "eth0".into(),
        }
    }
}

/// Whether runtime calls are delegated into a Linux VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmMode {
    /// Delegate on macOS hosts only.
    #[default]
    Auto,
    On,
    Off,
}

/// VM delegation used on hosts without direct access to the runtime's
/// namespaces (macOS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub enabled: VmMode,
    /// Argv prefix that runs a command inside the VM.
    pub shell: Vec<String>,
    /// Privileged botbox binary inside the VM, used for `network` subcommands.
    pub cli: String,
    /// Prefix marking the VM tool's own diagnostic lines on stderr.
    pub error_prefix: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            enabled: VmMode::default(),
            shell: ["limactl", "shell", "default", "--"]
                .into_iter()
                .map(String::from)
                .collect(),
            cli: "/usr/local/bin/botbox".into(),
            error_prefix: "time=".into(),
        }
    }
}

impl VmConfig {
    /// Resolve `enabled` against the host OS.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match self.enabled {
            VmMode::On => true,
            VmMode::Off => false,
            VmMode::Auto => cfg!(target_os = "macos"),
        }
    }
}

impl ProxyConfig {
    /// Socket path with relative paths anchored at `data_root`.
    #[must_use]
    pub fn socket_path(&self, data_root: &std::path::Path) -> PathBuf {
        if self.socket.is_absolute() {
            self.socket.clone()
        } else {
            data_root.join(&self.socket)
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = BotboxConfig::default();
        assert_eq!(cfg.runtime.backend, BackendKind::Auto);
        assert_eq!(cfg.runtime.snapshotter, "overlayfs");
        assert_eq!(cfg.runtime.container_prefix, "botbox-");
        assert_eq!(cfg.storage.mount_path, "/data");
        assert_eq!(cfg.network.ifname, "eth0");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: BotboxConfig = toml::from_str(
            r#"
            [runtime]
            backend = "proxy"
            image = "alpine:3.20"

            [vm]
            enabled = "on"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.runtime.backend, BackendKind::Proxy);
        assert_eq!(cfg.runtime.image, "alpine:3.20");
        assert_eq!(cfg.runtime.namespace, "botbox");
        assert!(cfg.vm.is_active());
        assert_eq!(cfg.vm.shell[0], "limactl");
    }

    #[test]
    fn proxy_socket_relative_to_data_root() {
        let cfg = ProxyConfig::default();
        let root = std::path::Path::new("/srv/botbox");
        assert_eq!(cfg.socket_path(root), PathBuf::from("/srv/botbox/proxy.sock"));

        let abs = ProxyConfig {
            socket: PathBuf::from("/tmp/p.sock"),
            ..Default::default()
        };
        assert_eq!(abs.socket_path(root), PathBuf::from("/tmp/p.sock"));
    }
}
