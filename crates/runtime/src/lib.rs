//! Container runtime abstraction.
//!
//! Backends: native containerd (`ctr` plus the gRPC API), a supervised
//! Docker-API proxy, and an in-memory runtime for tests. Also hosts CNI
//! network attachment and host-side snapshot mounting.

pub mod containerd;
pub mod error;
pub mod memory;
pub mod mount;
pub mod network;
pub mod platform;
pub mod proxy;
pub mod service;
pub mod types;

use std::sync::Arc;

use {
    botbox_config::{BackendKind, BotboxConfig},
    tracing::info,
};

pub use {
    containerd::ContainerdRuntime,
    error::{Error, Result},
    memory::MemoryRuntime,
    mount::{MountedSnapshot, mount_container_snapshot, mount_snapshot},
    network::{CniNetwork, NetworkStrategy},
    platform::{HostPlatform, VmShell},
    proxy::{ProxyLauncher, ProxyRuntime, Relaunch, Supervisor},
    service::RuntimeService,
    types::*,
};

/// Build the configured runtime backend.
///
/// `auto` picks containerd when its socket is reachable (or runs inside the
/// VM) and falls back to the proxy.
pub fn create_runtime(config: &BotboxConfig) -> Result<Arc<dyn RuntimeService>> {
    let backend = match config.runtime.backend {
        BackendKind::Auto => auto_detect_backend(config),
        other => other,
    };
    info!(%backend, "runtime backend");
    match backend {
        BackendKind::Proxy => Ok(Arc::new(ProxyRuntime::new(config)?)),
        BackendKind::Containerd | BackendKind::Auto => Ok(Arc::new(ContainerdRuntime::new(config))),
    }
}

fn auto_detect_backend(config: &BotboxConfig) -> BackendKind {
    if config.vm.is_active() || service::socket_exists(&config.containerd.address) {
        BackendKind::Containerd
    } else {
        BackendKind::Proxy
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, botbox_config::VmMode, std::path::PathBuf};

    #[test]
    fn auto_without_socket_falls_back_to_proxy() {
        let mut config = BotboxConfig::default();
        config.containerd.address = PathBuf::from("/nonexistent/containerd.sock");
        config.vm.enabled = VmMode::Off;
        assert_eq!(auto_detect_backend(&config), BackendKind::Proxy);
    }

    #[test]
    fn auto_with_vm_uses_containerd() {
        let mut config = BotboxConfig::default();
        config.containerd.address = PathBuf::from("/nonexistent/containerd.sock");
        config.vm.enabled = VmMode::On;
        assert_eq!(auto_detect_backend(&config), BackendKind::Containerd);
    }

    #[tokio::test]
    async fn explicit_backend_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BotboxConfig::default();
        config.storage.data_root = dir.path().to_path_buf();

        config.runtime.backend = BackendKind::Containerd;
        assert_eq!(create_runtime(&config).unwrap().backend_name(), "containerd");

        config.runtime.backend = BackendKind::Proxy;
        assert_eq!(create_runtime(&config).unwrap().backend_name(), "proxy");
    }
}
