use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    bollard::{API_DEFAULT_VERSION, Docker},
    botbox_config::ProxyConfig,
    tokio::{process::Child, sync::Mutex},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    proxy::health::Relaunch,
    service::socket_exists,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const STARTUP_POLL: Duration = Duration::from_millis(200);
/// Replaced with the socket path in configured proxy args.
const SOCKET_PLACEHOLDER: &str = "{socket}";

pub(crate) fn connect(socket: &Path) -> Result<Docker> {
    let path = socket.to_string_lossy();
    Ok(Docker::connect_with_unix(
        &path,
        CONNECT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
    )?)
}

/// Starts and restarts the local proxy process serving the Docker API.
pub struct ProxyLauncher {
    binary: String,
    args: Vec<String>,
    socket: PathBuf,
    ping_timeout: Duration,
    startup_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ProxyLauncher {
    pub fn new(config: &ProxyConfig, data_root: &Path) -> Self {
        let socket = config.socket_path(data_root);
        let socket_str = socket.to_string_lossy();
        Self {
            binary: config.binary.clone(),
            args: config
                .args
                .iter()
                .map(|a| a.replace(SOCKET_PLACEHOLDER, &socket_str))
                .collect(),
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            socket,
            child: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn stop_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "proxy already exited");
        }
        if let Err(e) = child.wait().await {
            warn!(error = %e, "failed to reap proxy process");
        }
    }
}

#[async_trait]
impl Relaunch<Docker> for ProxyLauncher {
    async fn is_healthy(&self, client: &Docker) -> bool {
        if !socket_exists(&self.socket) {
            return false;
        }
        matches!(
            tokio::time::timeout(self.ping_timeout, client.ping()).await,
            Ok(Ok(_))
        )
    }

    async fn relaunch(&self) -> Result<Docker> {
        self.stop_child().await;
        match std::fs::remove_file(&self.socket) {
            Ok(()) => debug!(socket = %self.socket.display(), "removed stale proxy socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = self.socket.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(binary = %self.binary, socket = %self.socket.display(), "starting container proxy");
        let child = tokio::process::Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::ProxyUnavailable {
                message: format!("failed to spawn {}: {e}", self.binary),
            })?;
        *self.child.lock().await = Some(child);

        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if socket_exists(&self.socket) {
                let client = connect(&self.socket)?;
                if self.is_healthy(&client).await {
                    info!("container proxy ready");
                    return Ok(client);
                }
            }
            if Instant::now() >= deadline {
                self.stop_child().await;
                return Err(Error::ProxyUnavailable {
                    message: format!(
                        "{} did not answer on {} within {}s",
                        self.binary,
                        self.socket.display(),
                        self.startup_timeout.as_secs()
                    ),
                });
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_socket_placeholder() {
        let config = ProxyConfig {
            args: vec!["--socket".into(), "{socket}".into()],
            ..Default::default()
        };
        let launcher = ProxyLauncher::new(&config, Path::new("/srv/botbox"));
        assert_eq!(launcher.args, vec!["--socket", "/srv/botbox/proxy.sock"]);
        assert_eq!(launcher.socket(), Path::new("/srv/botbox/proxy.sock"));
    }

    #[tokio::test]
    async fn unreachable_socket_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::default();
        let launcher = ProxyLauncher::new(&config, dir.path());
        let client = connect(launcher.socket()).unwrap();
        assert!(!launcher.is_healthy(&client).await);
    }

    #[tokio::test]
    async fn relaunch_with_missing_binary_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            binary: "/nonexistent/botbox-proxy".into(),
            startup_timeout_secs: 1,
            ..Default::default()
        };
        let launcher = ProxyLauncher::new(&config, dir.path());
        assert!(matches!(
            launcher.relaunch().await.unwrap_err(),
            Error::ProxyUnavailable { .. }
        ));
    }
}
