//! Container networking through CNI plugins.
//!
//! Plugins are executed directly following the CNI protocol: the network
//! configuration goes in on stdin, parameters in `CNI_*` environment
//! variables, and the result (or error object) comes back on stdout.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use {
    botbox_config::NetworkConfig,
    serde::Deserialize,
    serde_json::{Map, Value},
    tokio::{io::AsyncWriteExt, process::Command},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use botbox_metrics::{counter, runtime as runtime_metrics};

use crate::{
    error::{Context, Error, Result},
    platform::VmShell,
};

const CONF_EXTENSIONS: &[&str] = &["conflist", "conf", "json"];

/// How a running task gets attached to the network.
#[derive(Debug, Clone)]
pub enum NetworkStrategy {
    /// Invoke CNI plugins against `/proc/<pid>/ns/net` on this host.
    Cni(CniNetwork),
    /// Ask the privileged botbox CLI inside the VM to do it.
    Vm(VmShell),
}

impl NetworkStrategy {
    /// Attach `container_id`, clearing a stale IP allocation and retrying
    /// once when IPAM reports a duplicate.
    pub async fn setup(&self, container_id: &str, pid: Option<u32>) -> Result<()> {
        match self.attach(container_id, pid).await {
            Err(e) if e.is_duplicate_allocation() => {
                warn!(container_id, error = %e, "stale network allocation, removing and retrying");
                #[cfg(feature = "metrics")]
                counter!(runtime_metrics::NETWORK_SETUP_RETRIES_TOTAL).increment(1);
                if let Err(remove_err) = self.detach(container_id, pid).await {
                    debug!(container_id, error = %remove_err, "cleanup before retry failed");
                }
                self.attach(container_id, pid).await
            },
            other => other,
        }
    }

    pub async fn remove(&self, container_id: &str, pid: Option<u32>) -> Result<()> {
        self.detach(container_id, pid).await
    }

    async fn attach(&self, container_id: &str, pid: Option<u32>) -> Result<()> {
        match self {
            Self::Cni(cni) => {
                let Some(pid) = pid else {
                    return Err(Error::network(format!(
                        "container {container_id} has no running task"
                    )));
                };
                cni.add(container_id, &netns_path(pid)).await
            },
            Self::Vm(vm) => vm
                .run_cli(["network", "setup", container_id])
                .await
                .map(|_| ()),
        }
    }

    async fn detach(&self, container_id: &str, pid: Option<u32>) -> Result<()> {
        match self {
            Self::Cni(cni) => {
                let netns = pid.map(netns_path).unwrap_or_default();
                cni.del(container_id, &netns).await
            },
            Self::Vm(vm) => vm
                .run_cli(["network", "remove", container_id])
                .await
                .map(|_| ()),
        }
    }
}

fn netns_path(pid: u32) -> String {
    format!("/proc/{pid}/ns/net")
}

/// A CNI plugin chain loaded from the configuration directory.
#[derive(Debug, Clone)]
pub struct CniNetwork {
    bin_dirs: Vec<PathBuf>,
    conf_dir: PathBuf,
    ifname: String,
}

#[derive(Debug, Clone)]
struct NetworkList {
    cni_version: String,
    name: String,
    plugins: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

impl CniNetwork {
    #[must_use]
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            bin_dirs: config.bin_dirs.clone(),
            conf_dir: config.conf_dir.clone(),
            ifname: config.ifname.clone(),
        }
    }

    pub async fn add(&self, container_id: &str, netns: &str) -> Result<()> {
        let list = self.load_list()?;
        let mut prev: Option<Value> = None;
        for plugin in &list.plugins {
            let stdout = self
                .invoke(&list, plugin, "ADD", container_id, netns, prev.as_ref())
                .await?;
            if !stdout.trim().is_empty() {
                prev = Some(serde_json::from_str(&stdout)?);
            }
        }
        info!(container_id, network = %list.name, "network attached");
        Ok(())
    }

    /// Run DEL on every plugin in reverse order. All plugins are attempted;
    /// the first failure is returned.
    pub async fn del(&self, container_id: &str, netns: &str) -> Result<()> {
        let list = self.load_list()?;
        let mut first_err = None;
        for plugin in list.plugins.iter().rev() {
            if let Err(e) = self
                .invoke(&list, plugin, "DEL", container_id, netns, None)
                .await
            {
                warn!(container_id, error = %e, "network plugin DEL failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(container_id, network = %list.name, "network removed");
                Ok(())
            },
        }
    }

    fn load_list(&self) -> Result<NetworkList> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.conf_dir)
            .map_err(|e| {
                Error::network(format!("read {}: {e}", self.conf_dir.display()))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| CONF_EXTENSIONS.contains(&e))
            })
            .collect();
        candidates.sort();
        let Some(path) = candidates.first() else {
            return Err(Error::network(format!(
                "no network configuration in {}",
                self.conf_dir.display()
            )));
        };
        parse_network_list(path)
    }

    async fn invoke(
        &self,
        list: &NetworkList,
        plugin: &Map<String, Value>,
        command: &str,
        container_id: &str,
        netns: &str,
        prev_result: Option<&Value>,
    ) -> Result<String> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::network("plugin entry has no type"))?;
        let binary = self.find_plugin(plugin_type)?;

        let mut conf = plugin.clone();
        conf.insert("cniVersion".into(), Value::String(list.cni_version.clone()));
        conf.insert("name".into(), Value::String(list.name.clone()));
        if let Some(prev) = prev_result {
            conf.insert("prevResult".into(), prev.clone());
        }
        let stdin = serde_json::to_vec(&Value::Object(conf))?;

        let cni_path = std::env::join_paths(&self.bin_dirs)
            .map_err(|e| Error::network(format!("invalid plugin path: {e}")))?;
        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", &self.ifname)
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut input) = child.stdin.take() {
            input.write_all(&stdin).await?;
        }
        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if output.status.success() {
            debug!(plugin = plugin_type, command, container_id, "network plugin ok");
            return Ok(stdout);
        }
        let message = match serde_json::from_str::<PluginError>(&stdout) {
            Ok(err) if !err.details.is_empty() => {
                format!("{plugin_type} ({}): {}: {}", err.code, err.msg, err.details)
            },
            Ok(err) => format!("{plugin_type} ({}): {}", err.code, err.msg),
            Err(_) => format!(
                "{plugin_type} {command} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        };
        Err(Error::network(message))
    }

    fn find_plugin(&self, plugin_type: &str) -> Result<PathBuf> {
        self.bin_dirs
            .iter()
            .map(|dir| dir.join(plugin_type))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::network(format!("plugin {plugin_type:?} not found in bin dirs")))
    }
}

fn parse_network_list(path: &Path) -> Result<NetworkList> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut value: Map<String, Value> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let cni_version = value
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or("1.0.0")
        .to_string();
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("botbox")
        .to_string();

    let plugins = match value.remove("plugins") {
        Some(Value::Array(plugins)) => plugins
            .into_iter()
            .filter_map(|p| match p {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        // Single-plugin `.conf` file.
        _ => vec![value],
    };
    if plugins.is_empty() {
        return Err(Error::network(format!("{} lists no plugins", path.display())));
    }
    Ok(NetworkList {
        cni_version,
        name,
        plugins,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use {super::*, std::os::unix::fs::PermissionsExt};

    /// Fake IPAM plugin: ADD allocates once (marker file) and reports a
    /// duplicate allocation on a second ADD; DEL releases.
    const FAKE_PLUGIN: &str = r#"#!/bin/sh
cat > /dev/null
marker="$(dirname "$0")/alloc-$CNI_CONTAINERID"
case "$CNI_COMMAND" in
  ADD)
    if [ -e "$marker" ]; then
      echo '{"code":11,"msg":"failed to allocate","details":"duplicate allocation is not allowed"}'
      exit 1
    fi
    echo "$CNI_NETNS" > "$marker"
    echo '{"cniVersion":"1.0.0","ips":[{"address":"10.88.0.2/16"}]}'
    ;;
  DEL)
    rm -f "$marker"
    ;;
esac
"#;

    fn setup_dirs() -> (tempfile::TempDir, CniNetwork) {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let conf = dir.path().join("net.d");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&conf).unwrap();

        let plugin = bin.join("fake-ipam");
        std::fs::write(&plugin, FAKE_PLUGIN).unwrap();
        std::fs::set_permissions(&plugin, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(
            conf.join("10-botbox.conflist"),
            r#"{"cniVersion":"1.0.0","name":"botbox","plugins":[{"type":"fake-ipam"}]}"#,
        )
        .unwrap();

        let cni = CniNetwork::from_config(&NetworkConfig {
            bin_dirs: vec![bin],
            conf_dir: conf,
            ifname: "eth0".into(),
        });
        (dir, cni)
    }

    #[tokio::test]
    async fn add_then_del_releases_allocation() {
        let (dir, cni) = setup_dirs();
        cni.add("botbox-t1", "/proc/1/ns/net").await.unwrap();
        assert!(dir.path().join("bin/alloc-botbox-t1").exists());
        cni.del("botbox-t1", "/proc/1/ns/net").await.unwrap();
        assert!(!dir.path().join("bin/alloc-botbox-t1").exists());
    }

    #[tokio::test]
    async fn second_add_reports_duplicate() {
        let (_dir, cni) = setup_dirs();
        cni.add("botbox-t1", "/proc/1/ns/net").await.unwrap();
        let err = cni.add("botbox-t1", "/proc/1/ns/net").await.unwrap_err();
        assert!(err.is_duplicate_allocation(), "{err}");
    }

    #[tokio::test]
    async fn setup_twice_recovers_from_duplicate() {
        let (_dir, cni) = setup_dirs();
        let strategy = NetworkStrategy::Cni(cni);
        strategy.setup("botbox-t1", Some(1)).await.unwrap();
        strategy.setup("botbox-t1", Some(1)).await.unwrap();
        strategy.remove("botbox-t1", Some(1)).await.unwrap();
    }

    #[tokio::test]
    async fn setup_without_pid_fails() {
        let (_dir, cni) = setup_dirs();
        let err = NetworkStrategy::Cni(cni).setup("botbox-t1", None).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[tokio::test]
    async fn missing_config_dir_is_network_error() {
        let cni = CniNetwork::from_config(&NetworkConfig {
            bin_dirs: vec![],
            conf_dir: PathBuf::from("/nonexistent/botbox/net.d"),
            ifname: "eth0".into(),
        });
        assert!(matches!(
            cni.add("c", "/proc/1/ns/net").await.unwrap_err(),
            Error::Network { .. }
        ));
    }

    #[test]
    fn single_plugin_conf_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-bridge.conf");
        std::fs::write(&path, r#"{"cniVersion":"0.4.0","name":"br","type":"bridge"}"#).unwrap();
        let list = parse_network_list(&path).unwrap();
        assert_eq!(list.name, "br");
        assert_eq!(list.plugins.len(), 1);
        assert_eq!(list.plugins[0]["type"], "bridge");
    }

    #[test]
    fn malformed_conf_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-bridge.conflist");
        std::fs::write(&path, "{not json").unwrap();
        let err = parse_network_list(&path).unwrap_err();
        assert!(matches!(err, Error::Message { .. }));
        assert!(err.to_string().starts_with(&format!("parsing {}: ", path.display())));
    }
}
