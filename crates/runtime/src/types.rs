//! Backend-neutral data model shared by every [`RuntimeService`](crate::RuntimeService).

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use {
    serde::{Deserialize, Serialize},
    tokio::io::{AsyncRead, AsyncWrite},
};

/// Label carrying the owning bot ID on every bot container.
pub const BOT_ID_LABEL: &str = "botbox.bot-id";

/// Label recording which version a container was restored from, if any.
pub const VERSION_LABEL: &str = "botbox.version";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub reference: String,
    pub digest: Option<String>,
}

/// Host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: String,
    pub read_only: bool,
}

impl BindMount {
    #[must_use]
    pub fn read_write(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: false,
        }
    }

    #[must_use]
    pub fn read_only(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: true,
        }
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    pub image: String,
    pub snapshotter: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    /// Long-running init process. Backends fall back to the image default
    /// when empty.
    pub command: Vec<String>,
    /// OCI runtime spec of a previous container, reused verbatim by backends
    /// that can; others rebuild from the fields above.
    pub runtime_spec: Option<serde_json::Value>,
}

impl ContainerSpec {
    /// Rebuild a spec from an existing container so it can be recreated
    /// under the same ID.
    #[must_use]
    pub fn from_info(info: &ContainerInfo) -> Self {
        Self {
            id: info.id.clone(),
            image: info.image.clone(),
            snapshotter: info.snapshotter.clone(),
            labels: info.labels.clone(),
            mounts: info.mounts.clone(),
            command: info.command.clone(),
            runtime_spec: info.runtime_spec.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub snapshotter: String,
    /// Active snapshot holding the container's writable root filesystem.
    pub snapshot_key: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub command: Vec<String>,
    pub runtime_spec: Option<serde_json::Value>,
}

impl ContainerInfo {
    #[must_use]
    pub fn bot_id(&self) -> Option<&str> {
        self.labels.get(BOT_ID_LABEL).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl TaskState {
    /// Parse the upper-case status column printed by `ctr tasks ls`.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Self::Created,
            "RUNNING" => Self::Running,
            "PAUSED" | "PAUSING" => Self::Paused,
            "STOPPED" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub container_id: String,
    pub pid: Option<u32>,
    pub state: TaskState,
}

impl TaskInfo {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Grace period between the polite signal and the kill.
    pub timeout: Duration,
    /// Kill the task if it has not exited within `timeout`.
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            force: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteContainerOptions {
    /// Remove the container's active snapshot along with it.
    pub cleanup_snapshot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Active,
    Committed,
    View,
}

impl SnapshotKind {
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "committed" => Some(Self::Committed),
            "view" => Some(Self::View),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub kind: SnapshotKind,
}

/// One mount needed to materialize a snapshot on the host, in the shape of
/// `mount -t <fs_type> <source> <target> -o <options>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    pub fs_type: String,
    pub source: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub container_id: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub terminal: bool,
    /// Host directory for the exec's I/O FIFOs. Backends that do not use
    /// host FIFOs ignore it.
    pub fifo_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    #[must_use]
    pub fn new(container_id: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            container_id: container_id.into(),
            args,
            ..Default::default()
        }
    }

    /// `args` prefixed with `env K=V ...` when environment overrides are set.
    #[must_use]
    pub fn argv_with_env(&self) -> Vec<String> {
        if self.env.is_empty() {
            return self.args.clone();
        }
        let mut argv = Vec::with_capacity(self.args.len() + self.env.len() + 1);
        argv.push("env".to_string());
        argv.extend(self.env.iter().map(|(k, v)| format!("{k}={v}")));
        argv.extend(self.args.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Caller-provided sinks (and optional source) for a streaming exec.
pub struct ExecStreams {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
    /// The streams are this process's own stdio, so a terminal exec may hand
    /// the console to the runtime directly.
    pub console: bool,
}

impl ExecStreams {
    /// Forward to this process's stdio.
    #[must_use]
    pub fn inherit() -> Self {
        Self {
            stdin: None,
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            console: true,
        }
    }
}

/// What a backend can do beyond the common container/task surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub snapshots: bool,
    pub streaming_exec: bool,
    pub host_fifo_dir: bool,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("RUNNING", TaskState::Running)]
    #[case("stopped", TaskState::Stopped)]
    #[case("CREATED", TaskState::Created)]
    #[case("PAUSED", TaskState::Paused)]
    #[case("weird", TaskState::Unknown)]
    fn parses_task_state(#[case] raw: &str, #[case] expected: TaskState) {
        assert_eq!(TaskState::parse(raw), expected);
    }

    #[test]
    fn argv_with_env_prefixes_env() {
        let mut req = ExecRequest::new("c1", vec!["ls".into(), "/".into()]);
        assert_eq!(req.argv_with_env(), vec!["ls", "/"]);

        req.env = vec![("A".into(), "1".into()), ("B".into(), "x y".into())];
        assert_eq!(req.argv_with_env(), vec!["env", "A=1", "B=x y", "ls", "/"]);
    }

    #[test]
    fn spec_from_info_keeps_identity() {
        let mut labels = BTreeMap::new();
        labels.insert(BOT_ID_LABEL.to_string(), "t1".to_string());
        let info = ContainerInfo {
            id: "botbox-t1".into(),
            image: "img".into(),
            snapshotter: "overlayfs".into(),
            snapshot_key: "botbox-t1".into(),
            labels,
            mounts: vec![BindMount::read_write("/srv/t1", "/data")],
            command: vec!["sleep".into(), "infinity".into()],
            runtime_spec: None,
        };
        let spec = ContainerSpec::from_info(&info);
        assert_eq!(spec.id, info.id);
        assert_eq!(spec.mounts, info.mounts);
        assert_eq!(info.bot_id(), Some("t1"));
    }
}
