use std::path::Path;

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    types::{
        Capabilities, ContainerInfo, ContainerSpec, DeleteContainerOptions, ExecOutput,
        ExecRequest, ExecStreams, ImageInfo, MountDescriptor, SnapshotInfo, StopOptions, TaskInfo,
    },
};

/// Uniform operations over a container runtime.
///
/// Operations a backend cannot perform return [`Error::NotSupported`] so
/// callers can degrade explicitly instead of guessing from error text.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    /// Short backend name (e.g. "containerd", "proxy", "memory").
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    // ── Images ──────────────────────────────────────────────────────────────

    /// Pull an image and unpack it for `snapshotter`.
    async fn pull_image(&self, reference: &str, snapshotter: &str) -> Result<ImageInfo>;

    async fn get_image(&self, reference: &str) -> Result<ImageInfo>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    async fn delete_image(&self, reference: &str) -> Result<()>;

    // ── Containers ──────────────────────────────────────────────────────────

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo>;

    /// Create a container whose root filesystem is the existing active
    /// snapshot `snapshot_key` instead of a fresh one from the image.
    async fn create_container_from_snapshot(
        &self,
        _spec: &ContainerSpec,
        _snapshot_key: &str,
    ) -> Result<ContainerInfo> {
        Err(Error::not_supported(
            self.backend_name(),
            "create container from snapshot",
        ))
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo>;

    /// List containers, optionally only those carrying label `key=value`.
    async fn list_containers(&self, label: Option<(&str, &str)>) -> Result<Vec<ContainerInfo>>;

    async fn delete_container(&self, id: &str, opts: DeleteContainerOptions) -> Result<()>;

    // ── Tasks ───────────────────────────────────────────────────────────────

    async fn start_task(&self, container_id: &str) -> Result<TaskInfo>;

    /// Signal the task to exit, escalating to a kill after `opts.timeout`
    /// when `opts.force` is set.
    async fn stop_task(&self, container_id: &str, opts: StopOptions) -> Result<()>;

    async fn delete_task(&self, container_id: &str, force: bool) -> Result<()>;

    /// Current task state. [`Error::NotFound`] when the container has no task.
    async fn task_status(&self, container_id: &str) -> Result<TaskInfo>;

    async fn list_tasks(&self) -> Result<Vec<TaskInfo>>;

    // ── Exec ────────────────────────────────────────────────────────────────

    /// Run a process in the container's task and collect its output.
    async fn exec(&self, req: &ExecRequest) -> Result<ExecOutput>;

    /// Run a process wired to caller streams; returns the exit code.
    async fn exec_streaming(&self, _req: &ExecRequest, _streams: ExecStreams) -> Result<i32> {
        Err(Error::not_supported(self.backend_name(), "streaming exec"))
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    /// Commit active snapshot `key` as the read-only snapshot `name`.
    async fn commit_snapshot(&self, _snapshotter: &str, _name: &str, _key: &str) -> Result<()> {
        Err(Error::not_supported(self.backend_name(), "commit snapshot"))
    }

    async fn list_snapshots(&self, _snapshotter: &str) -> Result<Vec<SnapshotInfo>> {
        Err(Error::not_supported(self.backend_name(), "list snapshots"))
    }

    /// Create active snapshot `key` on top of committed `parent`.
    async fn prepare_snapshot(
        &self,
        _snapshotter: &str,
        _key: &str,
        _parent: &str,
    ) -> Result<Vec<MountDescriptor>> {
        Err(Error::not_supported(self.backend_name(), "prepare snapshot"))
    }

    async fn snapshot_mounts(&self, _snapshotter: &str, _key: &str) -> Result<Vec<MountDescriptor>> {
        Err(Error::not_supported(self.backend_name(), "snapshot mounts"))
    }

    // ── Network ─────────────────────────────────────────────────────────────

    /// Attach the running task to the host network. Repeated calls succeed.
    async fn setup_network(&self, container_id: &str) -> Result<()>;

    async fn remove_network(&self, container_id: &str) -> Result<()>;
}

/// Whether `path` looks like a usable unix socket.
pub(crate) fn socket_exists(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_socket())
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}
