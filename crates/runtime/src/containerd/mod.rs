//! Native containerd backend.
//!
//! Most operations shell out to `ctr` (through the VM shell when the host
//! platform is VM-delegated). Creating a container on top of an existing
//! snapshot has no `ctr` equivalent and uses the gRPC Containers service.

mod api;
mod ctr;

use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    botbox_config::BotboxConfig,
    tokio::io::AsyncWriteExt,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    network::{CniNetwork, NetworkStrategy},
    platform::HostPlatform,
    service::RuntimeService,
    types::{
        Capabilities, ContainerInfo, ContainerSpec, DeleteContainerOptions, ExecOutput,
        ExecRequest, ExecStreams, ImageInfo, MountDescriptor, SnapshotInfo, StopOptions,
        TaskInfo, TaskState,
    },
};

use self::ctr::Ctr;

const BACKEND: &str = "containerd";
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for a task to disappear after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Placeholder mount target passed to `ctr snapshots mounts`.
const MOUNT_TARGET: &str = "/botbox-mount-target";

pub struct ContainerdRuntime {
    ctr: Ctr,
    api_socket: PathBuf,
    network: NetworkStrategy,
}

impl ContainerdRuntime {
    pub fn new(config: &BotboxConfig) -> Self {
        let platform = HostPlatform::from_config(&config.vm);
        let network = match &platform {
            HostPlatform::Direct => NetworkStrategy::Cni(CniNetwork::from_config(&config.network)),
            HostPlatform::VmDelegated(vm) => NetworkStrategy::Vm(vm.clone()),
        };
        Self {
            ctr: Ctr {
                bin: config.containerd.ctr.clone(),
                address: config.containerd.address.clone(),
                namespace: config.runtime.namespace.clone(),
                platform,
            },
            api_socket: config.containerd.api_socket().to_path_buf(),
            network,
        }
    }

    fn platform(&self) -> &HostPlatform {
        &self.ctr.platform
    }

    /// `tasks exec` args common to buffered and streaming exec.
    ///
    /// `ctr` only accepts `--tty` when its stdin is a console, so `console`
    /// is set only when the process's own stdio is handed through.
    fn exec_args(&self, req: &ExecRequest, console: bool) -> Vec<String> {
        let exec_id = format!("botbox-exec-{}", uuid::Uuid::new_v4().simple());
        let mut args = vec!["tasks".into(), "exec".into(), "--exec-id".into(), exec_id];
        if console {
            args.push("--tty".into());
        } else if req.terminal {
            debug!(container_id = %req.container_id, "no console attached, running exec without a tty");
        }
        if let Some(cwd) = &req.workdir {
            args.push("--cwd".into());
            args.push(cwd.clone());
        }
        // FIFOs only make sense when ctr runs on this host.
        if let (HostPlatform::Direct, Some(dir)) = (self.platform(), &req.fifo_dir) {
            args.push("--fifo-dir".into());
            args.push(dir.display().to_string());
        }
        args.push(req.container_id.clone());
        args.extend(req.argv_with_env());
        args
    }

    async fn wait_for_exit(&self, container_id: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.task_status(container_id).await {
                Ok(task) if task.state == TaskState::Stopped => return Ok(true),
                Ok(_) => {},
                Err(e) if e.is_not_found() => return Ok(true),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<()> {
        match self
            .ctr
            .run(["tasks", "kill", "--signal", signal, container_id])
            .await
        {
            // Already gone between the status check and the kill.
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Terminal exec with `ctr` attached to this process's own console.
    async fn exec_console(&self, req: &ExecRequest) -> Result<i32> {
        let args = self.exec_args(req, true);
        let mut cmd = self.ctr.command();
        cmd.args(&args)
            .kill_on_drop(true)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn()?;
        let status = match req.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait())
                .await
                .map_err(|_| {
                    Error::timeout(format!("exec in {}", req.container_id), limit.as_secs())
                })??,
            None => child.wait().await?,
        };
        status.code().ok_or_else(|| {
            Error::message(format!("exec in {} terminated by signal", req.container_id))
        })
    }

    async fn task_pid(&self, container_id: &str) -> Option<u32> {
        self.task_status(container_id)
            .await
            .ok()
            .filter(TaskInfo::is_running)
            .and_then(|t| t.pid)
    }
}

#[async_trait]
impl RuntimeService for ContainerdRuntime {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: true,
            streaming_exec: true,
            host_fifo_dir: !self.platform().is_vm(),
        }
    }

    async fn pull_image(&self, reference: &str, snapshotter: &str) -> Result<ImageInfo> {
        info!(image = reference, snapshotter, "pulling image");
        self.ctr
            .run(["images", "pull", "--snapshotter", snapshotter, reference])
            .await?;
        self.get_image(reference).await
    }

    async fn get_image(&self, reference: &str) -> Result<ImageInfo> {
        let filter = format!("name=={reference}");
        let raw = self.ctr.run(["images", "ls", filter.as_str()]).await?;
        ctr::parse_images(&raw)
            .into_iter()
            .find(|i| i.reference == reference)
            .ok_or_else(|| Error::not_found("image", reference))
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let raw = self.ctr.run(["images", "ls"]).await?;
        Ok(ctr::parse_images(&raw))
    }

    async fn delete_image(&self, reference: &str) -> Result<()> {
        self.ctr.run(["images", "rm", reference]).await.map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo> {
        let mut args: Vec<String> = vec![
            "containers".into(),
            "create".into(),
            "--snapshotter".into(),
            spec.snapshotter.clone(),
        ];
        for (k, v) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        for mount in &spec.mounts {
            args.push("--mount".into());
            args.push(ctr::bind_mount_arg(mount));
        }
        args.push(spec.image.clone());
        args.push(spec.id.clone());
        args.extend(spec.command.iter().cloned());

        debug!(container_id = %spec.id, image = %spec.image, "creating container");
        self.ctr.run(&args).await?;
        self.get_container(&spec.id).await
    }

    async fn create_container_from_snapshot(
        &self,
        spec: &ContainerSpec,
        snapshot_key: &str,
    ) -> Result<ContainerInfo> {
        api::create_with_snapshot(&self.api_socket, &self.ctr.namespace, spec, snapshot_key)
            .await?;
        self.get_container(&spec.id).await
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo> {
        let raw = self.ctr.run(["containers", "info", id]).await?;
        ctr::parse_container_info(&raw)
    }

    async fn list_containers(&self, label: Option<(&str, &str)>) -> Result<Vec<ContainerInfo>> {
        let mut args = vec!["containers".to_string(), "ls".into(), "-q".into()];
        if let Some((k, v)) = label {
            args.push(ctr::label_filter(k, v));
        }
        let raw = self.ctr.run(&args).await?;
        let mut out = Vec::new();
        for id in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.get_container(id).await {
                Ok(info) => out.push(info),
                // Deleted between ls and info.
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn delete_container(&self, id: &str, opts: DeleteContainerOptions) -> Result<()> {
        let mut args = vec!["containers", "delete"];
        if !opts.cleanup_snapshot {
            args.push("--keep-snapshot");
        }
        args.push(id);
        self.ctr.run(args).await.map(|_| ())
    }

    async fn start_task(&self, container_id: &str) -> Result<TaskInfo> {
        self.ctr
            .run(["tasks", "start", "--detach", "--null-io", container_id])
            .await?;
        self.task_status(container_id).await
    }

    async fn stop_task(&self, container_id: &str, opts: StopOptions) -> Result<()> {
        if self.task_status(container_id).await?.state == TaskState::Stopped {
            return Ok(());
        }
        self.kill(container_id, "SIGTERM").await?;
        if self.wait_for_exit(container_id, opts.timeout).await? {
            return Ok(());
        }
        if !opts.force {
            return Err(Error::timeout(
                format!("stop task {container_id}"),
                opts.timeout.as_secs(),
            ));
        }
        warn!(container_id, "task ignored SIGTERM, killing");
        self.kill(container_id, "SIGKILL").await?;
        if self.wait_for_exit(container_id, KILL_GRACE).await? {
            Ok(())
        } else {
            Err(Error::timeout(
                format!("kill task {container_id}"),
                KILL_GRACE.as_secs(),
            ))
        }
    }

    async fn delete_task(&self, container_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["tasks", "delete"];
        if force {
            args.push("--force");
        }
        args.push(container_id);
        self.ctr.run(args).await.map(|_| ())
    }

    async fn task_status(&self, container_id: &str) -> Result<TaskInfo> {
        self.list_tasks()
            .await?
            .into_iter()
            .find(|t| t.container_id == container_id)
            .ok_or_else(|| Error::not_found("task", container_id))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskInfo>> {
        let raw = self.ctr.run(["tasks", "ls"]).await?;
        Ok(ctr::parse_tasks(&raw))
    }

    async fn exec(&self, req: &ExecRequest) -> Result<ExecOutput> {
        let args = self.exec_args(req, false);
        let mut cmd = self.ctr.command();
        cmd.args(&args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match req.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    Error::timeout(format!("exec in {}", req.container_id), limit.as_secs())
                })??,
            None => cmd.output().await?,
        };

        let raw_stderr = String::from_utf8_lossy(&output.stderr);
        let (vm_lines, stderr) = self.platform().split_stderr(&raw_stderr);
        let Some(exit_code) = output.status.code() else {
            return Err(Error::message(format!(
                "exec in {} terminated by signal",
                req.container_id
            )));
        };
        // The VM shell reports its own failures only through prefixed lines.
        if exit_code != 0 && !vm_lines.is_empty() && stderr.trim().is_empty() {
            return Err(Error::vm(vm_lines.join("\n")));
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
        })
    }

    async fn exec_streaming(&self, req: &ExecRequest, streams: ExecStreams) -> Result<i32> {
        if req.terminal && streams.console {
            return self.exec_console(req).await;
        }
        let args = self.exec_args(req, false);
        let mut cmd = self.ctr.command();
        cmd.args(&args)
            .kill_on_drop(true)
            .stdin(if streams.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let ExecStreams {
            stdin,
            mut stdout,
            mut stderr,
            ..
        } = streams;
        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| Error::message("exec stdout not captured"))?;
        let mut child_err = child
            .stderr
            .take()
            .ok_or_else(|| Error::message("exec stderr not captured"))?;
        let feed = async {
            if let (Some(mut src), Some(mut dst)) = (stdin, child.stdin.take()) {
                tokio::io::copy(&mut src, &mut dst).await?;
                dst.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let pump = async {
            tokio::try_join!(
                tokio::io::copy(&mut child_out, &mut stdout),
                tokio::io::copy(&mut child_err, &mut stderr),
                feed,
            )
        };

        match req.timeout {
            Some(limit) => tokio::time::timeout(limit, pump).await.map_err(|_| {
                Error::timeout(format!("exec in {}", req.container_id), limit.as_secs())
            })??,
            None => pump.await?,
        };
        stdout.flush().await?;
        stderr.flush().await?;

        let status = child.wait().await?;
        status.code().ok_or_else(|| {
            Error::message(format!("exec in {} terminated by signal", req.container_id))
        })
    }

    async fn commit_snapshot(&self, snapshotter: &str, name: &str, key: &str) -> Result<()> {
        self.ctr
            .run(["snapshots", "--snapshotter", snapshotter, "commit", name, key])
            .await
            .map(|_| ())
    }

    async fn list_snapshots(&self, snapshotter: &str) -> Result<Vec<SnapshotInfo>> {
        let raw = self
            .ctr
            .run(["snapshots", "--snapshotter", snapshotter, "ls"])
            .await?;
        Ok(ctr::parse_snapshots(&raw))
    }

    async fn prepare_snapshot(
        &self,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<MountDescriptor>> {
        self.ctr
            .run(["snapshots", "--snapshotter", snapshotter, "prepare", key, parent])
            .await?;
        self.snapshot_mounts(snapshotter, key).await
    }

    async fn snapshot_mounts(&self, snapshotter: &str, key: &str) -> Result<Vec<MountDescriptor>> {
        let raw = self
            .ctr
            .run([
                "snapshots",
                "--snapshotter",
                snapshotter,
                "mounts",
                MOUNT_TARGET,
                key,
            ])
            .await?;
        Ok(ctr::parse_mount_commands(&raw))
    }

    async fn setup_network(&self, container_id: &str) -> Result<()> {
        let pid = self.task_pid(container_id).await;
        self.network.setup(container_id, pid).await
    }

    async fn remove_network(&self, container_id: &str) -> Result<()> {
        let pid = self.task_pid(container_id).await;
        self.network.remove(container_id, pid).await
    }
}
