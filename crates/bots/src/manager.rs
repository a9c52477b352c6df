//! Per-bot container lifecycle: create, start, stop, delete and exec.

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    botbox_runtime::{
        BOT_ID_LABEL, BindMount, ContainerInfo, ContainerSpec, DeleteContainerOptions,
        ExecOutput, ExecRequest, ExecStreams, MountedSnapshot, RuntimeService, StopOptions,
        TaskInfo, mount_container_snapshot,
    },
    botbox_store::{
        BotStore, ContainerRecord, ContainerStatus, EventKind, LifecycleEvent, NewEvent, now_ms,
    },
    serde::Serialize,
    tempfile::TempDir,
    tokio::io::AsyncWriteExt,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use botbox_metrics::{counter, exec as exec_metrics, histogram, versions as version_metrics};

use crate::{
    config::ManagerConfig,
    error::{Context, Error, Result, RuntimeResultExt},
};

/// Grace period for the compensating stop after a failed network setup.
const COMPENSATION_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// A command to run inside a bot container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecCommand {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub terminal: bool,
    pub timeout: Option<Duration>,
}

impl ExecCommand {
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }
}

/// Live view of a bot's container.
#[derive(Debug, Clone, Serialize)]
pub struct BotContainer {
    pub bot_id: String,
    pub info: ContainerInfo,
    pub task: Option<TaskInfo>,
    /// Mirrored row, when one has been written.
    pub record: Option<ContainerRecord>,
}

impl BotContainer {
    pub fn status(&self) -> ContainerStatus {
        match &self.task {
            Some(task) if task.is_running() => ContainerStatus::Running,
            Some(_) => ContainerStatus::Stopped,
            None => ContainerStatus::Created,
        }
    }
}

#[derive(Serialize)]
struct ExecPayload<'a> {
    command: &'a [String],
    workdir: Option<&'a str>,
    exit_code: i32,
    duration_ms: u64,
}

/// Orchestrates one container per bot on top of a [`RuntimeService`],
/// mirroring state and history into a [`BotStore`].
pub struct BotManager {
    pub(crate) runtime: Arc<dyn RuntimeService>,
    pub(crate) store: Arc<dyn BotStore>,
    pub(crate) config: ManagerConfig,
}

impl BotManager {
    pub fn new(
        runtime: Arc<dyn RuntimeService>,
        store: Arc<dyn BotStore>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeService> {
        &self.runtime
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Validate `bot_id` and derive its container ID.
    pub fn container_id(&self, bot_id: &str) -> Result<String> {
        botbox_common::validate_bot_id(bot_id)
            .map_err(|e| Error::invalid_argument(format!("{bot_id:?}: {e}")))?;
        Ok(self.config.container_id(bot_id))
    }

    /// Create the bot's container if it does not exist yet.
    ///
    /// The bot directory is bound read-write at the configured mount path and
    /// the host resolver file read-only at `/etc/resolv.conf`.
    pub async fn ensure_exists(&self, bot_id: &str) -> Result<ContainerInfo> {
        let container_id = self.container_id(bot_id)?;

        if self.store.get_bot(bot_id).await?.is_none() {
            self.store.insert_bot(bot_id, None).await?;
        }

        let bot_dir = self.config.bot_dir(bot_id);
        std::fs::create_dir_all(&bot_dir)
            .with_context(|| format!("creating {}", bot_dir.display()))?;

        match self.runtime.get_container(&container_id).await {
            Ok(info) => return Ok(info),
            Err(e) if e.is_not_found() => {},
            Err(e) => return Err(Error::runtime("get container", container_id, e)),
        }

        let resolv = self
            .config
            .resolve_resolv_conf()
            .context("resolving resolv.conf")?;
        self.ensure_image().await?;

        let spec = ContainerSpec {
            id: container_id.clone(),
            image: self.config.image.clone(),
            snapshotter: self.config.snapshotter.clone(),
            labels: [(BOT_ID_LABEL.to_string(), bot_id.to_string())].into(),
            mounts: vec![
                BindMount::read_write(&bot_dir, self.config.mount_path.clone()),
                BindMount::read_only(resolv, "/etc/resolv.conf"),
            ],
            command: Vec::new(),
            runtime_spec: None,
        };
        let info = match self.runtime.create_container(&spec).await {
            Ok(info) => {
                info!(bot_id, container_id, image = %spec.image, "container created");
                info
            },
            // Lost a race with a concurrent create.
            Err(botbox_runtime::Error::AlreadyExists { .. }) => self
                .runtime
                .get_container(&container_id)
                .await
                .op("get container", &container_id)?,
            Err(e) => return Err(Error::runtime("create container", container_id, e)),
        };

        self.mirror(bot_id, &info, ContainerStatus::Created, &bot_dir)
            .await?;
        Ok(info)
    }

    async fn ensure_image(&self) -> Result<()> {
        let image = &self.config.image;
        match self.runtime.get_image(image).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(image, "pulling image");
                self.runtime
                    .pull_image(image, &self.config.snapshotter)
                    .await
                    .op("pull image", image)?;
                Ok(())
            },
            Err(e) => Err(Error::runtime("get image", image.clone(), e)),
        }
    }

    /// Write the mirrored container row.
    pub(crate) async fn mirror(
        &self,
        bot_id: &str,
        info: &ContainerInfo,
        status: ContainerStatus,
        bot_dir: &Path,
    ) -> Result<()> {
        self.store
            .upsert_container(&ContainerRecord {
                container_id: info.id.clone(),
                bot_id: bot_id.to_string(),
                image: info.image.clone(),
                status,
                snapshotter: info.snapshotter.clone(),
                snapshot_key: info.snapshot_key.clone(),
                host_path: bot_dir.to_string_lossy().into_owned(),
                container_path: self.config.mount_path.clone(),
                last_started_at_ms: None,
                last_stopped_at_ms: None,
                updated_at_ms: now_ms(),
            })
            .await?;
        Ok(())
    }

    /// Update the mirrored status when a row exists. Failures are logged.
    pub(crate) async fn mark_status(&self, container_id: &str, status: ContainerStatus) {
        match self
            .store
            .update_container_status(container_id, status, now_ms())
            .await
        {
            Ok(true) => {},
            Ok(false) => debug!(container_id, %status, "no container row to update"),
            Err(e) => warn!(container_id, %status, error = %e, "failed to update container status"),
        }
    }

    /// Ensure the container exists, start its task and attach networking.
    ///
    /// A network failure force-stops the task before the error is returned.
    pub async fn start(&self, bot_id: &str) -> Result<TaskInfo> {
        let info = self.ensure_exists(bot_id).await?;
        match self.runtime.task_status(&info.id).await {
            Ok(task) if task.is_running() => {
                debug!(bot_id, container_id = %info.id, "task already running");
                return Ok(task);
            },
            Ok(_) => self
                .runtime
                .delete_task(&info.id, true)
                .await
                .op("delete task", &info.id)?,
            Err(e) if e.is_not_found() => {},
            Err(e) => return Err(Error::runtime("task status", info.id, e)),
        }

        let task = self.launch(&info.id).await?;
        self.mark_status(&info.id, ContainerStatus::Running).await;
        info!(bot_id, container_id = %info.id, pid = ?task.pid, "bot started");
        Ok(task)
    }

    /// Start a task that has none and attach networking, undoing the start
    /// if networking fails.
    pub(crate) async fn launch(&self, container_id: &str) -> Result<TaskInfo> {
        let task = self
            .runtime
            .start_task(container_id)
            .await
            .op("start task", container_id)?;

        if let Err(e) = self.runtime.setup_network(container_id).await {
            warn!(container_id, error = %e, "network setup failed, stopping task");
            let opts = StopOptions {
                timeout: COMPENSATION_STOP_TIMEOUT,
                force: true,
            };
            if let Err(stop_err) = self.runtime.stop_task(container_id, opts).await {
                warn!(container_id, error = %stop_err, "compensating stop failed");
            }
            if let Err(del_err) = self.runtime.delete_task(container_id, true).await {
                warn!(container_id, error = %del_err, "compensating task delete failed");
            }
            return Err(Error::runtime("setup network", container_id, e));
        }
        Ok(task)
    }

    /// Stop the bot's task, killing it after `timeout` (the configured stop
    /// timeout when `None`).
    pub async fn stop(&self, bot_id: &str, timeout: Option<Duration>) -> Result<()> {
        let container_id = self.container_id(bot_id)?;
        let opts = StopOptions {
            timeout: timeout.unwrap_or(self.config.stop_timeout),
            force: true,
        };
        self.runtime
            .stop_task(&container_id, opts)
            .await
            .op("stop task", &container_id)?;
        self.mark_status(&container_id, ContainerStatus::Stopped)
            .await;
        info!(bot_id, container_id, "bot stopped");
        Ok(())
    }

    /// Remove the bot's container and its live snapshot.
    ///
    /// Network and task removal are best-effort; only the container delete
    /// itself can fail the call. Versions and their snapshots are kept.
    pub async fn delete(&self, bot_id: &str) -> Result<()> {
        let container_id = self.container_id(bot_id)?;

        if let Err(e) = self.runtime.remove_network(&container_id).await {
            warn!(bot_id, container_id, error = %e, "network removal failed, continuing");
        }
        match self.runtime.delete_task(&container_id, true).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => debug!(container_id, "no task to delete"),
            Err(e) => warn!(bot_id, container_id, error = %e, "task removal failed, continuing"),
        }

        self.runtime
            .delete_container(&container_id, DeleteContainerOptions {
                cleanup_snapshot: true,
            })
            .await
            .op("delete container", &container_id)?;
        self.mark_status(&container_id, ContainerStatus::Deleted)
            .await;
        info!(bot_id, container_id, "bot container deleted");
        Ok(())
    }

    /// Live container, task and mirrored row for a bot.
    pub async fn get_container(&self, bot_id: &str) -> Result<BotContainer> {
        let container_id = self.container_id(bot_id)?;
        let info = match self.runtime.get_container(&container_id).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return Err(Error::ContainerNotFound {
                    bot_id: bot_id.to_string(),
                });
            },
            Err(e) => return Err(Error::runtime("get container", container_id, e)),
        };
        let task = match self.runtime.task_status(&container_id).await {
            Ok(task) => Some(task),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(Error::runtime("task status", container_id, e)),
        };
        let record = self.store.get_container_by_bot(bot_id).await?;
        Ok(BotContainer {
            bot_id: bot_id.to_string(),
            info,
            task,
            record,
        })
    }

    /// Most recent lifecycle events for a bot, oldest first.
    pub async fn list_events(
        &self,
        bot_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LifecycleEvent>> {
        let container_id = self.container_id(bot_id)?;
        let limit = limit.unwrap_or(self.config.default_event_limit);
        Ok(self.store.list_events(&container_id, limit).await?)
    }

    /// Mount the bot's live root filesystem on the host for inspection.
    pub async fn mount_live(&self, bot_id: &str) -> Result<MountedSnapshot> {
        let container_id = self.container_id(bot_id)?;
        mount_container_snapshot(self.runtime.as_ref(), &container_id)
            .await
            .op("mount snapshot", &container_id)
    }

    /// Run a command, streaming its output into `streams`.
    ///
    /// A version is created as a checkpoint before the command runs. Returns
    /// the command's exit code.
    pub async fn exec(
        &self,
        bot_id: &str,
        command: &ExecCommand,
        mut streams: ExecStreams,
    ) -> Result<i32> {
        let (req, _fifo) = self.prepare_exec(bot_id, command).await?;
        let started = Instant::now();
        let outcome = if self.runtime.capabilities().streaming_exec {
            self.runtime.exec_streaming(&req, streams).await
        } else {
            match self.runtime.exec(&req).await {
                Ok(output) => forward(&output, &mut streams)
                    .await
                    .map(|()| output.exit_code)
                    .map_err(Into::into),
                Err(e) => Err(e),
            }
        };
        match outcome {
            Ok(exit_code) => {
                self.record_exec(bot_id, &req, started, exit_code).await;
                Ok(exit_code)
            },
            Err(e) => Err(exec_failed(&req, e)),
        }
    }

    /// Run a command and return its captured output.
    ///
    /// Checkpointing happens as for [`exec`](Self::exec).
    pub async fn exec_with_capture(
        &self,
        bot_id: &str,
        command: &ExecCommand,
    ) -> Result<ExecOutput> {
        let (req, _fifo) = self.prepare_exec(bot_id, command).await?;
        let started = Instant::now();
        let output = self
            .runtime
            .exec(&req)
            .await
            .map_err(|e| exec_failed(&req, e))?;
        self.record_exec(bot_id, &req, started, output.exit_code)
            .await;
        Ok(output)
    }

    async fn record_exec(&self, bot_id: &str, req: &ExecRequest, started: Instant, exit_code: i32) {
        let elapsed = started.elapsed();
        #[cfg(feature = "metrics")]
        {
            counter!(exec_metrics::EXECUTIONS_TOTAL).increment(1);
            histogram!(exec_metrics::DURATION_SECONDS).record(elapsed.as_secs_f64());
        }
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        debug!(bot_id, container_id = %req.container_id, exit_code, duration_ms, "exec finished");

        let payload = ExecPayload {
            command: &req.args,
            workdir: req.workdir.as_deref(),
            exit_code,
            duration_ms,
        };
        let event = NewEvent {
            container_id: req.container_id.clone(),
            bot_id: bot_id.to_string(),
            kind: EventKind::Exec,
            payload: serde_json::to_value(&payload).unwrap_or_default(),
        };
        if let Err(e) = self.store.insert_event(&event).await {
            warn!(bot_id, container_id = %req.container_id, error = %e, "failed to record exec event");
        }
    }

    /// Validate, checkpoint, make sure the task runs, and build the request.
    /// The returned directory holds the exec FIFOs and is removed on drop.
    async fn prepare_exec(
        &self,
        bot_id: &str,
        command: &ExecCommand,
    ) -> Result<(ExecRequest, Option<TempDir>)> {
        let container_id = self.container_id(bot_id)?;
        if command.args.first().is_none_or(|a| a.trim().is_empty()) {
            return Err(Error::invalid_argument("command must not be empty"));
        }

        self.ensure_exists(bot_id).await?;
        match self.create_version(bot_id).await {
            Ok(v) => debug!(bot_id, version = v.version, "exec checkpoint created"),
            Err(e) if e.is_not_supported() => {
                debug!(bot_id, error = %e, "backend has no snapshots, skipping exec checkpoint");
                #[cfg(feature = "metrics")]
                counter!(version_metrics::CHECKPOINTS_SKIPPED_TOTAL).increment(1);
            },
            Err(e) => return Err(e),
        }

        let running = match self.runtime.task_status(&container_id).await {
            Ok(task) => task.is_running(),
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(Error::runtime("task status", container_id, e)),
        };
        if !running {
            self.start(bot_id).await?;
        }

        let fifo = if self.runtime.capabilities().host_fifo_dir {
            Some(exec_fifo_dir(&self.config.data_root)?)
        } else {
            None
        };

        let req = ExecRequest {
            container_id,
            args: command.args.clone(),
            env: command.env.clone(),
            workdir: command.workdir.clone(),
            terminal: command.terminal,
            fifo_dir: fifo.as_ref().map(|d| d.path().to_path_buf()),
            timeout: command.timeout,
        };
        Ok((req, fifo))
    }
}

fn exec_failed(req: &ExecRequest, e: botbox_runtime::Error) -> Error {
    #[cfg(feature = "metrics")]
    counter!(exec_metrics::ERRORS_TOTAL).increment(1);
    Error::runtime("exec", &req.container_id, e)
}

/// Scratch directory for exec FIFOs under the data root, removed on drop.
pub(crate) fn exec_fifo_dir(data_root: &Path) -> Result<TempDir> {
    std::fs::create_dir_all(data_root)?;
    Ok(tempfile::Builder::new()
        .prefix("exec-fifo-")
        .tempdir_in(data_root)?)
}

async fn forward(output: &ExecOutput, streams: &mut ExecStreams) -> std::io::Result<()> {
    streams.stdout.write_all(output.stdout.as_bytes()).await?;
    streams.stdout.flush().await?;
    streams.stderr.write_all(output.stderr.as_bytes()).await?;
    streams.stderr.flush().await
}
