//! Daemon-proxied backend.
//!
//! Talks to a Docker-compatible API served by a local proxy process on a
//! unix socket. The proxy is supervised: every operation first obtains a
//! healthy client, restarting the proxy if it stopped answering. There is no
//! snapshot access through this API, so versioning is unavailable.

mod health;
mod launcher;

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    bollard::{
        Docker,
        container::{
            Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
            ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
            StopContainerOptions,
        },
        exec::{CreateExecOptions, StartExecResults},
        image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions},
        models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig},
    },
    botbox_config::BotboxConfig,
    futures::StreamExt,
    tracing::{debug, info},
};

pub use self::{
    health::{Relaunch, Supervisor},
    launcher::ProxyLauncher,
};

use crate::{
    error::{Error, Result},
    service::RuntimeService,
    types::{
        BindMount, Capabilities, ContainerInfo, ContainerSpec, DeleteContainerOptions,
        ExecOutput, ExecRequest, ImageInfo, StopOptions, TaskInfo, TaskState,
    },
};

const BACKEND: &str = "proxy";

pub struct ProxyRuntime {
    supervisor: Supervisor<Docker>,
}

impl ProxyRuntime {
    pub fn new(config: &BotboxConfig) -> Result<Self> {
        let launcher = ProxyLauncher::new(&config.proxy, &config.storage.data_root);
        let initial = launcher::connect(launcher.socket())?;
        Ok(Self {
            supervisor: Supervisor::new(initial, Arc::new(launcher)),
        })
    }

    async fn docker(&self) -> Result<Docker> {
        self.supervisor.client().await
    }
}

fn map_not_found(kind: &'static str, id: &str) -> impl FnOnce(bollard::errors::Error) -> Error {
    let id = id.to_string();
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::not_found(kind, id),
        other => other.into(),
    }
}

fn parse_bind(bind: &str) -> Option<BindMount> {
    let mut parts = bind.split(':');
    let source = parts.next()?;
    let destination = parts.next()?;
    let read_only = parts.next().is_some_and(|opts| opts.split(',').any(|o| o == "ro"));
    Some(BindMount {
        source: PathBuf::from(source),
        destination: destination.to_string(),
        read_only,
    })
}

fn bind_arg(mount: &BindMount) -> String {
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!("{}:{}:{mode}", mount.source.display(), mount.destination)
}

fn container_info(resp: ContainerInspectResponse) -> ContainerInfo {
    let id = resp
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .or(resp.id)
        .unwrap_or_default();
    let config = resp.config.unwrap_or_default();
    let mounts = resp
        .host_config
        .and_then(|h| h.binds)
        .unwrap_or_default()
        .iter()
        .filter_map(|b| parse_bind(b))
        .collect();
    ContainerInfo {
        snapshot_key: id.clone(),
        id,
        image: config.image.unwrap_or_default(),
        snapshotter: String::new(),
        labels: config.labels.unwrap_or_default().into_iter().collect(),
        mounts,
        command: config.cmd.unwrap_or_default(),
        runtime_spec: None,
    }
}

fn task_info(container_id: &str, resp: &ContainerInspectResponse) -> Option<TaskInfo> {
    let state = resp.state.as_ref()?;
    let task_state = match state.status.as_ref()? {
        ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING => {
            TaskState::Running
        },
        ContainerStateStatusEnum::PAUSED => TaskState::Paused,
        ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD => TaskState::Stopped,
        // A created-but-never-started container has no task.
        ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::EMPTY => return None,
        ContainerStateStatusEnum::REMOVING => TaskState::Unknown,
    };
    Some(TaskInfo {
        container_id: container_id.to_string(),
        pid: state
            .pid
            .and_then(|p| u32::try_from(p).ok())
            .filter(|p| *p > 0),
        state: task_state,
    })
}

#[async_trait]
impl RuntimeService for ProxyRuntime {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: false,
            streaming_exec: false,
            host_fifo_dir: false,
        }
    }

    async fn pull_image(&self, reference: &str, _snapshotter: &str) -> Result<ImageInfo> {
        let docker = self.docker().await?;
        info!(image = reference, "pulling image through proxy");
        let mut progress = docker.create_image(
            Some(CreateImageOptions {
                from_image: reference.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = progress.next().await {
            item?;
        }
        self.get_image(reference).await
    }

    async fn get_image(&self, reference: &str) -> Result<ImageInfo> {
        let docker = self.docker().await?;
        let image = docker
            .inspect_image(reference)
            .await
            .map_err(map_not_found("image", reference))?;
        Ok(ImageInfo {
            reference: reference.to_string(),
            digest: image
                .repo_digests
                .and_then(|d| d.into_iter().next())
                .or(image.id),
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let docker = self.docker().await?;
        let images = docker
            .list_images(None::<ListImagesOptions<String>>)
            .await?;
        Ok(images
            .into_iter()
            .flat_map(|summary| {
                let digest = summary.id;
                summary.repo_tags.into_iter().map(move |tag| ImageInfo {
                    reference: tag,
                    digest: Some(digest.clone()),
                })
            })
            .collect())
    }

    async fn delete_image(&self, reference: &str) -> Result<()> {
        let docker = self.docker().await?;
        docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
            .map_err(map_not_found("image", reference))?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo> {
        let docker = self.docker().await?;
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.mounts.iter().map(bind_arg).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };
        debug!(container_id = %spec.id, image = %spec.image, "creating container through proxy");
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.id.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } => Error::already_exists("container", spec.id.clone()),
                other => other.into(),
            })?;
        self.get_container(&spec.id).await
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo> {
        let docker = self.docker().await?;
        let resp = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_not_found("container", id))?;
        Ok(container_info(resp))
    }

    async fn list_containers(&self, label: Option<(&str, &str)>) -> Result<Vec<ContainerInfo>> {
        let docker = self.docker().await?;
        let mut filters = HashMap::new();
        if let Some((k, v)) = label {
            filters.insert("label".to_string(), vec![format!("{k}={v}")]);
        }
        let summaries = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        let mut out = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            match self.get_container(&id).await {
                Ok(info) => out.push(info),
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn delete_container(&self, id: &str, _opts: DeleteContainerOptions) -> Result<()> {
        let docker = self.docker().await?;
        docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_not_found("container", id))
    }

    async fn start_task(&self, container_id: &str) -> Result<TaskInfo> {
        let docker = self.docker().await?;
        docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_not_found("container", container_id))?;
        self.task_status(container_id).await
    }

    async fn stop_task(&self, container_id: &str, opts: StopOptions) -> Result<()> {
        let docker = self.docker().await?;
        let t = i64::try_from(opts.timeout.as_secs()).unwrap_or(i64::MAX);
        docker
            .stop_container(container_id, Some(StopContainerOptions { t }))
            .await
            .map_err(map_not_found("task", container_id))?;
        if opts.force && self.task_status(container_id).await?.is_running() {
            docker
                .kill_container(
                    container_id,
                    Some(KillContainerOptions { signal: "SIGKILL" }),
                )
                .await
                .map_err(map_not_found("task", container_id))?;
        }
        Ok(())
    }

    async fn delete_task(&self, container_id: &str, force: bool) -> Result<()> {
        // The daemon has no separate task object; only a running process needs
        // handling.
        let status = self.task_status(container_id).await?;
        if status.is_running() {
            if !force {
                return Err(Error::message(format!("task {container_id} is running")));
            }
            let docker = self.docker().await?;
            docker
                .kill_container(
                    container_id,
                    Some(KillContainerOptions { signal: "SIGKILL" }),
                )
                .await?;
        }
        Ok(())
    }

    async fn task_status(&self, container_id: &str) -> Result<TaskInfo> {
        let docker = self.docker().await?;
        let resp = docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_not_found("container", container_id))?;
        task_info(container_id, &resp).ok_or_else(|| Error::not_found("task", container_id))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskInfo>> {
        let docker = self.docker().await?;
        let summaries = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        let mut out = Vec::new();
        for id in summaries.into_iter().filter_map(|s| s.id) {
            match self.task_status(&id).await {
                Ok(task) => out.push(task),
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn exec(&self, req: &ExecRequest) -> Result<ExecOutput> {
        let docker = self.docker().await?;
        let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let exec = docker
            .create_exec(&req.container_id, CreateExecOptions {
                cmd: Some(exec_argv(req)),
                env: (!env.is_empty()).then_some(env),
                working_dir: req.workdir.clone(),
                tty: Some(req.terminal),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            })
            .await
            .map_err(map_not_found("container", &req.container_id))?;

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } =
                docker.start_exec(&exec.id, None).await?
            {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        },
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        },
                        LogOutput::StdIn { .. } => {},
                    }
                }
            }
            Ok::<_, Error>((stdout, stderr))
        };
        let timed_out =
            |limit: Duration| Error::timeout(format!("exec in {}", req.container_id), limit.as_secs());
        let (stdout, stderr) = match req.timeout {
            // The in-container `timeout` kills the process; this only guards
            // against a daemon that never closes the stream.
            Some(limit) => tokio::time::timeout(limit + EXEC_KILL_GRACE, collect)
                .await
                .map_err(|_| timed_out(limit))??,
            None => collect.await?,
        };

        let inspect = docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect
            .exit_code
            .and_then(|c| i32::try_from(c).ok())
            .ok_or_else(|| {
                Error::message(format!("exec in {} reported no exit code", req.container_id))
            })?;
        if let Some(limit) = req.timeout
            && exit_code == TIMEOUT_KILLED_EXIT
        {
            return Err(timed_out(limit));
        }
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn setup_network(&self, container_id: &str) -> Result<()> {
        debug!(container_id, "network is managed by the proxy daemon");
        Ok(())
    }

    async fn remove_network(&self, container_id: &str) -> Result<()> {
        debug!(container_id, "network is managed by the proxy daemon");
        Ok(())
    }
}

/// Exit status of `timeout -s KILL` when it had to kill the command.
const TIMEOUT_KILLED_EXIT: i32 = 137;
const EXEC_KILL_GRACE: Duration = Duration::from_secs(5);

/// Exec argv, wrapped in `timeout -s KILL` when the request has a deadline so
/// the process dies with it. The daemon API has no way to kill an exec.
fn exec_argv(req: &ExecRequest) -> Vec<String> {
    let Some(limit) = req.timeout else {
        return req.args.clone();
    };
    let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
    let mut argv = vec![
        "timeout".to_string(),
        "-s".into(),
        "KILL".into(),
        secs.max(1).to_string(),
    ];
    argv.extend(req.args.iter().cloned());
    argv
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bollard::models::{ContainerConfig, ContainerState},
    };

    #[test]
    fn timed_exec_is_wrapped_in_timeout() {
        let mut req = ExecRequest::new("c1", vec!["sleep".into(), "60".into()]);
        assert_eq!(exec_argv(&req), vec!["sleep", "60"]);

        req.timeout = Some(Duration::from_millis(1500));
        assert_eq!(exec_argv(&req), vec!["timeout", "-s", "KILL", "2", "sleep", "60"]);

        req.timeout = Some(Duration::from_millis(10));
        assert_eq!(exec_argv(&req)[3], "1");
    }

    fn offline_runtime() -> (tempfile::TempDir, ProxyRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BotboxConfig::default();
        config.storage.data_root = dir.path().to_path_buf();
        let rt = ProxyRuntime::new(&config).unwrap();
        (dir, rt)
    }

    #[tokio::test]
    async fn snapshot_operations_are_not_supported() {
        let (_dir, rt) = offline_runtime();
        assert!(
            rt.commit_snapshot("overlayfs", "v1", "c1")
                .await
                .unwrap_err()
                .is_not_supported()
        );
        assert!(
            rt.list_snapshots("overlayfs")
                .await
                .unwrap_err()
                .is_not_supported()
        );
        assert!(
            rt.create_container_from_snapshot(&ContainerSpec::default(), "k")
                .await
                .unwrap_err()
                .is_not_supported()
        );
        assert!(!rt.capabilities().snapshots);
    }

    #[tokio::test]
    async fn network_calls_are_noops() {
        let (_dir, rt) = offline_runtime();
        rt.setup_network("botbox-t1").await.unwrap();
        rt.remove_network("botbox-t1").await.unwrap();
    }

    #[test]
    fn parses_binds() {
        let rw = parse_bind("/srv/bots/t1:/data").unwrap();
        assert!(!rw.read_only);
        assert_eq!(rw.destination, "/data");
        let ro = parse_bind("/etc/resolv.conf:/etc/resolv.conf:ro").unwrap();
        assert!(ro.read_only);
        assert!(parse_bind("nodest").is_none());
        assert_eq!(bind_arg(&ro), "/etc/resolv.conf:/etc/resolv.conf:ro");
    }

    #[test]
    fn maps_inspect_response() {
        let resp = ContainerInspectResponse {
            id: Some("abc123".into()),
            name: Some("/botbox-t1".into()),
            config: Some(ContainerConfig {
                image: Some("debian".into()),
                labels: Some(HashMap::from([("botbox.bot-id".into(), "t1".into())])),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                binds: Some(vec!["/srv/t1:/data:rw".into()]),
                ..Default::default()
            }),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                pid: Some(321),
                ..Default::default()
            }),
            ..Default::default()
        };
        let task = task_info("botbox-t1", &resp).unwrap();
        assert_eq!(task.pid, Some(321));
        assert!(task.is_running());

        let info = container_info(resp);
        assert_eq!(info.id, "botbox-t1");
        assert_eq!(info.bot_id(), Some("t1"));
        assert_eq!(info.mounts.len(), 1);
    }

    #[test]
    fn created_container_has_no_task() {
        let resp = ContainerInspectResponse {
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::CREATED),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(task_info("c", &resp).is_none());
    }
}
