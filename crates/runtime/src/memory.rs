//! In-memory runtime for tests and dry runs. No processes, no persistence.
//!
//! Containers share a flat file map per active snapshot, and exec understands
//! a handful of shell-like builtins (`write`, `cat`, `rm`, `ls`, `echo`,
//! `printenv`, `pwd`, `exit`, `true`, `false`) so lifecycle and versioning
//! behavior can be observed without a real runtime.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use {async_trait::async_trait, tokio::io::AsyncWriteExt};

use crate::{
    error::{Error, Result},
    service::RuntimeService,
    types::{
        Capabilities, ContainerInfo, ContainerSpec, DeleteContainerOptions, ExecOutput,
        ExecRequest, ExecStreams, ImageInfo, MountDescriptor, SnapshotInfo, SnapshotKind,
        StopOptions, TaskInfo, TaskState,
    },
};

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
struct Snapshot {
    parent: Option<String>,
    kind: SnapshotKind,
    files: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    images: BTreeMap<String, ImageInfo>,
    containers: BTreeMap<String, ContainerInfo>,
    tasks: BTreeMap<String, TaskInfo>,
    /// Keyed by `(snapshotter, key)`.
    snapshots: BTreeMap<(String, String), Snapshot>,
    networks: BTreeSet<String>,
    next_pid: u32,
    fail_network: bool,
    fail_network_removal: bool,
    fail_task_stop: bool,
    fail_task_delete: bool,
}

pub struct MemoryRuntime {
    state: Mutex<State>,
    snapshots: bool,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: 1000,
                ..Default::default()
            }),
            snapshots: true,
        }
    }

    /// A runtime whose snapshot operations all return `NotSupported`, like
    /// the daemon proxy backend.
    pub fn without_snapshots() -> Self {
        Self {
            snapshots: false,
            ..Self::new()
        }
    }

    /// Make every subsequent `setup_network` fail.
    pub fn fail_network_setup(&self, fail: bool) {
        self.lock().fail_network = fail;
    }

    /// Make every subsequent `remove_network` fail, leaving the attachment.
    pub fn fail_network_removal(&self, fail: bool) {
        self.lock().fail_network_removal = fail;
    }

    /// Make every subsequent `stop_task` fail, leaving the task running.
    pub fn fail_task_stop(&self, fail: bool) {
        self.lock().fail_task_stop = fail;
    }

    /// Make every subsequent `delete_task` on an existing task fail.
    pub fn fail_task_delete(&self, fail: bool) {
        self.lock().fail_task_delete = fail;
    }

    pub fn network_attached(&self, container_id: &str) -> bool {
        self.lock().networks.contains(container_id)
    }

    /// Read a file from the container's current root filesystem.
    pub fn read_file(&self, container_id: &str, path: &str) -> Option<String> {
        let state = self.lock();
        let info = state.containers.get(container_id)?;
        state
            .snapshots
            .get(&(info.snapshotter.clone(), info.snapshot_key.clone()))?
            .files
            .get(path)
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_snapshots(&self, operation: &'static str) -> Result<()> {
        if self.snapshots {
            Ok(())
        } else {
            Err(Error::not_supported(BACKEND, operation))
        }
    }

    fn run(&self, req: &ExecRequest) -> Result<ExecOutput> {
        let mut state = self.lock();
        let info = state
            .containers
            .get(&req.container_id)
            .cloned()
            .ok_or_else(|| Error::not_found("container", req.container_id.clone()))?;
        match state.tasks.get(&req.container_id) {
            Some(task) if task.is_running() => {},
            Some(_) => {
                return Err(Error::message(format!(
                    "task {} is not running",
                    req.container_id
                )));
            },
            None => return Err(Error::not_found("task", req.container_id.clone())),
        }
        let snapshot = state
            .snapshots
            .get_mut(&(info.snapshotter.clone(), info.snapshot_key.clone()))
            .ok_or_else(|| Error::not_found("snapshot", info.snapshot_key.clone()))?;
        Ok(run_builtin(req, &mut snapshot.files))
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn run_builtin(req: &ExecRequest, files: &mut BTreeMap<String, String>) -> ExecOutput {
    let words: Vec<String> = match req.args.as_slice() {
        [sh, flag, script] if sh.ends_with("sh") && flag == "-c" => {
            script.split_whitespace().map(String::from).collect()
        },
        args => args.to_vec(),
    };
    let mut env: BTreeMap<String, String> = req.env.iter().cloned().collect();
    let mut words = words.as_slice();
    if words.first().is_some_and(|w| w == "env") {
        words = &words[1..];
        while let Some((k, v)) = words.first().and_then(|w| w.split_once('=')) {
            env.insert(k.to_string(), v.to_string());
            words = &words[1..];
        }
    }

    let ok = |stdout: String| ExecOutput {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    };
    let fail = |stderr: String, exit_code: i32| ExecOutput {
        stdout: String::new(),
        stderr,
        exit_code,
    };

    match words {
        [] => ok(String::new()),
        [cmd, path, content @ ..] if cmd == "write" => {
            files.insert(path.clone(), content.join(" "));
            ok(String::new())
        },
        [cmd, path] if cmd == "cat" => match files.get(path) {
            Some(content) => ok(content.clone()),
            None => fail(format!("cat: {path}: No such file or directory\n"), 1),
        },
        [cmd, path] if cmd == "rm" => match files.remove(path) {
            Some(_) => ok(String::new()),
            None => fail(format!("rm: cannot remove '{path}': No such file or directory\n"), 1),
        },
        [cmd] if cmd == "ls" => {
            let mut out = String::new();
            for path in files.keys() {
                out.push_str(path);
                out.push('\n');
            }
            ok(out)
        },
        [cmd, rest @ ..] if cmd == "echo" => ok(format!("{}\n", rest.join(" "))),
        [cmd, name] if cmd == "printenv" => match env.get(name) {
            Some(value) => ok(format!("{value}\n")),
            None => fail(String::new(), 1),
        },
        [cmd] if cmd == "pwd" => ok(format!("{}\n", req.workdir.as_deref().unwrap_or("/"))),
        [cmd] if cmd == "true" => ok(String::new()),
        [cmd] if cmd == "false" => fail(String::new(), 1),
        [cmd, code] if cmd == "exit" => fail(String::new(), code.parse().unwrap_or(2)),
        [cmd, ..] => fail(format!("{cmd}: command not found\n"), 127),
    }
}

#[async_trait]
impl RuntimeService for MemoryRuntime {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: self.snapshots,
            streaming_exec: true,
            host_fifo_dir: false,
        }
    }

    async fn pull_image(&self, reference: &str, _snapshotter: &str) -> Result<ImageInfo> {
        let image = ImageInfo {
            reference: reference.to_string(),
            digest: Some(format!("sha256:{:064x}", reference.len())),
        };
        self.lock()
            .images
            .insert(reference.to_string(), image.clone());
        Ok(image)
    }

    async fn get_image(&self, reference: &str) -> Result<ImageInfo> {
        self.lock()
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::not_found("image", reference))
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.lock().images.values().cloned().collect())
    }

    async fn delete_image(&self, reference: &str) -> Result<()> {
        match self.lock().images.remove(reference) {
            Some(_) => Ok(()),
            None => Err(Error::not_found("image", reference)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo> {
        let mut state = self.lock();
        if !state.images.contains_key(&spec.image) {
            return Err(Error::not_found("image", spec.image.clone()));
        }
        if state.containers.contains_key(&spec.id) {
            return Err(Error::already_exists("container", spec.id.clone()));
        }
        let key = (spec.snapshotter.clone(), spec.id.clone());
        if state.snapshots.contains_key(&key) {
            return Err(Error::already_exists("snapshot", spec.id.clone()));
        }
        state.snapshots.insert(key, Snapshot {
            parent: None,
            kind: SnapshotKind::Active,
            files: BTreeMap::new(),
        });
        let info = container_info(spec, &spec.id);
        state.containers.insert(spec.id.clone(), info.clone());
        Ok(info)
    }

    async fn create_container_from_snapshot(
        &self,
        spec: &ContainerSpec,
        snapshot_key: &str,
    ) -> Result<ContainerInfo> {
        self.require_snapshots("create container from snapshot")?;
        let mut state = self.lock();
        if state.containers.contains_key(&spec.id) {
            return Err(Error::already_exists("container", spec.id.clone()));
        }
        match state
            .snapshots
            .get(&(spec.snapshotter.clone(), snapshot_key.to_string()))
        {
            Some(snap) if snap.kind == SnapshotKind::Active => {},
            Some(_) => {
                return Err(Error::message(format!(
                    "snapshot {snapshot_key} is not active"
                )));
            },
            None => return Err(Error::not_found("snapshot", snapshot_key)),
        }
        let info = container_info(spec, snapshot_key);
        state.containers.insert(spec.id.clone(), info.clone());
        Ok(info)
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo> {
        self.lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("container", id))
    }

    async fn list_containers(&self, label: Option<(&str, &str)>) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|c| match label {
                Some((k, v)) => c.labels.get(k).is_some_and(|val| val == v),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn delete_container(&self, id: &str, opts: DeleteContainerOptions) -> Result<()> {
        let mut state = self.lock();
        if state.tasks.contains_key(id) {
            return Err(Error::message(format!("container {id} still has a task")));
        }
        let info = state
            .containers
            .remove(id)
            .ok_or_else(|| Error::not_found("container", id))?;
        if opts.cleanup_snapshot {
            state
                .snapshots
                .remove(&(info.snapshotter, info.snapshot_key));
        }
        Ok(())
    }

    async fn start_task(&self, container_id: &str) -> Result<TaskInfo> {
        let mut state = self.lock();
        if !state.containers.contains_key(container_id) {
            return Err(Error::not_found("container", container_id));
        }
        if state.tasks.contains_key(container_id) {
            return Err(Error::already_exists("task", container_id));
        }
        state.next_pid += 1;
        let task = TaskInfo {
            container_id: container_id.to_string(),
            pid: Some(state.next_pid),
            state: TaskState::Running,
        };
        state.tasks.insert(container_id.to_string(), task.clone());
        Ok(task)
    }

    async fn stop_task(&self, container_id: &str, _opts: StopOptions) -> Result<()> {
        let mut state = self.lock();
        let fail = state.fail_task_stop;
        let task = state
            .tasks
            .get_mut(container_id)
            .ok_or_else(|| Error::not_found("task", container_id))?;
        if fail {
            return Err(Error::message("injected task stop failure"));
        }
        task.state = TaskState::Stopped;
        task.pid = None;
        Ok(())
    }

    async fn delete_task(&self, container_id: &str, force: bool) -> Result<()> {
        let mut state = self.lock();
        match state.tasks.get(container_id) {
            None => Err(Error::not_found("task", container_id)),
            Some(_) if state.fail_task_delete => {
                Err(Error::message("injected task delete failure"))
            },
            Some(task) if task.is_running() && !force => Err(Error::message(format!(
                "task {container_id} is running"
            ))),
            Some(_) => {
                state.tasks.remove(container_id);
                Ok(())
            },
        }
    }

    async fn task_status(&self, container_id: &str) -> Result<TaskInfo> {
        self.lock()
            .tasks
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", container_id))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskInfo>> {
        Ok(self.lock().tasks.values().cloned().collect())
    }

    async fn exec(&self, req: &ExecRequest) -> Result<ExecOutput> {
        self.run(req)
    }

    async fn exec_streaming(&self, req: &ExecRequest, mut streams: ExecStreams) -> Result<i32> {
        let output = self.run(req)?;
        streams.stdout.write_all(output.stdout.as_bytes()).await?;
        streams.stdout.flush().await?;
        streams.stderr.write_all(output.stderr.as_bytes()).await?;
        streams.stderr.flush().await?;
        Ok(output.exit_code)
    }

    async fn commit_snapshot(&self, snapshotter: &str, name: &str, key: &str) -> Result<()> {
        self.require_snapshots("commit snapshot")?;
        let mut state = self.lock();
        let name_key = (snapshotter.to_string(), name.to_string());
        if state.snapshots.contains_key(&name_key) {
            return Err(Error::already_exists("snapshot", name));
        }
        let active_key = (snapshotter.to_string(), key.to_string());
        match state.snapshots.get(&active_key) {
            Some(snap) if snap.kind == SnapshotKind::Active => {},
            Some(_) => return Err(Error::message(format!("snapshot {key} is not active"))),
            None => return Err(Error::not_found("snapshot", key)),
        }
        if let Some(mut snap) = state.snapshots.remove(&active_key) {
            snap.kind = SnapshotKind::Committed;
            state.snapshots.insert(name_key, snap);
        }
        Ok(())
    }

    async fn list_snapshots(&self, snapshotter: &str) -> Result<Vec<SnapshotInfo>> {
        self.require_snapshots("list snapshots")?;
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|((s, _), _)| s == snapshotter)
            .map(|((_, key), snap)| SnapshotInfo {
                key: key.clone(),
                parent: snap.parent.clone(),
                kind: snap.kind,
            })
            .collect())
    }

    async fn prepare_snapshot(
        &self,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<MountDescriptor>> {
        self.require_snapshots("prepare snapshot")?;
        let mut state = self.lock();
        let new_key = (snapshotter.to_string(), key.to_string());
        if state.snapshots.contains_key(&new_key) {
            return Err(Error::already_exists("snapshot", key));
        }
        let files = match state
            .snapshots
            .get(&(snapshotter.to_string(), parent.to_string()))
        {
            Some(snap) if snap.kind == SnapshotKind::Committed => snap.files.clone(),
            Some(_) => {
                return Err(Error::message(format!(
                    "parent snapshot {parent} is not committed"
                )));
            },
            None => return Err(Error::not_found("snapshot", parent)),
        };
        state.snapshots.insert(new_key, Snapshot {
            parent: Some(parent.to_string()),
            kind: SnapshotKind::Active,
            files,
        });
        Ok(Vec::new())
    }

    async fn snapshot_mounts(&self, snapshotter: &str, key: &str) -> Result<Vec<MountDescriptor>> {
        self.require_snapshots("snapshot mounts")?;
        if self
            .lock()
            .snapshots
            .contains_key(&(snapshotter.to_string(), key.to_string()))
        {
            Ok(Vec::new())
        } else {
            Err(Error::not_found("snapshot", key))
        }
    }

    async fn setup_network(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_network {
            return Err(Error::network("injected network failure"));
        }
        if !state
            .tasks
            .get(container_id)
            .is_some_and(TaskInfo::is_running)
        {
            return Err(Error::network(format!(
                "container {container_id} has no running task"
            )));
        }
        state.networks.insert(container_id.to_string());
        Ok(())
    }

    async fn remove_network(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_network_removal {
            return Err(Error::network("injected network removal failure"));
        }
        state.networks.remove(container_id);
        Ok(())
    }
}

fn container_info(spec: &ContainerSpec, snapshot_key: &str) -> ContainerInfo {
    ContainerInfo {
        id: spec.id.clone(),
        image: spec.image.clone(),
        snapshotter: spec.snapshotter.clone(),
        snapshot_key: snapshot_key.to_string(),
        labels: spec.labels.clone(),
        mounts: spec.mounts.clone(),
        command: spec.command.clone(),
        runtime_spec: spec.runtime_spec.clone(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn running(rt: &MemoryRuntime, id: &str) {
        rt.pull_image("img", "overlayfs").await.unwrap();
        rt.create_container(&ContainerSpec {
            id: id.into(),
            image: "img".into(),
            snapshotter: "overlayfs".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        rt.start_task(id).await.unwrap();
    }

    fn sh(id: &str, script: &str) -> ExecRequest {
        ExecRequest::new(id, vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn exec_builtins_touch_snapshot_files() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;

        assert_eq!(rt.exec(&sh("c1", "write /x hello world")).await.unwrap().exit_code, 0);
        let out = rt.exec(&sh("c1", "cat /x")).await.unwrap();
        assert_eq!(out.stdout, "hello world");
        assert_eq!(rt.read_file("c1", "/x").as_deref(), Some("hello world"));

        let missing = rt.exec(&sh("c1", "cat /nope")).await.unwrap();
        assert_eq!(missing.exit_code, 1);
        assert!(missing.stderr.contains("No such file"));

        let unknown = rt.exec(&sh("c1", "frobnicate")).await.unwrap();
        assert_eq!(unknown.exit_code, 127);
    }

    #[tokio::test]
    async fn exec_applies_env_and_workdir() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;
        let mut req = ExecRequest::new("c1", vec!["printenv".into(), "FOO".into()]);
        req.env = vec![("FOO".into(), "bar".into())];
        assert_eq!(rt.exec(&req).await.unwrap().stdout, "bar\n");

        let mut req = ExecRequest::new("c1", vec!["pwd".into()]);
        req.workdir = Some("/data".into());
        assert_eq!(rt.exec(&req).await.unwrap().stdout, "/data\n");
    }

    #[tokio::test]
    async fn exec_requires_running_task() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;
        rt.stop_task("c1", StopOptions::default()).await.unwrap();
        assert!(rt.exec(&sh("c1", "ls")).await.is_err());
        rt.delete_task("c1", false).await.unwrap();
        assert!(rt.exec(&sh("c1", "ls")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn commit_and_prepare_carry_files_forward() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;
        rt.exec(&sh("c1", "write /state v1")).await.unwrap();

        rt.stop_task("c1", StopOptions::default()).await.unwrap();
        rt.delete_task("c1", false).await.unwrap();
        let info = rt.get_container("c1").await.unwrap();
        rt.delete_container("c1", DeleteContainerOptions::default())
            .await
            .unwrap();
        rt.commit_snapshot("overlayfs", "c1-v1", &info.snapshot_key)
            .await
            .unwrap();
        rt.prepare_snapshot("overlayfs", "c1-active-1", "c1-v1")
            .await
            .unwrap();
        let spec = ContainerSpec::from_info(&info);
        rt.create_container_from_snapshot(&spec, "c1-active-1")
            .await
            .unwrap();
        assert_eq!(rt.read_file("c1", "/state").as_deref(), Some("v1"));

        let snaps = rt.list_snapshots("overlayfs").await.unwrap();
        let active = snaps.iter().find(|s| s.key == "c1-active-1").unwrap();
        assert_eq!(active.parent.as_deref(), Some("c1-v1"));
        assert_eq!(active.kind, SnapshotKind::Active);
    }

    #[tokio::test]
    async fn delete_container_with_task_fails() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;
        assert!(
            rt.delete_container("c1", DeleteContainerOptions::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn without_snapshots_reports_not_supported() {
        let rt = MemoryRuntime::without_snapshots();
        let err = rt.commit_snapshot("overlayfs", "a", "b").await.unwrap_err();
        assert!(err.is_not_supported());
        assert!(!rt.capabilities().snapshots);
    }

    #[tokio::test]
    async fn network_requires_running_task_and_is_idempotent() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;
        rt.setup_network("c1").await.unwrap();
        rt.setup_network("c1").await.unwrap();
        assert!(rt.network_attached("c1"));
        rt.remove_network("c1").await.unwrap();
        assert!(!rt.network_attached("c1"));

        rt.fail_network_setup(true);
        assert!(matches!(
            rt.setup_network("c1").await.unwrap_err(),
            Error::Network { .. }
        ));
    }

    #[tokio::test]
    async fn injected_task_failures_leave_state_untouched() {
        let rt = MemoryRuntime::new();
        running(&rt, "c1").await;
        rt.setup_network("c1").await.unwrap();

        rt.fail_network_removal(true);
        rt.fail_task_stop(true);
        rt.fail_task_delete(true);
        assert!(rt.remove_network("c1").await.is_err());
        assert!(rt.network_attached("c1"));
        assert!(rt.stop_task("c1", StopOptions::default()).await.is_err());
        assert!(rt.task_status("c1").await.unwrap().is_running());
        assert!(rt.delete_task("c1", true).await.is_err());
        // Missing tasks still report not-found.
        assert!(rt.delete_task("other", true).await.unwrap_err().is_not_found());

        rt.fail_task_delete(false);
        rt.delete_task("c1", true).await.unwrap();
        assert!(rt.task_status("c1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_containers_filters_by_label() {
        let rt = MemoryRuntime::new();
        rt.pull_image("img", "overlayfs").await.unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("botbox.bot-id".to_string(), "t1".to_string());
        rt.create_container(&ContainerSpec {
            id: "a".into(),
            image: "img".into(),
            snapshotter: "overlayfs".into(),
            labels,
            ..Default::default()
        })
        .await
        .unwrap();
        rt.create_container(&ContainerSpec {
            id: "b".into(),
            image: "img".into(),
            snapshotter: "overlayfs".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let found = rt
            .list_containers(Some(("botbox.bot-id", "t1")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
        assert_eq!(rt.list_containers(None).await.unwrap().len(), 2);
    }
}
