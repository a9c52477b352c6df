//! Numbered versions: commit the live filesystem, recreate the container on
//! a fresh writable layer, and roll back to any earlier version.
//!
//! Neither operation is atomic across the runtime and the store. When a step
//! fails the container may be left stopped or deleted; [`BotManager::start`]
//! recreates a deleted container.

use std::time::Instant;

use {
    botbox_runtime::{
        ContainerInfo, ContainerSpec, DeleteContainerOptions, StopOptions, VERSION_LABEL,
    },
    botbox_store::{ContainerStatus, EventKind, NewEvent, NewSnapshot, VersionInfo},
    serde_json::json,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use botbox_metrics::{counter, histogram, versions as version_metrics};

use crate::{
    error::{Error, Result, RuntimeResultExt},
    manager::BotManager,
};

impl BotManager {
    /// Commit the bot's live filesystem as the next version.
    ///
    /// The container is recreated on a new writable layer derived from the
    /// committed snapshot, and its task restarted if it was running.
    pub async fn create_version(&self, bot_id: &str) -> Result<VersionInfo> {
        let container_id = self.container_id(bot_id)?;
        let started = Instant::now();
        if self.store.get_bot(bot_id).await?.is_none() {
            return Err(Error::BotNotFound {
                bot_id: bot_id.to_string(),
            });
        }
        self.require_snapshots("create version", &container_id)?;

        let info = self.live_container(bot_id, &container_id).await?;
        let was_running = self.take_down_task(&container_id).await?;
        let bot_dir = self.config.bot_dir(bot_id);
        self.mirror(bot_id, &info, ContainerStatus::Stopped, &bot_dir)
            .await?;

        let parent = self.snapshot_parent(&info).await;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{container_id}-{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%6f"),
            &suffix[..8]
        );
        self.runtime
            .commit_snapshot(&info.snapshotter, &name, &info.snapshot_key)
            .await
            .op("commit snapshot", &container_id)?;
        debug!(container_id, snapshot = %name, "snapshot committed");

        let mut spec = ContainerSpec::from_info(&info);
        spec.labels.remove(VERSION_LABEL);
        // The live layer was consumed by the commit.
        let replaced = self.replace_container(&spec, &name, false).await?;
        self.mirror(bot_id, &replaced, ContainerStatus::Stopped, &bot_dir)
            .await?;

        let version = self
            .store
            .record_version(&NewSnapshot {
                container_id: container_id.clone(),
                name: name.clone(),
                parent,
                snapshotter: info.snapshotter.clone(),
            })
            .await?;

        self.resume(bot_id, &container_id, was_running).await?;
        self.record_event(bot_id, &container_id, EventKind::VersionCreate, json!({
            "version": version.version,
            "snapshot": name,
        }))
        .await;

        #[cfg(feature = "metrics")]
        {
            counter!(version_metrics::CREATED_TOTAL).increment(1);
            histogram!(version_metrics::CREATE_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
        }
        info!(
            bot_id,
            container_id,
            version = version.version,
            snapshot = %name,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "version created"
        );
        Ok(version)
    }

    /// Versions of the bot's container, newest first.
    pub async fn list_versions(&self, bot_id: &str) -> Result<Vec<VersionInfo>> {
        let container_id = self.container_id(bot_id)?;
        Ok(self.store.list_versions(&container_id).await?)
    }

    /// Recreate the bot's container from the snapshot of `version`.
    ///
    /// No new version is allocated; the previous writable layer is discarded.
    pub async fn rollback_version(&self, bot_id: &str, version: i64) -> Result<()> {
        let container_id = self.container_id(bot_id)?;
        self.require_snapshots("rollback version", &container_id)?;
        let snapshot = self
            .store
            .get_version_snapshot(&container_id, version)
            .await?
            .ok_or_else(|| Error::VersionNotFound {
                container_id: container_id.clone(),
                version,
            })?;

        let info = self.live_container(bot_id, &container_id).await?;
        let was_running = self.take_down_task(&container_id).await?;

        let mut spec = ContainerSpec::from_info(&info);
        spec.snapshotter = snapshot.snapshotter.clone();
        spec.labels
            .insert(VERSION_LABEL.to_string(), version.to_string());
        let replaced = self.replace_container(&spec, &snapshot.name, true).await?;
        self.mirror(
            bot_id,
            &replaced,
            ContainerStatus::Stopped,
            &self.config.bot_dir(bot_id),
        )
        .await?;

        self.resume(bot_id, &container_id, was_running).await?;
        self.record_event(bot_id, &container_id, EventKind::VersionRollback, json!({
            "version": version,
            "snapshot": snapshot.name,
        }))
        .await;

        #[cfg(feature = "metrics")]
        counter!(version_metrics::ROLLBACKS_TOTAL).increment(1);
        info!(bot_id, container_id, version, snapshot = %snapshot.name, "rolled back");
        Ok(())
    }

    fn require_snapshots(&self, operation: &'static str, container_id: &str) -> Result<()> {
        if self.runtime.capabilities().snapshots {
            return Ok(());
        }
        Err(Error::runtime(
            operation,
            container_id,
            botbox_runtime::Error::not_supported(self.runtime.backend_name(), "snapshots"),
        ))
    }

    async fn live_container(&self, bot_id: &str, container_id: &str) -> Result<ContainerInfo> {
        match self.runtime.get_container(container_id).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_not_found() => Err(Error::ContainerNotFound {
                bot_id: bot_id.to_string(),
            }),
            Err(e) => Err(Error::runtime("get container", container_id, e)),
        }
    }

    /// Stop and delete the container's task. A missing task counts as
    /// stopped. Returns whether it was running.
    async fn take_down_task(&self, container_id: &str) -> Result<bool> {
        let was_running = match self.runtime.task_status(container_id).await {
            Ok(task) => task.is_running(),
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(Error::runtime("task status", container_id, e)),
        };
        if was_running {
            if let Err(e) = self.runtime.remove_network(container_id).await {
                warn!(container_id, error = %e, "network removal failed, continuing");
            }
        }
        let opts = StopOptions {
            timeout: self.config.stop_timeout,
            force: true,
        };
        match self.runtime.stop_task(container_id, opts).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(Error::runtime("stop task", container_id, e)),
        }
        match self.runtime.delete_task(container_id, true).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => {},
            Err(e) => return Err(Error::runtime("delete task", container_id, e)),
        }
        Ok(was_running)
    }

    /// Prepare a fresh writable layer from `parent`, then swap the container
    /// onto it under the same ID. Returns the recreated container.
    async fn replace_container(
        &self,
        spec: &ContainerSpec,
        parent: &str,
        discard_live_layer: bool,
    ) -> Result<ContainerInfo> {
        let container_id = spec.id.as_str();
        let active_key = format!("{container_id}-active-{}", uuid::Uuid::new_v4().simple());
        self.runtime
            .prepare_snapshot(&spec.snapshotter, &active_key, parent)
            .await
            .op("prepare snapshot", container_id)?;

        self.runtime
            .delete_container(container_id, DeleteContainerOptions {
                cleanup_snapshot: discard_live_layer,
            })
            .await
            .op("delete container", container_id)?;

        let info = self
            .runtime
            .create_container_from_snapshot(spec, &active_key)
            .await
            .op("create container from snapshot", container_id)?;
        debug!(container_id, snapshot = %info.snapshot_key, parent, "container recreated");
        Ok(info)
    }

    /// Restart the task when it ran before the version operation.
    async fn resume(&self, bot_id: &str, container_id: &str, was_running: bool) -> Result<()> {
        if !was_running {
            return Ok(());
        }
        self.launch(container_id).await?;
        self.mark_status(container_id, ContainerStatus::Running)
            .await;
        debug!(bot_id, container_id, "task restarted");
        Ok(())
    }

    async fn snapshot_parent(&self, info: &ContainerInfo) -> Option<String> {
        match self.runtime.list_snapshots(&info.snapshotter).await {
            Ok(snapshots) => snapshots
                .into_iter()
                .find(|s| s.key == info.snapshot_key)
                .and_then(|s| s.parent),
            Err(e) => {
                debug!(container_id = %info.id, error = %e, "could not resolve snapshot parent");
                None
            },
        }
    }

    async fn record_event(
        &self,
        bot_id: &str,
        container_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        let event = NewEvent {
            container_id: container_id.to_string(),
            bot_id: bot_id.to_string(),
            kind,
            payload,
        };
        if let Err(e) = self.store.insert_event(&event).await {
            warn!(bot_id, container_id, %kind, error = %e, "failed to record lifecycle event");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        super::*,
        crate::{manager::ExecCommand, testing},
        botbox_runtime::{MemoryRuntime, RuntimeService},
        botbox_store::{BotStore, InMemoryStore, SqliteStore},
    };

    async fn sqlite_store() -> Arc<dyn BotStore> {
        Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn versions_increase_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rt) = testing::manager(dir.path());
        mgr.ensure_exists("t1").await.unwrap();

        for expected in 1..=3 {
            let v = mgr.create_version("t1").await.unwrap();
            assert_eq!(v.version, expected);
            let listed = mgr.list_versions("t1").await.unwrap();
            assert_eq!(listed[0].version, v.version);
        }
        let numbers: Vec<i64> = mgr
            .list_versions("t1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn rollback_restores_earlier_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, rt) = testing::manager_with(MemoryRuntime::new(), sqlite_store().await, dir.path());
        mgr.start("t1").await.unwrap();

        mgr.exec_with_capture("t1", &ExecCommand::shell("write /state X"))
            .await
            .unwrap();
        let checkpoint = mgr.create_version("t1").await.unwrap();
        mgr.exec_with_capture("t1", &ExecCommand::shell("write /state Y"))
            .await
            .unwrap();
        assert_eq!(rt.read_file("botbox-t1", "/state").as_deref(), Some("Y"));

        mgr.rollback_version("t1", checkpoint.version).await.unwrap();
        assert_eq!(rt.read_file("botbox-t1", "/state").as_deref(), Some("X"));
        let container = rt.get_container("botbox-t1").await.unwrap();
        assert_eq!(
            container.labels.get(VERSION_LABEL).map(String::as_str),
            Some(checkpoint.version.to_string().as_str())
        );

        let out = mgr
            .exec_with_capture("t1", &ExecCommand::new(["cat", "/state"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "X");
    }

    #[tokio::test]
    async fn rollback_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rt) = testing::manager_with(MemoryRuntime::new(), sqlite_store().await, dir.path());
        mgr.start("t1").await.unwrap();

        assert_eq!(mgr.create_version("t1").await.unwrap().version, 1);
        assert_eq!(mgr.create_version("t1").await.unwrap().version, 2);
        mgr.rollback_version("t1", 1).await.unwrap();

        let numbers: Vec<i64> = mgr
            .list_versions("t1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![2, 1]);

        let events = mgr.list_events("t1", None).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::VersionRollback);
        assert_eq!(last.payload["version"], 1);
    }

    #[tokio::test]
    async fn running_task_survives_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, rt) = testing::manager(dir.path());
        mgr.start("t1").await.unwrap();

        mgr.create_version("t1").await.unwrap();
        assert!(rt.task_status("botbox-t1").await.unwrap().is_running());
        assert!(rt.network_attached("botbox-t1"));
    }

    #[tokio::test]
    async fn stopped_container_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, rt) = testing::manager(dir.path());
        mgr.start("t1").await.unwrap();
        mgr.stop("t1", None).await.unwrap();

        mgr.create_version("t1").await.unwrap();
        assert!(rt.task_status("botbox-t1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn backend_without_snapshots_reports_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, rt) = testing::manager_with(
            MemoryRuntime::without_snapshots(),
            Arc::new(InMemoryStore::new()),
            dir.path(),
        );
        mgr.start("t1").await.unwrap();

        let err = mgr.create_version("t1").await.unwrap_err();
        assert!(err.is_not_supported(), "{err}");
        // Nothing was torn down.
        assert!(rt.task_status("botbox-t1").await.unwrap().is_running());
        assert!(mgr.list_versions("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_without_snapshots_is_not_supported_before_version_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rt) = testing::manager_with(
            MemoryRuntime::without_snapshots(),
            Arc::new(InMemoryStore::new()),
            dir.path(),
        );
        mgr.ensure_exists("t1").await.unwrap();
        assert!(mgr.list_versions("t1").await.unwrap().is_empty());

        let err = mgr.rollback_version("t1", 1).await.unwrap_err();
        assert!(err.is_not_supported(), "{err}");
    }

    async fn assert_row_tracks_live_snapshot(mgr: &BotManager) {
        let container = mgr.get_container("t1").await.unwrap();
        let record = container.record.unwrap();
        assert_eq!(record.snapshot_key, container.info.snapshot_key);
        assert_eq!(record.snapshotter, container.info.snapshotter);
    }

    #[tokio::test]
    async fn mirrored_row_follows_recreated_container() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rt) = testing::manager(dir.path());
        mgr.start("t1").await.unwrap();
        let initial = mgr.get_container("t1").await.unwrap().info.snapshot_key;

        mgr.create_version("t1").await.unwrap();
        assert_row_tracks_live_snapshot(&mgr).await;
        let after_create = mgr.get_container("t1").await.unwrap();
        assert_ne!(after_create.info.snapshot_key, initial);
        assert_eq!(after_create.status(), ContainerStatus::Running);

        mgr.create_version("t1").await.unwrap();
        mgr.rollback_version("t1", 1).await.unwrap();
        assert_row_tracks_live_snapshot(&mgr).await;

        mgr.stop("t1", None).await.unwrap();
        mgr.rollback_version("t1", 2).await.unwrap();
        assert_row_tracks_live_snapshot(&mgr).await;
        assert_eq!(
            mgr.get_container("t1").await.unwrap().record.unwrap().status,
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn unknown_bot_and_version_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rt) = testing::manager(dir.path());

        assert!(matches!(
            mgr.create_version("ghost").await.unwrap_err(),
            Error::BotNotFound { .. }
        ));

        mgr.ensure_exists("t1").await.unwrap();
        assert!(matches!(
            mgr.rollback_version("t1", 7).await.unwrap_err(),
            Error::VersionNotFound { version: 7, .. }
        ));
    }

    #[tokio::test]
    async fn deleted_container_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rt) = testing::manager(dir.path());
        mgr.ensure_exists("t1").await.unwrap();
        mgr.delete("t1").await.unwrap();
        assert!(matches!(
            mgr.create_version("t1").await.unwrap_err(),
            Error::ContainerNotFound { .. }
        ));
    }
}
