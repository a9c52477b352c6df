//! Persistence trait for bot lifecycle records.

use async_trait::async_trait;

use crate::{
    Result,
    types::{
        BotRecord, ContainerRecord, ContainerStatus, LifecycleEvent, NewEvent, NewSnapshot,
        SnapshotRecord, VersionInfo,
    },
};

#[async_trait]
pub trait BotStore: Send + Sync {
    /// Register a bot. Re-registering an existing ID is a no-op.
    async fn insert_bot(&self, id: &str, display_name: Option<&str>) -> Result<()>;
    async fn get_bot(&self, id: &str) -> Result<Option<BotRecord>>;

    async fn upsert_container(&self, record: &ContainerRecord) -> Result<()>;
    async fn get_container_by_bot(&self, bot_id: &str) -> Result<Option<ContainerRecord>>;
    /// Returns `false` when no row exists for `container_id`.
    async fn update_container_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
        at_ms: i64,
    ) -> Result<bool>;

    /// Versions of a container, newest first.
    async fn list_versions(&self, container_id: &str) -> Result<Vec<VersionInfo>>;
    /// The number the next recorded version would get.
    async fn next_version(&self, container_id: &str) -> Result<i64>;
    /// Atomically allocate the next version number and store the snapshot
    /// and version rows.
    async fn record_version(&self, snapshot: &NewSnapshot) -> Result<VersionInfo>;
    async fn get_version_snapshot(
        &self,
        container_id: &str,
        version: i64,
    ) -> Result<Option<SnapshotRecord>>;

    async fn insert_event(&self, event: &NewEvent) -> Result<i64>;
    /// Most recent `limit` events for a container, oldest first.
    async fn list_events(&self, container_id: &str, limit: usize) -> Result<Vec<LifecycleEvent>>;
}
