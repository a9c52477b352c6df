//! SQLite-backed bot store using sqlx.

use std::{str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    },
    tracing::debug,
};

use crate::{
    Result,
    store::BotStore,
    types::{
        BotRecord, ContainerRecord, ContainerStatus, LifecycleEvent, NewEvent, NewSnapshot,
        SnapshotRecord, VersionInfo, now_ms,
    },
};

/// How long a writer waits for SQLite's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect, creating the database file if the URL allows it, and run
    /// migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let options = SqliteConnectOptions::from_str(database_url)?.busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Use an existing pool. Call [`crate::run_migrations`] first.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn container_from_row(row: &SqliteRow) -> Result<ContainerRecord> {
    let status: String = row.get("status");
    Ok(ContainerRecord {
        container_id: row.get("container_id"),
        bot_id: row.get("bot_id"),
        image: row.get("image"),
        status: status.parse()?,
        snapshotter: row.get("snapshotter"),
        snapshot_key: row.get("snapshot_key"),
        host_path: row.get("host_path"),
        container_path: row.get("container_path"),
        last_started_at_ms: row.get("last_started_at_ms"),
        last_stopped_at_ms: row.get("last_stopped_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
    })
}

#[async_trait]
impl BotStore for SqliteStore {
    async fn insert_bot(&self, id: &str, display_name: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO bots (id, display_name, created_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(display_name)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bot(&self, id: &str) -> Result<Option<BotRecord>> {
        let row = sqlx::query("SELECT id, display_name, created_at_ms FROM bots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| BotRecord {
            id: row.get("id"),
            display_name: row.get("display_name"),
            created_at_ms: row.get("created_at_ms"),
        }))
    }

    async fn upsert_container(&self, record: &ContainerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO containers (container_id, bot_id, image, status, snapshotter, snapshot_key,
                                     host_path, container_path, last_started_at_ms,
                                     last_stopped_at_ms, updated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(container_id) DO UPDATE SET
                 image = excluded.image,
                 status = excluded.status,
                 snapshotter = excluded.snapshotter,
                 snapshot_key = excluded.snapshot_key,
                 host_path = excluded.host_path,
                 container_path = excluded.container_path,
                 last_started_at_ms = COALESCE(excluded.last_started_at_ms, containers.last_started_at_ms),
                 last_stopped_at_ms = COALESCE(excluded.last_stopped_at_ms, containers.last_stopped_at_ms),
                 updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&record.container_id)
        .bind(&record.bot_id)
        .bind(&record.image)
        .bind(record.status.as_str())
        .bind(&record.snapshotter)
        .bind(&record.snapshot_key)
        .bind(&record.host_path)
        .bind(&record.container_path)
        .bind(record.last_started_at_ms)
        .bind(record.last_stopped_at_ms)
        .bind(record.updated_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_container_by_bot(&self, bot_id: &str) -> Result<Option<ContainerRecord>> {
        let row = sqlx::query("SELECT * FROM containers WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(container_from_row).transpose()
    }

    async fn update_container_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
        at_ms: i64,
    ) -> Result<bool> {
        let (started, stopped) = match status {
            ContainerStatus::Running => (Some(at_ms), None),
            ContainerStatus::Stopped => (None, Some(at_ms)),
            ContainerStatus::Created | ContainerStatus::Deleted => (None, None),
        };
        let result = sqlx::query(
            "UPDATE containers SET
                 status = ?,
                 last_started_at_ms = COALESCE(?, last_started_at_ms),
                 last_stopped_at_ms = COALESCE(?, last_stopped_at_ms),
                 updated_at_ms = ?
             WHERE container_id = ?",
        )
        .bind(status.as_str())
        .bind(started)
        .bind(stopped)
        .bind(at_ms)
        .bind(container_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_versions(&self, container_id: &str) -> Result<Vec<VersionInfo>> {
        let rows = sqlx::query(
            "SELECT v.id, v.container_id, v.version, v.snapshot_id, s.name AS snapshot_name,
                    v.created_at_ms
             FROM versions v
             JOIN snapshots s ON s.id = v.snapshot_id
             WHERE v.container_id = ?
             ORDER BY v.version DESC",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| VersionInfo {
                id: row.get("id"),
                container_id: row.get("container_id"),
                version: row.get("version"),
                snapshot_id: row.get("snapshot_id"),
                snapshot_name: row.get("snapshot_name"),
                created_at_ms: row.get("created_at_ms"),
            })
            .collect())
    }

    async fn next_version(&self, container_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(last_version), 0) + 1 AS next
             FROM version_counters WHERE container_id = ?",
        )
        .bind(container_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("next"))
    }

    async fn record_version(&self, snapshot: &NewSnapshot) -> Result<VersionInfo> {
        let now = now_ms();
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let version_id = uuid::Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;

        // The upsert takes SQLite's write lock, so concurrent callers
        // serialize here and each sees the previous increment.
        let version: i64 = sqlx::query(
            "INSERT INTO version_counters (container_id, last_version) VALUES (?, 1)
             ON CONFLICT(container_id) DO UPDATE SET last_version = last_version + 1
             RETURNING last_version",
        )
        .bind(&snapshot.container_id)
        .fetch_one(&mut *tx)
        .await?
        .get("last_version");

        sqlx::query(
            "INSERT INTO snapshots (id, container_id, name, parent, snapshotter, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot_id)
        .bind(&snapshot.container_id)
        .bind(&snapshot.name)
        .bind(&snapshot.parent)
        .bind(&snapshot.snapshotter)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO versions (id, container_id, version, snapshot_id, created_at_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&version_id)
        .bind(&snapshot.container_id)
        .bind(version)
        .bind(&snapshot_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(container_id = %snapshot.container_id, version, snapshot = %snapshot.name, "version recorded");

        Ok(VersionInfo {
            id: version_id,
            container_id: snapshot.container_id.clone(),
            version,
            snapshot_id,
            snapshot_name: snapshot.name.clone(),
            created_at_ms: now,
        })
    }

    async fn get_version_snapshot(
        &self,
        container_id: &str,
        version: i64,
    ) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            "SELECT s.id, s.container_id, s.name, s.parent, s.snapshotter, s.created_at_ms
             FROM versions v
             JOIN snapshots s ON s.id = v.snapshot_id
             WHERE v.container_id = ? AND v.version = ?",
        )
        .bind(container_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| SnapshotRecord {
            id: row.get("id"),
            container_id: row.get("container_id"),
            name: row.get("name"),
            parent: row.get("parent"),
            snapshotter: row.get("snapshotter"),
            created_at_ms: row.get("created_at_ms"),
        }))
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<i64> {
        let payload = serde_json::to_string(&event.payload)?;
        let result = sqlx::query(
            "INSERT INTO lifecycle_events (container_id, bot_id, event_type, payload, created_at_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.container_id)
        .bind(&event.bot_id)
        .bind(event.kind.as_str())
        .bind(&payload)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_events(&self, container_id: &str, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let rows = sqlx::query(
            "SELECT id, container_id, bot_id, event_type, payload, created_at_ms
             FROM lifecycle_events
             WHERE container_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(container_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("event_type");
            let payload: String = row.get("payload");
            events.push(LifecycleEvent {
                id: row.get("id"),
                container_id: row.get("container_id"),
                bot_id: row.get("bot_id"),
                kind: kind.parse()?,
                payload: serde_json::from_str(&payload)?,
                created_at_ms: row.get("created_at_ms"),
            });
        }
        // Oldest first.
        events.reverse();
        Ok(events)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::types::EventKind, std::sync::Arc};

    async fn make_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn container(bot_id: &str) -> ContainerRecord {
        ContainerRecord {
            container_id: format!("botbox-{bot_id}"),
            bot_id: bot_id.into(),
            image: "debian".into(),
            status: ContainerStatus::Created,
            snapshotter: "overlayfs".into(),
            snapshot_key: format!("botbox-{bot_id}"),
            host_path: format!("/srv/bots/{bot_id}"),
            container_path: "/data".into(),
            last_started_at_ms: None,
            last_stopped_at_ms: None,
            updated_at_ms: 1,
        }
    }

    fn snapshot(container_id: &str, name: &str) -> NewSnapshot {
        NewSnapshot {
            container_id: container_id.into(),
            name: name.into(),
            parent: None,
            snapshotter: "overlayfs".into(),
        }
    }

    #[tokio::test]
    async fn insert_bot_is_idempotent() {
        let store = make_store().await;
        store.insert_bot("t1", Some("Tenant")).await.unwrap();
        store.insert_bot("t1", None).await.unwrap();
        let bot = store.get_bot("t1").await.unwrap().unwrap();
        assert_eq!(bot.display_name.as_deref(), Some("Tenant"));
        assert!(store.get_bot("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn container_requires_registered_bot() {
        let store = make_store().await;
        assert!(store.upsert_container(&container("t1")).await.is_err());
        store.insert_bot("t1", None).await.unwrap();
        store.upsert_container(&container("t1")).await.unwrap();
        let got = store.get_container_by_bot("t1").await.unwrap().unwrap();
        assert_eq!(got.container_id, "botbox-t1");
        assert_eq!(got.status, ContainerStatus::Created);
    }

    #[tokio::test]
    async fn status_updates_keep_timestamps() {
        let store = make_store().await;
        store.insert_bot("t1", None).await.unwrap();
        store.upsert_container(&container("t1")).await.unwrap();

        assert!(
            store
                .update_container_status("botbox-t1", ContainerStatus::Running, 100)
                .await
                .unwrap()
        );
        assert!(
            store
                .update_container_status("botbox-t1", ContainerStatus::Stopped, 200)
                .await
                .unwrap()
        );
        let got = store.get_container_by_bot("t1").await.unwrap().unwrap();
        assert_eq!(got.status, ContainerStatus::Stopped);
        assert_eq!(got.last_started_at_ms, Some(100));
        assert_eq!(got.last_stopped_at_ms, Some(200));

        // Upsert without timestamps keeps the recorded ones.
        store.upsert_container(&container("t1")).await.unwrap();
        let got = store.get_container_by_bot("t1").await.unwrap().unwrap();
        assert_eq!(got.last_started_at_ms, Some(100));

        assert!(
            !store
                .update_container_status("missing", ContainerStatus::Running, 1)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn versions_are_gap_free_and_newest_first() {
        let store = make_store().await;
        assert_eq!(store.next_version("c1").await.unwrap(), 1);
        for i in 1..=3 {
            let v = store
                .record_version(&snapshot("c1", &format!("c1-v{i}")))
                .await
                .unwrap();
            assert_eq!(v.version, i);
        }
        assert_eq!(store.next_version("c1").await.unwrap(), 4);
        // Independent sequence per container.
        assert_eq!(
            store
                .record_version(&snapshot("c2", "c2-v1"))
                .await
                .unwrap()
                .version,
            1
        );

        let versions = store.list_versions("c1").await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![3, 2, 1]);
        assert_eq!(versions[0].snapshot_name, "c1-v3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_record_version_is_gap_free() {
        const WRITERS: i64 = 32;
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("store.db").display());
        let store = Arc::new(SqliteStore::new(&url).await.unwrap());

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .record_version(&snapshot("c1", &format!("snap-{i}")))
                        .await
                })
            })
            .collect();
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.unwrap().unwrap().version);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=WRITERS).collect::<Vec<_>>());

        let listed: Vec<i64> = store
            .list_versions("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(listed, (1..=WRITERS).rev().collect::<Vec<_>>());
        assert_eq!(store.next_version("c1").await.unwrap(), WRITERS + 1);
    }

    #[tokio::test]
    async fn resolves_version_snapshot() {
        let store = make_store().await;
        store.record_version(&snapshot("c1", "c1-v1")).await.unwrap();
        let snap = store.get_version_snapshot("c1", 1).await.unwrap().unwrap();
        assert_eq!(snap.name, "c1-v1");
        assert!(store.get_version_snapshot("c1", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_are_returned_oldest_first_within_limit() {
        let store = make_store().await;
        for i in 0..5 {
            store
                .insert_event(&NewEvent {
                    container_id: "c1".into(),
                    bot_id: "t1".into(),
                    kind: EventKind::Exec,
                    payload: serde_json::json!({ "n": i }),
                })
                .await
                .unwrap();
        }
        let events = store.list_events("c1", 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload["n"], 2);
        assert_eq!(events[2].payload["n"], 4);
        assert_eq!(events[0].kind, EventKind::Exec);
    }
}
