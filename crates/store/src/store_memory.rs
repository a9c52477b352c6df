//! In-memory store for testing.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::BotStore,
    types::{
        BotRecord, ContainerRecord, ContainerStatus, LifecycleEvent, NewEvent, NewSnapshot,
        SnapshotRecord, VersionInfo, now_ms,
    },
};

#[derive(Default)]
struct State {
    bots: HashMap<String, BotRecord>,
    containers: HashMap<String, ContainerRecord>,
    snapshots: HashMap<String, SnapshotRecord>,
    counters: HashMap<String, i64>,
    versions: HashMap<String, Vec<VersionInfo>>,
    events: Vec<LifecycleEvent>,
}

/// In-memory store backed by `HashMap`s. One lock covers every table so
/// version allocation is atomic. No persistence.
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BotStore for InMemoryStore {
    async fn insert_bot(&self, id: &str, display_name: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        state.bots.entry(id.to_string()).or_insert_with(|| BotRecord {
            id: id.to_string(),
            display_name: display_name.map(str::to_string),
            created_at_ms: now_ms(),
        });
        Ok(())
    }

    async fn get_bot(&self, id: &str) -> Result<Option<BotRecord>> {
        Ok(self.lock().bots.get(id).cloned())
    }

    async fn upsert_container(&self, record: &ContainerRecord) -> Result<()> {
        let mut state = self.lock();
        if !state.bots.contains_key(&record.bot_id) {
            return Err(Error::not_found("bot", &record.bot_id));
        }
        let mut record = record.clone();
        if let Some(existing) = state.containers.get(&record.container_id) {
            record.last_started_at_ms = record.last_started_at_ms.or(existing.last_started_at_ms);
            record.last_stopped_at_ms = record.last_stopped_at_ms.or(existing.last_stopped_at_ms);
        }
        state.containers.insert(record.container_id.clone(), record);
        Ok(())
    }

    async fn get_container_by_bot(&self, bot_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self
            .lock()
            .containers
            .values()
            .find(|c| c.bot_id == bot_id)
            .cloned())
    }

    async fn update_container_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
        at_ms: i64,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(record) = state.containers.get_mut(container_id) else {
            return Ok(false);
        };
        record.status = status;
        record.updated_at_ms = at_ms;
        match status {
            ContainerStatus::Running => record.last_started_at_ms = Some(at_ms),
            ContainerStatus::Stopped => record.last_stopped_at_ms = Some(at_ms),
            ContainerStatus::Created | ContainerStatus::Deleted => {},
        }
        Ok(true)
    }

    async fn list_versions(&self, container_id: &str) -> Result<Vec<VersionInfo>> {
        let state = self.lock();
        let mut versions = state.versions.get(container_id).cloned().unwrap_or_default();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn next_version(&self, container_id: &str) -> Result<i64> {
        Ok(self.lock().counters.get(container_id).copied().unwrap_or(0) + 1)
    }

    async fn record_version(&self, snapshot: &NewSnapshot) -> Result<VersionInfo> {
        let mut state = self.lock();
        let duplicate = state
            .snapshots
            .values()
            .any(|s| s.container_id == snapshot.container_id && s.name == snapshot.name);
        if duplicate {
            return Err(Error::message(format!(
                "snapshot {} already recorded for {}",
                snapshot.name, snapshot.container_id
            )));
        }

        let now = now_ms();
        let counter = state
            .counters
            .entry(snapshot.container_id.clone())
            .or_insert(0);
        *counter += 1;
        let version = *counter;

        let record = SnapshotRecord {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: snapshot.container_id.clone(),
            name: snapshot.name.clone(),
            parent: snapshot.parent.clone(),
            snapshotter: snapshot.snapshotter.clone(),
            created_at_ms: now,
        };
        let info = VersionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: snapshot.container_id.clone(),
            version,
            snapshot_id: record.id.clone(),
            snapshot_name: record.name.clone(),
            created_at_ms: now,
        };
        state.snapshots.insert(record.id.clone(), record);
        state
            .versions
            .entry(snapshot.container_id.clone())
            .or_default()
            .push(info.clone());
        Ok(info)
    }

    async fn get_version_snapshot(
        &self,
        container_id: &str,
        version: i64,
    ) -> Result<Option<SnapshotRecord>> {
        let state = self.lock();
        let snapshot = state
            .versions
            .get(container_id)
            .and_then(|vs| vs.iter().find(|v| v.version == version))
            .and_then(|v| state.snapshots.get(&v.snapshot_id))
            .cloned();
        Ok(snapshot)
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<i64> {
        let mut state = self.lock();
        let id = i64::try_from(state.events.len()).unwrap_or(i64::MAX - 1) + 1;
        state.events.push(LifecycleEvent {
            id,
            container_id: event.container_id.clone(),
            bot_id: event.bot_id.clone(),
            kind: event.kind,
            payload: event.payload.clone(),
            created_at_ms: now_ms(),
        });
        Ok(id)
    }

    async fn list_events(&self, container_id: &str, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let state = self.lock();
        let records: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.container_id == container_id)
            .cloned()
            .collect();
        // Return the most recent `limit` entries.
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::EventKind,
        rstest::rstest,
        std::{collections::HashSet, sync::Arc},
    };

    fn snapshot(name: &str) -> NewSnapshot {
        NewSnapshot {
            container_id: "c1".into(),
            name: name.into(),
            parent: None,
            snapshotter: "overlayfs".into(),
        }
    }

    #[tokio::test]
    async fn container_upsert_needs_bot() {
        let store = InMemoryStore::new();
        let record = ContainerRecord {
            container_id: "c1".into(),
            bot_id: "t1".into(),
            image: "debian".into(),
            status: ContainerStatus::Created,
            snapshotter: "overlayfs".into(),
            snapshot_key: "c1".into(),
            host_path: "/srv/t1".into(),
            container_path: "/data".into(),
            last_started_at_ms: None,
            last_stopped_at_ms: None,
            updated_at_ms: 0,
        };
        assert!(store.upsert_container(&record).await.unwrap_err().is_not_found());

        store.insert_bot("t1", None).await.unwrap();
        store.upsert_container(&record).await.unwrap();
        assert!(
            store
                .update_container_status("c1", ContainerStatus::Running, 5)
                .await
                .unwrap()
        );
        let got = store.get_container_by_bot("t1").await.unwrap().unwrap();
        assert_eq!(got.status, ContainerStatus::Running);
        assert_eq!(got.last_started_at_ms, Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_versions_are_unique_and_gap_free() {
        let store = Arc::new(InMemoryStore::new());
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .record_version(&snapshot(&format!("s{i}")))
                        .await
                        .unwrap()
                        .version
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen, (1..=20).collect());
        assert_eq!(store.next_version("c1").await.unwrap(), 21);
        let listed = store.list_versions("c1").await.unwrap();
        assert_eq!(listed.first().unwrap().version, 20);
        assert_eq!(listed.last().unwrap().version, 1);
    }

    #[tokio::test]
    async fn duplicate_snapshot_name_is_rejected() {
        let store = InMemoryStore::new();
        store.record_version(&snapshot("s")).await.unwrap();
        assert!(store.record_version(&snapshot("s")).await.is_err());
        assert_eq!(store.next_version("c1").await.unwrap(), 2);
    }

    #[rstest]
    #[case(2, 2)]
    #[case(10, 4)]
    #[tokio::test]
    async fn list_events_respects_limit(#[case] limit: usize, #[case] expected: usize) {
        let store = InMemoryStore::new();
        for container in ["c1", "c1", "c2", "c1", "c1"] {
            store
                .insert_event(&NewEvent {
                    container_id: container.into(),
                    bot_id: "t1".into(),
                    kind: EventKind::Exec,
                    payload: serde_json::json!({}),
                })
                .await
                .unwrap();
        }
        let events = store.list_events("c1", limit).await.unwrap();
        assert_eq!(events.len(), expected);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events.last().unwrap().id, 5);
    }
}
