use std::{path::Path, sync::Arc};

use {
    botbox_runtime::MemoryRuntime,
    botbox_store::{BotStore, InMemoryStore},
};

use crate::{config::ManagerConfig, manager::BotManager};

pub(crate) fn config(data_root: &Path) -> ManagerConfig {
    ManagerConfig {
        data_root: data_root.to_path_buf(),
        resolv_conf: Some(data_root.join("resolv.conf")),
        ..Default::default()
    }
}

pub(crate) fn manager_with(
    runtime: MemoryRuntime,
    store: Arc<dyn BotStore>,
    data_root: &Path,
) -> (BotManager, Arc<MemoryRuntime>) {
    let runtime = Arc::new(runtime);
    let manager = BotManager::new(runtime.clone(), store, config(data_root));
    (manager, runtime)
}

pub(crate) fn manager(data_root: &Path) -> (BotManager, Arc<MemoryRuntime>) {
    manager_with(
        MemoryRuntime::new(),
        Arc::new(InMemoryStore::new()),
        data_root,
    )
}
