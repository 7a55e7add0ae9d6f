//! Multi-device test clusters.
//!
//! A [`Cluster`] owns a tokio runtime, a [`MemoryNetwork`] and one
//! [`Syncer`] per device, and tears them down in the right order.

use crate::multi_ver_store::MemoryMultiVerStore;
use crate::network::MemoryNetwork;
use kvsync_engine::{
    AllowAll, EngineConfig, MemorySyncStore, PermissionChecker, StoreInfo, SyncStore, Syncer,
    TaskPool,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Store identity shared by every peer of a cluster.
pub fn test_store_info() -> StoreInfo {
    StoreInfo::new("user", "app", "store")
}

/// Engine configuration with short timeouts, suited to tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_response_timeout(Duration::from_millis(300))
}

/// Devices syncing over one in-memory network.
pub struct Cluster {
    syncers: BTreeMap<String, Syncer>,
    network: Arc<MemoryNetwork>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Cluster {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::with_network(MemoryNetwork::new())
    }

    /// Creates an empty cluster on `network`.
    pub fn with_network(network: Arc<MemoryNetwork>) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to build runtime");
        Self {
            syncers: BTreeMap::new(),
            network,
            runtime: Some(runtime),
        }
    }

    /// The shared network.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    fn pool(&self) -> TaskPool {
        let runtime = self.runtime.as_ref().expect("Cluster runtime is gone");
        TaskPool::new(runtime.handle().clone())
    }

    /// Adds a single-version peer with `config` and returns its store.
    pub fn add_peer(&mut self, device: &str, config: EngineConfig) -> Arc<MemorySyncStore> {
        let store = Arc::new(MemorySyncStore::new(test_store_info()));
        self.add_peer_with(device, config, SyncStore::single_ver(store.clone()), Arc::new(AllowAll));
        store
    }

    /// Adds a multi-version peer with `config` and returns its store.
    pub fn add_multi_ver_peer(&mut self, device: &str, config: EngineConfig) -> Arc<MemoryMultiVerStore> {
        let store = Arc::new(MemoryMultiVerStore::new(test_store_info(), device));
        self.add_peer_with(device, config, SyncStore::multi_ver(store.clone()), Arc::new(AllowAll));
        store
    }

    /// Adds a peer over an arbitrary store and permission gate.
    pub fn add_peer_with(
        &mut self,
        device: &str,
        config: EngineConfig,
        store: SyncStore,
        permission: Arc<dyn PermissionChecker>,
    ) {
        let syncer = Syncer::new(config, store, self.network.endpoint(device), permission, self.pool())
            .expect("Failed to start syncer");
        self.syncers.insert(device.to_string(), syncer);
    }

    /// Announces every pair of peers to each other.
    pub fn connect_all(&self) {
        let devices: Vec<&String> = self.syncers.keys().collect();
        for (i, a) in devices.iter().enumerate() {
            for b in &devices[i + 1..] {
                self.network.connect(a, b);
            }
        }
    }

    /// The syncer of `device`.
    pub fn syncer(&self, device: &str) -> &Syncer {
        self.syncers
            .get(device)
            .unwrap_or_else(|| panic!("unknown peer {device}"))
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for syncer in self.syncers.values() {
            syncer.close();
        }
        self.network.shutdown();
        self.syncers.clear();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_peers_see_each_other() {
        let mut cluster = Cluster::new();
        cluster.add_peer("a", fast_config());
        cluster.add_peer("b", fast_config());
        cluster.add_peer("c", fast_config());
        cluster.connect_all();
        assert_eq!(cluster.syncer("a").online_devices(), vec!["b", "c"]);
        assert_eq!(cluster.syncer("c").online_devices(), vec!["a", "b"]);
    }
}
