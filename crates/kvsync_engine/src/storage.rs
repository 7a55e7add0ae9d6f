//! Storage interfaces consumed by the sync engine.
//!
//! The engine never owns data. It reads and writes through these traits,
//! which the embedding database implements. Single-version stores expose a
//! timestamp-ordered entry log; multi-version stores expose a commit tree
//! plus content-addressed value slices. Both share [`SyncInterface`] for
//! identity, metadata and capability queries.

use crate::error::SyncResult;
use kvsync_protocol::{CommitNode, DataItem, MultiVerEntry, SecurityOption, ValueSliceHash};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of the local store, fed to the permission gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StoreInfo {
    /// Owning user.
    pub user_id: String,
    /// Owning application.
    pub app_id: String,
    /// Store name.
    pub store_id: String,
}

impl StoreInfo {
    /// Creates a store identity.
    pub fn new(
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        store_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            app_id: app_id.into(),
            store_id: store_id.into(),
        }
    }
}

/// Operations shared by every store variant.
pub trait SyncInterface: Send + Sync {
    /// Identity of this store.
    fn store_info(&self) -> StoreInfo;

    /// Reads a metadata value.
    fn get_meta(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>>;

    /// Writes a metadata value durably.
    fn put_meta(&self, key: &[u8], value: &[u8]) -> SyncResult<()>;

    /// Highest commit timestamp of any local entry (0 when empty).
    fn max_timestamp(&self) -> SyncResult<u64>;

    /// Serialized schema of this store (empty when schemaless).
    fn schema(&self) -> String;

    /// Returns true if data written under `remote_schema` can be stored here.
    ///
    /// The default accepts identical schemas and schemaless peers.
    fn check_schema_compatible(&self, remote_schema: &str) -> bool {
        remote_schema.is_empty() || remote_schema == self.schema()
    }

    /// Security label and flag of this store.
    fn security_option(&self) -> SecurityOption;
}

/// One page of entries read for sending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDataBatch {
    /// Entries in ascending timestamp order.
    pub items: Vec<DataItem>,
    /// True if entries remain in the requested range after this page.
    pub has_more: bool,
}

/// A single-version store: every entry carries one commit timestamp.
pub trait SingleVerStorage: SyncInterface {
    /// Reads entries with `begin < timestamp <= end` in ascending order.
    ///
    /// Stops before the page would exceed `max_bytes` of serialized
    /// entries, but always returns at least one entry when any exists.
    fn get_sync_data(&self, begin: u64, end: u64, max_bytes: usize) -> SyncResult<SyncDataBatch>;

    /// Applies entries received from `device`.
    ///
    /// Commit timestamps are already converted to the local clock; write
    /// timestamps keep the clock of the device that wrote the entry.
    /// Implementations resolve conflicts with their own policy. Returning
    /// [`crate::SyncError::Busy`] asks the sender to retry later.
    fn put_sync_data(&self, items: &[DataItem], device: &str) -> SyncResult<()>;

    /// Removes every entry that originated from `device`.
    fn remove_device_data(&self, device: &str) -> SyncResult<()>;
}

/// A multi-version store: a commit tree whose values are split into slices.
pub trait MultiVerStorage: SyncInterface {
    /// Latest local commit per originating device.
    fn latest_commits(&self) -> SyncResult<BTreeMap<String, CommitNode>>;

    /// Commits a peer whose latest commits are `peer_latest` is missing,
    /// parents before children.
    fn commit_tree(&self, peer_latest: &BTreeMap<String, CommitNode>) -> SyncResult<Vec<CommitNode>>;

    /// Returns true if the commit is already present locally.
    fn is_commit_existed(&self, commit_id: &[u8]) -> SyncResult<bool>;

    /// Entries recorded by a local commit.
    fn commit_data(&self, commit_id: &[u8]) -> SyncResult<Vec<MultiVerEntry>>;

    /// Stores a commit received from `device` together with its entries.
    ///
    /// Called only once every referenced slice exists locally.
    fn put_commit_data(&self, commit: &CommitNode, entries: &[MultiVerEntry], device: &str) -> SyncResult<()>;

    /// Returns true if the slice is already present locally.
    fn is_value_slice_existed(&self, hash: &ValueSliceHash) -> SyncResult<bool>;

    /// Reads a slice by hash.
    fn get_value_slice(&self, hash: &ValueSliceHash) -> SyncResult<Option<Vec<u8>>>;

    /// Stores a slice under its hash.
    fn put_value_slice(&self, hash: &ValueSliceHash, slice: &[u8]) -> SyncResult<()>;

    /// Removes every commit that originated from `device`.
    fn remove_device_data(&self, device: &str) -> SyncResult<()>;
}

#[derive(Clone)]
enum StoreVariant {
    SingleVer(Arc<dyn SingleVerStorage>),
    MultiVer(Arc<dyn MultiVerStorage>),
}

/// A store handed to the engine, tagged with its variant.
#[derive(Clone)]
pub struct SyncStore {
    base: Arc<dyn SyncInterface>,
    variant: StoreVariant,
}

impl SyncStore {
    /// Wraps a single-version store.
    pub fn single_ver<S: SingleVerStorage + 'static>(store: Arc<S>) -> Self {
        Self {
            base: store.clone(),
            variant: StoreVariant::SingleVer(store),
        }
    }

    /// Wraps a multi-version store.
    pub fn multi_ver<S: MultiVerStorage + 'static>(store: Arc<S>) -> Self {
        Self {
            base: store.clone(),
            variant: StoreVariant::MultiVer(store),
        }
    }

    /// Operations shared by both variants.
    pub fn base(&self) -> &dyn SyncInterface {
        self.base.as_ref()
    }

    /// The single-version store, if this is one.
    pub fn as_single_ver(&self) -> Option<&Arc<dyn SingleVerStorage>> {
        match &self.variant {
            StoreVariant::SingleVer(store) => Some(store),
            StoreVariant::MultiVer(_) => None,
        }
    }

    /// The multi-version store, if this is one.
    pub fn as_multi_ver(&self) -> Option<&Arc<dyn MultiVerStorage>> {
        match &self.variant {
            StoreVariant::MultiVer(store) => Some(store),
            StoreVariant::SingleVer(_) => None,
        }
    }

    /// Returns true for multi-version stores.
    pub fn is_multi_ver(&self) -> bool {
        matches!(self.variant, StoreVariant::MultiVer(_))
    }

    /// Removes data originating from `device`, whichever the variant.
    pub fn remove_device_data(&self, device: &str) -> SyncResult<()> {
        match &self.variant {
            StoreVariant::SingleVer(store) => store.remove_device_data(device),
            StoreVariant::MultiVer(store) => store.remove_device_data(device),
        }
    }
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("store", &self.base.store_info())
            .field("multi_ver", &self.is_multi_ver())
            .finish()
    }
}
