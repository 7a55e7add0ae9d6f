//! In-memory multi-version store.
//!
//! Each local commit records the written keys of one device. Values are
//! split into fixed-size slices stored once under their SHA-256 digest, so
//! identical content is shared across commits and keys.

use kvsync_engine::{
    system_time, MultiVerStorage, StoreInfo, SyncError, SyncInterface, SyncResult,
};
use kvsync_protocol::{CommitNode, MultiVerEntry, SecurityOption, ValueSliceHash};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Default slice size in bytes.
pub const DEFAULT_SLICE_SIZE: usize = 256;

/// Digest of a value slice.
pub fn slice_hash(slice: &[u8]) -> ValueSliceHash {
    Sha256::digest(slice).into()
}

#[derive(Debug, Clone)]
struct StoredCommit {
    node: CommitNode,
    entries: Vec<MultiVerEntry>,
}

/// Current value of one key.
#[derive(Debug, Clone)]
struct KeyState {
    slices: Vec<ValueSliceHash>,
    deleted: bool,
    timestamp: u64,
    origin: String,
}

#[derive(Debug, Default)]
struct State {
    commits: BTreeMap<Vec<u8>, StoredCommit>,
    heads: BTreeMap<String, CommitNode>,
    keys: BTreeMap<Vec<u8>, KeyState>,
}

/// An in-memory [`MultiVerStorage`].
#[derive(Debug)]
pub struct MemoryMultiVerStore {
    info: StoreInfo,
    device: String,
    slice_size: usize,
    state: RwLock<State>,
    slices: RwLock<HashMap<ValueSliceHash, Vec<u8>>>,
    meta: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    last_timestamp: Mutex<u64>,
}

impl MemoryMultiVerStore {
    /// Creates an empty store whose local commits are attributed to `device`.
    pub fn new(info: StoreInfo, device: impl Into<String>) -> Self {
        Self::with_slice_size(info, device, DEFAULT_SLICE_SIZE)
    }

    /// Creates an empty store splitting values into `slice_size` byte slices.
    pub fn with_slice_size(info: StoreInfo, device: impl Into<String>, slice_size: usize) -> Self {
        Self {
            info,
            device: device.into(),
            slice_size: slice_size.max(1),
            state: RwLock::new(State::default()),
            slices: RwLock::new(HashMap::new()),
            meta: RwLock::new(HashMap::new()),
            last_timestamp: Mutex::new(0),
        }
    }

    fn next_timestamp(&self) -> u64 {
        let mut last = self.last_timestamp.lock();
        *last = system_time().max(*last + 1);
        *last
    }

    /// Records a local commit. `None` deletes the key.
    pub fn commit(&self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> CommitNode {
        let timestamp = self.next_timestamp();
        let entries: Vec<MultiVerEntry> = writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => MultiVerEntry {
                    key,
                    slices: self.store_value(&value),
                    deleted: false,
                    timestamp,
                },
                None => MultiVerEntry {
                    key,
                    slices: Vec::new(),
                    deleted: true,
                    timestamp,
                },
            })
            .collect();

        let mut state = self.state.write();
        let parent = state.heads.get(&self.device).cloned();
        let version = parent.as_ref().map_or(1, |head| head.version + 1);
        let node = CommitNode {
            commit_id: commit_id(&self.device, version, timestamp),
            left_parent: parent.map(|head| head.commit_id).unwrap_or_default(),
            right_parent: Vec::new(),
            timestamp,
            version,
            device_id: self.device.clone(),
        };
        Self::apply(&mut state, &node, &entries, &self.device);
        node
    }

    fn store_value(&self, value: &[u8]) -> Vec<ValueSliceHash> {
        let mut slices = self.slices.write();
        value
            .chunks(self.slice_size)
            .map(|chunk| {
                let hash = slice_hash(chunk);
                slices.entry(hash).or_insert_with(|| chunk.to_vec());
                hash
            })
            .collect()
    }

    fn apply(state: &mut State, node: &CommitNode, entries: &[MultiVerEntry], origin: &str) {
        for entry in entries {
            let newer = state
                .keys
                .get(&entry.key)
                .is_none_or(|current| entry.timestamp >= current.timestamp);
            if newer {
                state.keys.insert(
                    entry.key.clone(),
                    KeyState {
                        slices: entry.slices.clone(),
                        deleted: entry.deleted,
                        timestamp: entry.timestamp,
                        origin: origin.to_string(),
                    },
                );
            }
        }
        let advances = state
            .heads
            .get(&node.device_id)
            .is_none_or(|head| node.version > head.version);
        if advances {
            state.heads.insert(node.device_id.clone(), node.clone());
        }
        state.commits.insert(
            node.commit_id.clone(),
            StoredCommit {
                node: node.clone(),
                entries: entries.to_vec(),
            },
        );
    }

    /// Current value of `key`, reassembled from its slices.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.read();
        let current = state.keys.get(key).filter(|current| !current.deleted)?;
        let slices = self.slices.read();
        let mut value = Vec::new();
        for hash in &current.slices {
            value.extend_from_slice(slices.get(hash)?);
        }
        Some(value)
    }

    /// Number of stored commits.
    pub fn commit_count(&self) -> usize {
        self.state.read().commits.len()
    }

    /// Number of distinct stored slices.
    pub fn slice_count(&self) -> usize {
        self.slices.read().len()
    }
}

fn commit_id(device: &str, version: u64, timestamp: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(device.as_bytes());
    hasher.update(version.to_le_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.finalize().to_vec()
}

impl SyncInterface for MemoryMultiVerStore {
    fn store_info(&self) -> StoreInfo {
        self.info.clone()
    }

    fn get_meta(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.meta.read().get(key).cloned())
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> SyncResult<()> {
        self.meta.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn max_timestamp(&self) -> SyncResult<u64> {
        let state = self.state.read();
        Ok(state
            .commits
            .values()
            .map(|commit| commit.node.timestamp)
            .max()
            .unwrap_or(0))
    }

    fn schema(&self) -> String {
        String::new()
    }

    fn security_option(&self) -> SecurityOption {
        SecurityOption::default()
    }
}

impl MultiVerStorage for MemoryMultiVerStore {
    fn latest_commits(&self) -> SyncResult<BTreeMap<String, CommitNode>> {
        Ok(self.state.read().heads.clone())
    }

    fn commit_tree(&self, peer_latest: &BTreeMap<String, CommitNode>) -> SyncResult<Vec<CommitNode>> {
        let state = self.state.read();
        let mut missing: Vec<CommitNode> = state
            .commits
            .values()
            .map(|commit| &commit.node)
            .filter(|node| {
                peer_latest
                    .get(&node.device_id)
                    .is_none_or(|head| node.version > head.version)
            })
            .cloned()
            .collect();
        missing.sort_by(|a, b| (&a.device_id, a.version).cmp(&(&b.device_id, b.version)));
        Ok(missing)
    }

    fn is_commit_existed(&self, commit_id: &[u8]) -> SyncResult<bool> {
        Ok(self.state.read().commits.contains_key(commit_id))
    }

    fn commit_data(&self, commit_id: &[u8]) -> SyncResult<Vec<MultiVerEntry>> {
        self.state
            .read()
            .commits
            .get(commit_id)
            .map(|commit| commit.entries.clone())
            .ok_or_else(|| SyncError::NotFound("commit".into()))
    }

    fn put_commit_data(&self, commit: &CommitNode, entries: &[MultiVerEntry], device: &str) -> SyncResult<()> {
        let slices = self.slices.read();
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.slices.iter().any(|hash| !slices.contains_key(hash)))
        {
            return Err(SyncError::Storage(format!(
                "slice of key {:?} missing",
                String::from_utf8_lossy(&entry.key)
            )));
        }
        drop(slices);
        let mut state = self.state.write();
        Self::apply(&mut state, commit, entries, device);
        let mut last = self.last_timestamp.lock();
        *last = (*last).max(commit.timestamp);
        Ok(())
    }

    fn is_value_slice_existed(&self, hash: &ValueSliceHash) -> SyncResult<bool> {
        Ok(self.slices.read().contains_key(hash))
    }

    fn get_value_slice(&self, hash: &ValueSliceHash) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.slices.read().get(hash).cloned())
    }

    fn put_value_slice(&self, hash: &ValueSliceHash, slice: &[u8]) -> SyncResult<()> {
        if slice_hash(slice) != *hash {
            return Err(SyncError::Storage("slice does not match its hash".into()));
        }
        self.slices.write().insert(*hash, slice.to_vec());
        Ok(())
    }

    fn remove_device_data(&self, device: &str) -> SyncResult<()> {
        let mut state = self.state.write();
        state.commits.retain(|_, commit| commit.node.device_id != device);
        state.heads.remove(device);
        state.keys.retain(|_, current| current.origin != device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(device: &str) -> MemoryMultiVerStore {
        MemoryMultiVerStore::with_slice_size(StoreInfo::new("u", "a", "mv"), device, 4)
    }

    #[test]
    fn commits_chain_per_device() {
        let store = store("a");
        let first = store.commit(vec![(b"k".to_vec(), Some(b"hello world".to_vec()))]);
        let second = store.commit(vec![(b"k".to_vec(), None)]);
        assert_eq!(first.version, 1);
        assert!(first.left_parent.is_empty());
        assert_eq!(second.left_parent, first.commit_id);
        assert_eq!(store.latest_commits().unwrap()["a"], second);
        assert!(store.get(b"k").is_none());
        assert_eq!(store.slice_count(), 3);
    }

    #[test]
    fn identical_slices_are_stored_once() {
        let store = store("a");
        store.commit(vec![
            (b"x".to_vec(), Some(b"abcdabcd".to_vec())),
            (b"y".to_vec(), Some(b"abcd".to_vec())),
        ]);
        assert_eq!(store.slice_count(), 1);
        assert_eq!(store.get(b"x").unwrap(), b"abcdabcd");
    }

    #[test]
    fn commit_tree_skips_what_the_peer_has() {
        let store = store("a");
        let first = store.commit(vec![(b"k".to_vec(), Some(b"1".to_vec()))]);
        let second = store.commit(vec![(b"k".to_vec(), Some(b"2".to_vec()))]);
        assert_eq!(store.commit_tree(&BTreeMap::new()).unwrap(), vec![first.clone(), second.clone()]);
        let peer: BTreeMap<String, CommitNode> = [("a".to_string(), first)].into();
        assert_eq!(store.commit_tree(&peer).unwrap(), vec![second]);
    }

    #[test]
    fn commit_with_missing_slice_is_refused() {
        let source = store("a");
        let node = source.commit(vec![(b"k".to_vec(), Some(b"data".to_vec()))]);
        let entries = source.commit_data(&node.commit_id).unwrap();

        let target = store("b");
        assert!(target.put_commit_data(&node, &entries, "a").is_err());
        let hash = entries[0].slices[0];
        assert!(target.put_value_slice(&hash, b"nope").is_err());
        target.put_value_slice(&hash, b"data").unwrap();
        target.put_commit_data(&node, &entries, "a").unwrap();
        assert_eq!(target.get(b"k").unwrap(), b"data");

        target.remove_device_data("a").unwrap();
        assert!(target.get(b"k").is_none());
        assert_eq!(target.commit_count(), 0);
    }
}
