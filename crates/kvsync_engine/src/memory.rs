//! In-memory single-version store for tests and ephemeral databases.

use crate::error::{SyncError, SyncResult};
use crate::storage::{SingleVerStorage, StoreInfo, SyncDataBatch, SyncInterface};
use crate::time_helper::system_time;
use kvsync_protocol::{DataItem, SecurityOption};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// An in-memory single-version store.
///
/// Keeps the latest entry per key. Conflicts are settled on the original
/// write time; an incoming entry that only ties the stored one loses.
/// Schemas are `;`-separated field lists; a store accepts data from any
/// schema whose fields it already has.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
#[derive(Debug)]
pub struct MemorySyncStore {
    info: StoreInfo,
    schema: RwLock<String>,
    security: RwLock<SecurityOption>,
    entries: RwLock<BTreeMap<Vec<u8>, DataItem>>,
    meta: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    last_timestamp: Mutex<u64>,
    busy_puts: AtomicU32,
    received_items: AtomicU64,
}

impl MemorySyncStore {
    /// Creates an empty store.
    pub fn new(info: StoreInfo) -> Self {
        Self {
            info,
            schema: RwLock::new(String::new()),
            security: RwLock::new(SecurityOption::default()),
            entries: RwLock::new(BTreeMap::new()),
            meta: RwLock::new(HashMap::new()),
            last_timestamp: Mutex::new(0),
            busy_puts: AtomicU32::new(0),
            received_items: AtomicU64::new(0),
        }
    }

    /// Sets the schema.
    pub fn set_schema(&self, schema: impl Into<String>) {
        *self.schema.write() = schema.into();
    }

    /// Sets the security option.
    pub fn set_security_option(&self, option: SecurityOption) {
        *self.security.write() = option;
    }

    fn next_timestamp(&self) -> u64 {
        let mut last = self.last_timestamp.lock();
        *last = system_time().max(*last + 1);
        *last
    }

    /// Writes a local entry and returns its commit timestamp.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> u64 {
        let timestamp = self.next_timestamp();
        let item = DataItem::put(key, value, timestamp);
        self.entries.write().insert(item.key.clone(), item);
        timestamp
    }

    /// Deletes a local entry and returns the tombstone timestamp.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> u64 {
        let timestamp = self.next_timestamp();
        let item = DataItem::delete(key, timestamp);
        self.entries.write().insert(item.key.clone(), item);
        timestamp
    }

    /// Reads the live value of a key.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .read()
            .get(key)
            .filter(|item| !item.is_deleted())
            .map(|item| item.value.clone())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|item| !item.is_deleted())
            .count()
    }

    /// Returns true if no live key exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries accepted through [`SingleVerStorage::put_sync_data`].
    pub fn received_items(&self) -> u64 {
        self.received_items.load(Ordering::SeqCst)
    }

    /// Makes the next `count` sync writes fail with [`SyncError::Busy`].
    pub fn fail_next_puts_busy(&self, count: u32) {
        self.busy_puts.store(count, Ordering::SeqCst);
    }

    fn fields(schema: &str) -> impl Iterator<Item = &str> {
        schema.split(';').map(str::trim).filter(|field| !field.is_empty())
    }
}

impl SyncInterface for MemorySyncStore {
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
        Ok(self
            .entries
            .read()
            .values()
            .map(|item| item.timestamp)
            .max()
            .unwrap_or(0))
    }

    fn schema(&self) -> String {
        self.schema.read().clone()
    }

    fn check_schema_compatible(&self, remote_schema: &str) -> bool {
        let local = self.schema.read();
        Self::fields(remote_schema).all(|field| Self::fields(&local).any(|own| own == field))
    }

    fn security_option(&self) -> SecurityOption {
        *self.security.read()
    }
}

impl SingleVerStorage for MemorySyncStore {
    fn get_sync_data(&self, begin: u64, end: u64, max_bytes: usize) -> SyncResult<SyncDataBatch> {
        let entries = self.entries.read();
        let mut in_range: Vec<&DataItem> = entries
            .values()
            .filter(|item| item.timestamp > begin && item.timestamp <= end)
            .collect();
        in_range.sort_by_key(|item| item.timestamp);

        let mut batch = SyncDataBatch::default();
        let mut used = 0usize;
        for item in in_range {
            let len = item.calculate_len();
            if !batch.items.is_empty() && used + len > max_bytes {
                batch.has_more = true;
                break;
            }
            used += len;
            batch.items.push(item.clone());
        }
        Ok(batch)
    }

    fn put_sync_data(&self, items: &[DataItem], device: &str) -> SyncResult<()> {
        if self
            .busy_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Busy("store is saving".into()));
        }
        let mut entries = self.entries.write();
        let mut last = self.last_timestamp.lock();
        for item in items {
            let newer = entries
                .get(&item.key)
                .is_none_or(|existing| existing.write_time() < item.write_time());
            if newer {
                let mut stored = item.clone();
                if stored.origin_device.is_empty() {
                    stored.origin_device = device.to_string();
                }
                entries.insert(stored.key.clone(), stored);
            }
            *last = (*last).max(item.timestamp);
        }
        self.received_items
            .fetch_add(items.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn remove_device_data(&self, device: &str) -> SyncResult<()> {
        self.entries
            .write()
            .retain(|_, item| item.origin_device != device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemorySyncStore {
        MemorySyncStore::new(StoreInfo::new("u", "a", "s"))
    }

    #[test]
    fn local_writes_get_increasing_timestamps() {
        let store = store();
        let t1 = store.put(b"a".to_vec(), b"1".to_vec());
        let t2 = store.put(b"b".to_vec(), b"2".to_vec());
        assert!(t2 > t1);
        assert_eq!(store.max_timestamp().unwrap(), t2);
        assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn sync_data_range_is_half_open() {
        let store = store();
        let t1 = store.put(b"a".to_vec(), b"1".to_vec());
        let t2 = store.put(b"b".to_vec(), b"2".to_vec());
        let batch = store.get_sync_data(t1, t2, usize::MAX).unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].key, b"b".to_vec());
        assert!(!batch.has_more);
    }

    #[test]
    fn sync_data_is_paged_by_size() {
        let store = store();
        for i in 0..5u8 {
            store.put(vec![i], vec![0u8; 100]);
        }
        let end = store.max_timestamp().unwrap();
        let batch = store.get_sync_data(0, end, 150).unwrap();
        assert_eq!(batch.items.len(), 1);
        assert!(batch.has_more);
    }

    #[test]
    fn last_writer_wins_on_write_time() {
        let store = store();
        store.put_sync_data(&[DataItem::put(b"k".to_vec(), b"new".to_vec(), 20)], "peer")
            .unwrap();
        store.put_sync_data(&[DataItem::put(b"k".to_vec(), b"old".to_vec(), 10)], "peer")
            .unwrap();
        assert_eq!(store.get(b"k"), Some(b"new".to_vec()));
        assert_eq!(store.received_items(), 2);
    }

    #[test]
    fn echoed_entry_with_a_later_commit_time_is_not_stored_again() {
        let store = store();
        let written = store.put(b"k".to_vec(), b"v".to_vec());
        let before = store.max_timestamp().unwrap();

        let mut echo = DataItem::put(b"k".to_vec(), b"v".to_vec(), written + 394);
        echo.write_timestamp = written;
        store.put_sync_data(&[echo], "peer").unwrap();

        assert_eq!(store.max_timestamp().unwrap(), before);
        let stored = store.entries.read().get(b"k".as_slice()).cloned().unwrap();
        assert!(stored.origin_device.is_empty());
    }

    #[test]
    fn busy_puts_fail_then_recover() {
        let store = store();
        store.fail_next_puts_busy(1);
        let items = [DataItem::put(b"k".to_vec(), b"v".to_vec(), 5)];
        assert!(matches!(store.put_sync_data(&items, "p"), Err(SyncError::Busy(_))));
        store.put_sync_data(&items, "p").unwrap();
        assert_eq!(store.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn remove_device_data_keeps_local_entries() {
        let store = store();
        store.put(b"mine".to_vec(), b"1".to_vec());
        store.put_sync_data(&[DataItem::put(b"theirs".to_vec(), b"2".to_vec(), 3)], "peer")
            .unwrap();
        store.remove_device_data("peer").unwrap();
        assert!(store.get(b"theirs").is_none());
        assert!(store.get(b"mine").is_some());
    }

    #[test]
    fn schema_superset_rule() {
        let store = store();
        store.set_schema("id;name;age");
        assert!(store.check_schema_compatible("id;name"));
        assert!(store.check_schema_compatible(""));
        assert!(!store.check_schema_compatible("id;email"));
    }
}
