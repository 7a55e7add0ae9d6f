//! Persistent per-peer sync metadata.
//!
//! Each remote device has a time offset and a watermark pair. The local
//! watermark is the highest local timestamp the peer acknowledged; the peer
//! watermark is the highest peer timestamp applied here. A watermark of 0
//! means nothing was ever exchanged and all history is due.

use crate::error::SyncResult;
use crate::storage::SyncStore;
use kvsync_codec::{ParcelReader, ParcelWriter};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

const PEER_META_PREFIX: &[u8] = b"kvsync.meta.peer.";
const LOCAL_TIME_OFFSET_KEY: &[u8] = b"kvsync.meta.local_time_offset";

/// Stored state for one remote device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerMeta {
    /// Remote clock minus local clock, in ticks.
    pub time_offset: i64,
    /// Highest local timestamp acknowledged by the peer.
    pub local_watermark: u64,
    /// Highest peer timestamp applied locally.
    pub peer_watermark: u64,
}

impl PeerMeta {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ParcelWriter::with_capacity(24);
        writer.write_i64(self.time_offset);
        writer.write_u64(self.local_watermark);
        writer.write_u64(self.peer_watermark);
        writer.into_bytes()
    }

    fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let mut reader = ParcelReader::new(bytes);
        Ok(Self {
            time_offset: reader.read_i64()?,
            local_watermark: reader.read_u64()?,
            peer_watermark: reader.read_u64()?,
        })
    }
}

/// Write-through cache over the store's metadata table.
pub struct Metadata {
    store: SyncStore,
    peers: RwLock<HashMap<String, PeerMeta>>,
    local_time_offset: RwLock<i64>,
}

impl Metadata {
    /// Loads the local time offset and prepares an empty peer cache.
    pub fn new(store: SyncStore) -> SyncResult<Self> {
        let offset = match store.base().get_meta(LOCAL_TIME_OFFSET_KEY)? {
            Some(bytes) => ParcelReader::new(&bytes).read_i64()?,
            None => 0,
        };
        Ok(Self {
            store,
            peers: RwLock::new(HashMap::new()),
            local_time_offset: RwLock::new(offset),
        })
    }

    fn peer_key(device: &str) -> Vec<u8> {
        let mut key = PEER_META_PREFIX.to_vec();
        key.extend_from_slice(device.as_bytes());
        key
    }

    /// Stored state for `device`, loading it on first access.
    pub fn peer(&self, device: &str) -> SyncResult<PeerMeta> {
        if let Some(meta) = self.peers.read().get(device) {
            return Ok(*meta);
        }
        let meta = match self.store.base().get_meta(&Self::peer_key(device))? {
            Some(bytes) => PeerMeta::decode(&bytes)?,
            None => PeerMeta::default(),
        };
        let stored = *self.peers.write().entry(device.to_string()).or_insert(meta);
        Ok(stored)
    }

    fn update(&self, device: &str, change: impl FnOnce(&mut PeerMeta) -> bool) -> SyncResult<()> {
        let current = self.peer(device)?;
        let mut peers = self.peers.write();
        let meta = peers.entry(device.to_string()).or_insert(current);
        let mut next = *meta;
        if !change(&mut next) {
            return Ok(());
        }
        self.store.base().put_meta(&Self::peer_key(device), &next.encode())?;
        *meta = next;
        Ok(())
    }

    /// Clock offset of `device`.
    pub fn time_offset(&self, device: &str) -> SyncResult<i64> {
        Ok(self.peer(device)?.time_offset)
    }

    /// Persists the clock offset of `device`.
    pub fn save_time_offset(&self, device: &str, offset: i64) -> SyncResult<()> {
        self.update(device, |meta| {
            let changed = meta.time_offset != offset;
            meta.time_offset = offset;
            changed
        })
    }

    /// Highest local timestamp `device` acknowledged.
    pub fn local_watermark(&self, device: &str) -> SyncResult<u64> {
        Ok(self.peer(device)?.local_watermark)
    }

    /// Raises the local watermark of `device`; lower values are ignored.
    pub fn save_local_watermark(&self, device: &str, watermark: u64) -> SyncResult<()> {
        self.update(device, |meta| {
            if watermark <= meta.local_watermark {
                return false;
            }
            meta.local_watermark = watermark;
            true
        })
    }

    /// Sets the local watermark of `device` unconditionally.
    ///
    /// Used when the peer reports it lost state.
    pub fn reset_local_watermark(&self, device: &str, watermark: u64) -> SyncResult<()> {
        debug!(device, watermark, "local watermark reset");
        self.update(device, |meta| {
            meta.local_watermark = watermark;
            true
        })
    }

    /// Highest peer timestamp applied from `device`.
    pub fn peer_watermark(&self, device: &str) -> SyncResult<u64> {
        Ok(self.peer(device)?.peer_watermark)
    }

    /// Raises the peer watermark of `device`; 0 and lower values are ignored.
    pub fn save_peer_watermark(&self, device: &str, watermark: u64) -> SyncResult<()> {
        self.update(device, |meta| {
            if watermark == 0 || watermark <= meta.peer_watermark {
                return false;
            }
            meta.peer_watermark = watermark;
            true
        })
    }

    /// Forgets both watermarks of `device`, keeping its clock offset.
    pub fn erase_device(&self, device: &str) -> SyncResult<()> {
        self.update(device, |meta| {
            meta.local_watermark = 0;
            meta.peer_watermark = 0;
            true
        })
    }

    /// Offset applied to the system clock to form the local clock.
    pub fn local_time_offset(&self) -> i64 {
        *self.local_time_offset.read()
    }

    /// Persists the local clock offset.
    pub fn save_local_time_offset(&self, offset: i64) -> SyncResult<()> {
        let mut writer = ParcelWriter::with_capacity(8);
        writer.write_i64(offset);
        self.store
            .base()
            .put_meta(LOCAL_TIME_OFFSET_KEY, writer.as_bytes())?;
        *self.local_time_offset.write() = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySyncStore;
    use crate::storage::StoreInfo;
    use std::sync::Arc;

    fn store() -> SyncStore {
        SyncStore::single_ver(Arc::new(MemorySyncStore::new(StoreInfo::new("u", "a", "s"))))
    }

    #[test]
    fn fresh_device_starts_uninitialized() {
        let meta = Metadata::new(store()).unwrap();
        assert_eq!(meta.peer("phone").unwrap(), PeerMeta::default());
    }

    #[test]
    fn watermarks_only_move_forward() {
        let meta = Metadata::new(store()).unwrap();
        meta.save_local_watermark("phone", 50).unwrap();
        meta.save_local_watermark("phone", 20).unwrap();
        assert_eq!(meta.local_watermark("phone").unwrap(), 50);

        meta.save_peer_watermark("phone", 70).unwrap();
        meta.save_peer_watermark("phone", 0).unwrap();
        assert_eq!(meta.peer_watermark("phone").unwrap(), 70);
    }

    #[test]
    fn reset_and_erase_are_explicit() {
        let meta = Metadata::new(store()).unwrap();
        meta.save_local_watermark("phone", 50).unwrap();
        meta.reset_local_watermark("phone", 10).unwrap();
        assert_eq!(meta.local_watermark("phone").unwrap(), 10);

        meta.save_time_offset("phone", -7).unwrap();
        meta.save_peer_watermark("phone", 9).unwrap();
        meta.erase_device("phone").unwrap();
        let peer = meta.peer("phone").unwrap();
        assert_eq!(peer.local_watermark, 0);
        assert_eq!(peer.peer_watermark, 0);
        assert_eq!(peer.time_offset, -7);
    }

    #[test]
    fn state_survives_reload() {
        let store = store();
        let meta = Metadata::new(store.clone()).unwrap();
        meta.save_local_watermark("phone", 11).unwrap();
        meta.save_peer_watermark("phone", 22).unwrap();
        meta.save_time_offset("phone", 33).unwrap();
        meta.save_local_time_offset(-44).unwrap();

        let reloaded = Metadata::new(store).unwrap();
        assert_eq!(
            reloaded.peer("phone").unwrap(),
            PeerMeta {
                time_offset: 33,
                local_watermark: 11,
                peer_watermark: 22,
            }
        );
        assert_eq!(reloaded.local_time_offset(), -44);
    }
}
