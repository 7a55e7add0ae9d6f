//! Logical clock shared by every context of one store.
//!
//! Timestamps are `u64` counts of 100ns ticks since the Unix epoch. The
//! local clock is the system clock shifted by a persisted offset, and never
//! returns the same value twice.

use crate::error::SyncResult;
use crate::metadata::Metadata;
use crate::storage::SyncStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: u64 = 10_000;

/// Current system time in ticks.
pub fn system_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| (elapsed.as_nanos() / 100) as u64)
        .unwrap_or(0)
}

/// Monotonic logical clock of the local store.
pub struct TimeHelper {
    store: SyncStore,
    metadata: Arc<Metadata>,
    last: Mutex<u64>,
}

impl TimeHelper {
    /// Creates the clock, seeded so it starts above every stored entry.
    pub fn new(store: SyncStore, metadata: Arc<Metadata>) -> SyncResult<Self> {
        let last = store.base().max_timestamp()?;
        Ok(Self {
            store,
            metadata,
            last: Mutex::new(last),
        })
    }

    /// Next logical timestamp.
    pub fn now(&self) -> u64 {
        let shifted = apply_offset(system_time(), self.metadata.local_time_offset());
        let mut last = self.last.lock();
        *last = shifted.max(*last + 1);
        *last
    }

    /// Converts a timestamp from a peer whose offset is `offset` (remote
    /// minus local) into the local clock, never beyond the current time.
    pub fn to_local(&self, remote: u64, offset: i64) -> u64 {
        apply_offset(remote, offset.saturating_neg()).min(self.now())
    }

    /// Recomputes the local offset after the system clock moved by
    /// `delta_ms` milliseconds.
    ///
    /// The resulting clock always stays ahead of the latest stored entry.
    pub fn on_local_time_changed(&self, delta_ms: i64) -> SyncResult<i64> {
        let previous = self.metadata.local_time_offset();
        let mut offset = previous.saturating_sub(delta_ms.saturating_mul(TICKS_PER_MILLISECOND as i64));
        let system = system_time();
        let max_item = self.store.base().max_timestamp()?;
        if apply_offset(system, offset) <= max_item {
            offset = (i128::from(max_item) - i128::from(system) + i128::from(TICKS_PER_MILLISECOND))
                .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        }
        self.metadata.save_local_time_offset(offset)?;
        info!(delta_ms, previous, offset, "local time offset updated");
        Ok(offset)
    }
}

/// Shifts `time` by a signed tick offset, saturating at the u64 bounds.
pub(crate) fn apply_offset(time: u64, offset: i64) -> u64 {
    (i128::from(time) + i128::from(offset)).clamp(0, i128::from(u64::MAX)) as u64
}

/// Offset of the remote clock relative to ours from one time sync round.
///
/// `sb`/`se` are local send and receive times, `tb`/`te` the remote's
/// receive and send times.
pub fn calculate_offset(sb: u64, se: u64, tb: u64, te: u64) -> i64 {
    let (sb, se, tb, te) = (i128::from(sb), i128::from(se), i128::from(tb), i128::from(te));
    let round_trip = (se - sb) - (te - tb);
    let forward = tb - sb - round_trip / 2;
    let backward = te + round_trip / 2 - se;
    (forward / 2 + backward / 2).clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySyncStore;
    use crate::storage::StoreInfo;

    fn helper() -> (Arc<MemorySyncStore>, TimeHelper) {
        let mem = Arc::new(MemorySyncStore::new(StoreInfo::new("u", "a", "s")));
        let store = SyncStore::single_ver(mem.clone());
        let metadata = Arc::new(Metadata::new(store.clone()).unwrap());
        (mem, TimeHelper::new(store, metadata).unwrap())
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let (_, clock) = helper();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn symmetric_delay_yields_exact_offset() {
        // remote is 1000 ticks ahead, 10 ticks each way, 4 ticks processing
        let offset = calculate_offset(100, 124, 1110, 1114);
        assert_eq!(offset, 1000);
        let negative = calculate_offset(5000, 5020, 4010, 4010);
        assert_eq!(negative, -1000);
    }

    #[test]
    fn to_local_never_exceeds_now() {
        let (_, clock) = helper();
        let future = system_time() + 3_600 * 1000 * TICKS_PER_MILLISECOND;
        let converted = clock.to_local(future, 0);
        assert!(converted <= clock.now());
        assert_eq!(clock.to_local(5000, 1000), 4000);
    }

    #[test]
    fn clock_change_keeps_time_above_stored_items() {
        let (mem, clock) = helper();
        let written = mem.put(b"k".to_vec(), b"v".to_vec());
        // a one hour setback would put the clock behind the entry
        let offset = clock.on_local_time_changed(-3_600_000).unwrap();
        assert!(offset > 0);
        assert!(clock.now() > written);
    }

    #[test]
    fn clock_change_subtracts_delta() {
        let (_, clock) = helper();
        let offset = clock.on_local_time_changed(10).unwrap();
        assert_eq!(offset, -10 * TICKS_PER_MILLISECOND as i64);
    }
}
