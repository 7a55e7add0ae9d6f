//! Inbound message queue with a byte budget.
//!
//! Every admitted message is charged against the budget from arrival until
//! its handler returns. Messages that would push the total over the budget
//! are dropped and counted. Up to `max_exec_tasks` messages are handled at
//! once; the rest wait in FIFO order and are picked up by the worker that
//! finishes next.

use kvsync_protocol::{Message, Payload};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A message waiting for, or holding, a dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedMessage {
    pub(crate) device: String,
    pub(crate) message: Message,
    pub(crate) cost: usize,
}

/// Outcome of [`MessageQueue::admit`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Handle now; the caller owns a dispatch slot.
    Dispatch(QueuedMessage),
    /// Waiting for a free slot.
    Queued,
    /// A data-changed notice for the device is already waiting.
    Coalesced,
    /// Over budget.
    Discarded,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<QueuedMessage>,
    cache_size: usize,
    running: usize,
}

pub(crate) struct MessageQueue {
    inner: Mutex<QueueInner>,
    max_cache_size: AtomicUsize,
    max_exec_tasks: usize,
    discarded: AtomicU64,
}

impl MessageQueue {
    pub(crate) fn new(max_cache_size: usize, max_exec_tasks: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_cache_size: AtomicUsize::new(max_cache_size),
            max_exec_tasks: max_exec_tasks.max(1),
            discarded: AtomicU64::new(0),
        }
    }

    pub(crate) fn admit(&self, device: &str, message: Message) -> Admission {
        let cost = message.calculate_len();
        let mut inner = self.inner.lock();
        if inner.cache_size + cost > self.max_cache_size.load(Ordering::SeqCst) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            return Admission::Discarded;
        }
        if matches!(message.payload, Payload::DataChanged)
            && inner.pending.iter().any(|queued| {
                queued.device == device && matches!(queued.message.payload, Payload::DataChanged)
            })
        {
            return Admission::Coalesced;
        }
        inner.cache_size += cost;
        let entry = QueuedMessage {
            device: device.to_string(),
            message,
            cost,
        };
        if inner.running < self.max_exec_tasks {
            inner.running += 1;
            Admission::Dispatch(entry)
        } else {
            inner.pending.push_back(entry);
            Admission::Queued
        }
    }

    /// Releases a handled message's budget and hands the slot to the next
    /// waiting message, if any.
    pub(crate) fn complete(&self, cost: usize) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        inner.cache_size = inner.cache_size.saturating_sub(cost);
        let next = inner.pending.pop_front();
        if next.is_none() {
            inner.running = inner.running.saturating_sub(1);
        }
        next
    }

    /// Drops every waiting message; returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.pending.len();
        let released: usize = inner.pending.drain(..).map(|queued| queued.cost).sum();
        inner.cache_size = inner.cache_size.saturating_sub(released);
        dropped
    }

    pub(crate) fn cache_size(&self) -> usize {
        self.inner.lock().cache_size
    }

    pub(crate) fn exec_task_count(&self) -> usize {
        self.inner.lock().running
    }

    pub(crate) fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }

    pub(crate) fn max_cache_size(&self) -> usize {
        self.max_cache_size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_max_cache_size(&self, size: usize) {
        self.max_cache_size.store(size, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_protocol::{DataItem, DataRequestPacket, SyncMode};

    fn data_message(value_len: usize) -> Message {
        let mut packet = DataRequestPacket::new(SyncMode::Push);
        packet.data.push(DataItem::put(b"k".to_vec(), vec![7; value_len], 1));
        Message::request(1, 1, Payload::DataRequest(packet))
    }

    #[test]
    fn one_byte_over_budget_is_discarded() {
        let message = data_message(10 * 1024);
        let cost = message.calculate_len();
        let queue = MessageQueue::new(2 * cost - 1, 4);

        assert!(matches!(queue.admit("a", message.clone()), Admission::Dispatch(_)));
        assert_eq!(queue.admit("a", message), Admission::Discarded);
        assert_eq!(queue.discarded(), 1);
        assert_eq!(queue.cache_size(), cost);
    }

    #[test]
    fn slots_pass_to_waiting_messages_in_order() {
        let queue = MessageQueue::new(usize::MAX, 1);
        let first = data_message(1);
        let Admission::Dispatch(running) = queue.admit("a", first) else {
            panic!("first message should dispatch");
        };
        assert_eq!(queue.admit("b", data_message(2)), Admission::Queued);
        assert_eq!(queue.admit("c", data_message(3)), Admission::Queued);
        assert_eq!(queue.exec_task_count(), 1);

        let next = queue.complete(running.cost).unwrap();
        assert_eq!(next.device, "b");
        let next = queue.complete(next.cost).unwrap();
        assert_eq!(next.device, "c");
        assert!(queue.complete(next.cost).is_none());
        assert_eq!(queue.exec_task_count(), 0);
        assert_eq!(queue.cache_size(), 0);
    }

    #[test]
    fn waiting_data_changed_notices_coalesce_per_device() {
        let queue = MessageQueue::new(usize::MAX, 1);
        assert!(matches!(queue.admit("a", data_message(1)), Admission::Dispatch(_)));
        let notice = Message::notify(Payload::DataChanged);
        assert_eq!(queue.admit("b", notice.clone()), Admission::Queued);
        assert_eq!(queue.admit("b", notice.clone()), Admission::Coalesced);
        assert_eq!(queue.admit("c", notice), Admission::Queued);
        assert_eq!(queue.clear(), 2);
    }
}
