//! Communicator abstraction consumed by the sync engine.

use crate::error::{SyncError, SyncResult};
use kvsync_protocol::Message;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Invoked with `(source device, message)` for every inbound message.
pub type MessageCallback = Arc<dyn Fn(&str, Message) + Send + Sync>;

/// Invoked with `(device, online)` when a device appears or disappears.
pub type ConnectCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Point-to-point messaging between devices.
///
/// This trait abstracts the physical transport and device discovery.
/// Delivery may be lost or reordered; the sync layer recovers through its
/// own timeouts and resends.
///
/// Implementations must not invoke the registered message callback from
/// inside `send_message` on the calling thread.
pub trait Communicator: Send + Sync {
    /// Sends a message to `target`.
    fn send_message(&self, target: &str, message: Message, timeout: Duration) -> SyncResult<()>;

    /// Registers the inbound message callback, replacing any previous one.
    fn register_message_callback(&self, callback: MessageCallback);

    /// Registers the device presence callback, replacing any previous one.
    fn register_connect_callback(&self, callback: ConnectCallback);

    /// Identifier of the local device.
    fn local_identity(&self) -> String;

    /// Largest message the transport carries to `target` in one piece.
    fn mtu_size(&self, target: &str) -> usize;
}

/// A communicator that records outgoing messages, for testing.
#[derive(Default)]
pub struct MockCommunicator {
    identity: String,
    sent: Mutex<Vec<(String, Message)>>,
    offline: RwLock<HashSet<String>>,
    fail_sends: AtomicBool,
    message_callback: RwLock<Option<MessageCallback>>,
    connect_callback: RwLock<Option<ConnectCallback>>,
}

impl MockCommunicator {
    /// Creates a mock for the local device `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Drains and returns recorded messages.
    pub fn take_sent(&self) -> Vec<(String, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Number of recorded messages.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Makes every send fail with a fatal transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Marks a device unreachable.
    pub fn set_offline(&self, device: &str, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(device.to_string());
        } else {
            set.remove(device);
        }
    }

    /// Delivers an inbound message through the registered callback.
    pub fn deliver(&self, source: &str, message: Message) {
        let callback = self.message_callback.read().clone();
        if let Some(callback) = callback {
            callback(source, message);
        }
    }

    /// Reports a presence change through the registered callback.
    pub fn notify_presence(&self, device: &str, online: bool) {
        let callback = self.connect_callback.read().clone();
        if let Some(callback) = callback {
            callback(device, online);
        }
    }
}

impl Communicator for MockCommunicator {
    fn send_message(&self, target: &str, message: Message, _timeout: Duration) -> SyncResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("mock send failure"));
        }
        if self.offline.read().contains(target) {
            return Err(SyncError::PeerNotConnected(target.to_string()));
        }
        self.sent.lock().push((target.to_string(), message));
        Ok(())
    }

    fn register_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.write() = Some(callback);
    }

    fn register_connect_callback(&self, callback: ConnectCallback) {
        *self.connect_callback.write() = Some(callback);
    }

    fn local_identity(&self) -> String {
        self.identity.clone()
    }

    fn mtu_size(&self, _target: &str) -> usize {
        64 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_protocol::Payload;

    #[test]
    fn mock_records_messages() {
        let comm = MockCommunicator::new("local");
        assert_eq!(comm.local_identity(), "local");
        comm.send_message("peer", Message::notify(Payload::DataChanged), Duration::from_secs(1))
            .unwrap();
        let sent = comm.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "peer");
        assert_eq!(comm.sent_count(), 0);
    }

    #[test]
    fn mock_offline_and_failure() {
        let comm = MockCommunicator::new("local");
        comm.set_offline("peer", true);
        let err = comm
            .send_message("peer", Message::notify(Payload::DataChanged), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SyncError::PeerNotConnected(_)));

        comm.set_offline("peer", false);
        comm.set_fail_sends(true);
        assert!(comm
            .send_message("peer", Message::notify(Payload::DataChanged), Duration::ZERO)
            .is_err());
    }

    #[test]
    fn mock_delivers_to_callback() {
        let comm = MockCommunicator::new("local");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        comm.register_message_callback(Arc::new(move |device: &str, _message: Message| {
            sink.lock().push(device.to_string());
        }));
        comm.deliver("peer", Message::notify(Payload::DataChanged));
        assert_eq!(seen.lock().as_slice(), ["peer".to_string()]);
    }
}
