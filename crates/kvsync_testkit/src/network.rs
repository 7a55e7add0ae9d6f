//! In-memory transport connecting engines in one process.
//!
//! Every message is encoded to bytes and decoded again on delivery, so
//! tests exercise the wire format end to end. Delivery happens on a
//! dedicated thread, never inside `send_message`, in send order.

use kvsync_engine::{Communicator, ConnectCallback, MessageCallback, SyncError, SyncResult};
use kvsync_protocol::{Message, MessageId, MessageType};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default MTU reported by endpoints.
pub const DEFAULT_MTU: usize = 64 * 1024;

type Link = (String, String);

/// Rule dropping the next `remaining` messages of one kind on one link.
struct DropRule {
    source: String,
    target: String,
    kind: Option<MessageId>,
    response_only: bool,
    remaining: usize,
}

struct Envelope {
    source: String,
    target: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Endpoints {
    message: HashMap<String, MessageCallback>,
    connect: HashMap<String, ConnectCallback>,
}

/// A set of devices that can message each other.
pub struct MemoryNetwork {
    endpoints: RwLock<Endpoints>,
    down: RwLock<HashSet<Link>>,
    blackholed: RwLock<HashSet<Link>>,
    drop_rules: Mutex<Vec<DropRule>>,
    mtu: usize,
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    /// Creates a network whose endpoints report [`DEFAULT_MTU`].
    pub fn new() -> Arc<Self> {
        Self::with_mtu(DEFAULT_MTU)
    }

    /// Creates a network whose endpoints report `mtu`.
    pub fn with_mtu(mtu: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let network = Arc::new(Self {
            endpoints: RwLock::new(Endpoints::default()),
            down: RwLock::new(HashSet::new()),
            blackholed: RwLock::new(HashSet::new()),
            drop_rules: Mutex::new(Vec::new()),
            mtu,
            sender: Mutex::new(Some(tx)),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&network);
        thread::spawn(move || deliver_loop(weak, rx));
        network
    }

    /// Creates the communicator of `device`.
    pub fn endpoint(self: &Arc<Self>, device: impl Into<String>) -> Arc<MemoryCommunicator> {
        Arc::new(MemoryCommunicator {
            device: device.into(),
            network: self.clone(),
        })
    }

    /// Announces `a` and `b` to each other as online.
    pub fn connect(&self, a: &str, b: &str) {
        self.set_link(a, b, true);
    }

    /// Takes the link between `a` and `b` down: both sides see the other
    /// go offline and sends fail.
    pub fn disconnect(&self, a: &str, b: &str) {
        self.set_link(a, b, false);
    }

    fn set_link(&self, a: &str, b: &str, online: bool) {
        {
            let mut down = self.down.write();
            for link in [link(a, b), link(b, a)] {
                if online {
                    down.remove(&link);
                } else {
                    down.insert(link);
                }
            }
        }
        let endpoints = self.endpoints.read();
        let (to_a, to_b) = (endpoints.connect.get(a).cloned(), endpoints.connect.get(b).cloned());
        drop(endpoints);
        if let Some(callback) = to_a {
            callback(b, online);
        }
        if let Some(callback) = to_b {
            callback(a, online);
        }
    }

    /// Silently drops everything from `source` to `target` while set.
    pub fn set_blackhole(&self, source: &str, target: &str, enabled: bool) {
        let mut blackholed = self.blackholed.write();
        if enabled {
            blackholed.insert(link(source, target));
        } else {
            blackholed.remove(&link(source, target));
        }
    }

    /// Drops the next `count` messages from `source` to `target`, optionally
    /// only those of `kind`.
    pub fn drop_next(&self, source: &str, target: &str, kind: Option<MessageId>, count: usize) {
        self.push_rule(source, target, kind, false, count);
    }

    /// Drops the next `count` responses of `kind` from `source` to `target`.
    pub fn drop_next_responses(&self, source: &str, target: &str, kind: MessageId, count: usize) {
        self.push_rule(source, target, Some(kind), true, count);
    }

    fn push_rule(&self, source: &str, target: &str, kind: Option<MessageId>, response_only: bool, count: usize) {
        self.drop_rules.lock().push(DropRule {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            response_only,
            remaining: count,
        });
    }

    /// Messages handed to a receiver so far.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Messages dropped by blackholes or drop rules so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Stops the delivery thread; later sends fail.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    fn consume_drop_rule(&self, source: &str, target: &str, message: &Message) -> bool {
        let mut rules = self.drop_rules.lock();
        let hit = rules.iter_mut().find(|rule| {
            rule.remaining > 0
                && rule.source == source
                && rule.target == target
                && rule.kind.is_none_or(|kind| kind == message.message_id())
                && (!rule.response_only || message.message_type == MessageType::Response)
        });
        match hit {
            Some(rule) => {
                rule.remaining -= 1;
                true
            }
            None => false,
        }
    }

    fn send(&self, source: &str, target: &str, message: Message) -> SyncResult<()> {
        if self.down.read().contains(&link(source, target)) {
            return Err(SyncError::PeerNotConnected(target.to_string()));
        }
        if !self.endpoints.read().message.contains_key(target) {
            return Err(SyncError::PeerNotConnected(target.to_string()));
        }
        if self.blackholed.read().contains(&link(source, target))
            || self.consume_drop_rule(source, target, &message)
        {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(source, target, kind = ?message.message_id(), "message dropped");
            return Ok(());
        }
        let bytes = message.encode()?;
        let sender = self.sender.lock().clone();
        let sender = sender.ok_or_else(|| SyncError::transport_fatal("network shut down"))?;
        sender
            .send(Envelope {
                source: source.to_string(),
                target: target.to_string(),
                bytes,
            })
            .map_err(|_| SyncError::transport_fatal("network shut down"))
    }
}

fn link(source: &str, target: &str) -> Link {
    (source.to_string(), target.to_string())
}

fn deliver_loop(network: Weak<MemoryNetwork>, rx: mpsc::Receiver<Envelope>) {
    while let Ok(envelope) = rx.recv() {
        let Some(network) = network.upgrade() else {
            return;
        };
        let message = match Message::decode(&envelope.bytes) {
            Ok(message) => message,
            Err(error) => {
                warn!(source = %envelope.source, target = %envelope.target, %error, "undecodable message");
                continue;
            }
        };
        let callback = network.endpoints.read().message.get(&envelope.target).cloned();
        if let Some(callback) = callback {
            trace!(source = %envelope.source, target = %envelope.target, kind = ?message.message_id(), "delivering");
            network.delivered.fetch_add(1, Ordering::SeqCst);
            callback(&envelope.source, message);
        }
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("mtu", &self.mtu)
            .field("delivered", &self.delivered_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

/// One device's view of a [`MemoryNetwork`].
pub struct MemoryCommunicator {
    device: String,
    network: Arc<MemoryNetwork>,
}

impl MemoryCommunicator {
    /// The network this endpoint belongs to.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl Communicator for MemoryCommunicator {
    fn send_message(&self, target: &str, message: Message, _timeout: Duration) -> SyncResult<()> {
        self.network.send(&self.device, target, message)
    }

    fn register_message_callback(&self, callback: MessageCallback) {
        self.network
            .endpoints
            .write()
            .message
            .insert(self.device.clone(), callback);
    }

    fn register_connect_callback(&self, callback: ConnectCallback) {
        self.network
            .endpoints
            .write()
            .connect
            .insert(self.device.clone(), callback);
    }

    fn local_identity(&self) -> String {
        self.device.clone()
    }

    fn mtu_size(&self, _target: &str) -> usize {
        self.network.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_protocol::{Payload, TimeSyncPacket};

    fn collector(endpoint: &MemoryCommunicator) -> mpsc::Receiver<(String, Message)> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        endpoint.register_message_callback(Arc::new(move |source: &str, message: Message| {
            let _ = tx.lock().send((source.to_string(), message));
        }));
        rx
    }

    fn time_sync(session_id: u32) -> Message {
        Message::request(session_id, 1, Payload::TimeSync(TimeSyncPacket::request(7)))
    }

    #[test]
    fn delivers_decoded_messages_in_order() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");
        let inbox = collector(&b);

        a.send_message("b", time_sync(1), Duration::ZERO).unwrap();
        a.send_message("b", time_sync(2), Duration::ZERO).unwrap();
        let (source, first) = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
        let (_, second) = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(source, "a");
        assert_eq!(first, time_sync(1));
        assert_eq!(second.session_id, 2);
    }

    #[test]
    fn unknown_or_disconnected_targets_fail() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");
        let _inbox = collector(&b);
        assert!(matches!(
            a.send_message("nobody", time_sync(1), Duration::ZERO),
            Err(SyncError::PeerNotConnected(_))
        ));
        network.disconnect("a", "b");
        assert!(a.send_message("b", time_sync(1), Duration::ZERO).is_err());
        network.connect("a", "b");
        assert!(a.send_message("b", time_sync(1), Duration::ZERO).is_ok());
    }

    #[test]
    fn drop_rules_consume_matching_messages() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");
        let inbox = collector(&b);
        network.drop_next("a", "b", Some(MessageId::TimeSync), 1);

        a.send_message("b", time_sync(1), Duration::ZERO).unwrap();
        a.send_message("b", time_sync(2), Duration::ZERO).unwrap();
        let (_, message) = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message.session_id, 2);
        assert_eq!(network.dropped_count(), 1);
    }

    #[test]
    fn connect_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("a");
        let b = network.endpoint("b");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for endpoint in [&a, &b] {
            let seen = seen.clone();
            let me = endpoint.local_identity();
            endpoint.register_connect_callback(Arc::new(move |peer: &str, online: bool| {
                seen.lock().push(format!("{me}:{peer}:{online}"));
            }));
        }
        network.connect("a", "b");
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:b:true", "b:a:true"]);
    }
}
