//! End-to-end single-version sync between engines on an in-memory network.

use kvsync_engine::{SyncRequest, SyncStatus};
use kvsync_protocol::MessageId;
use kvsync_testkit::prelude::*;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn pair() -> (Cluster, Arc<MemorySyncStore>, Arc<MemorySyncStore>) {
    init_tracing();
    let mut cluster = Cluster::new();
    let a = cluster.add_peer("a", fast_config());
    let b = cluster.add_peer("b", fast_config());
    cluster.connect_all();
    (cluster, a, b)
}

fn sync(cluster: &Cluster, from: &str, to: &str, mode: SyncMode) -> SyncStatus {
    let statuses = cluster
        .syncer(from)
        .sync_and_wait(vec![to.to_string()], mode)
        .unwrap();
    statuses[to]
}

#[test]
fn push_copies_entries_to_the_peer() {
    let (cluster, a, b) = pair();
    a.put("k1", "v1");
    a.put("k2", "v2");
    a.put("k3", "v3");

    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(b.len(), 3);
    assert_eq!(b.get(b"k2").unwrap(), b"v2");
}

#[test]
fn pull_fetches_peer_entries() {
    let (cluster, a, b) = pair();
    b.put("x", "1");
    b.put("y", "2");

    assert_eq!(sync(&cluster, "a", "b", SyncMode::Pull), SyncStatus::Finished);
    assert_eq!(a.get(b"x").unwrap(), b"1");
    assert_eq!(a.get(b"y").unwrap(), b"2");
    assert_eq!(b.received_items(), 0);
}

#[test]
fn push_and_pull_converges_both_sides() {
    let (cluster, a, b) = pair();
    a.put("from-a", "1");
    b.put("from-b", "2");

    assert_eq!(sync(&cluster, "a", "b", SyncMode::PushAndPull), SyncStatus::Finished);
    for store in [&a, &b] {
        assert_eq!(store.get(b"from-a").unwrap(), b"1");
        assert_eq!(store.get(b"from-b").unwrap(), b"2");
    }
}

#[test]
fn push_and_pull_settles_under_clock_skew() {
    let (cluster, a, b) = pair();
    cluster.syncer("b").on_local_time_changed(-50).unwrap();
    a.put("from-a", "1");
    b.put("from-b", "2");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::PushAndPull), SyncStatus::Finished);
    assert_eq!((a.received_items(), b.received_items()), (1, 1));

    for _ in 0..3 {
        assert_eq!(sync(&cluster, "a", "b", SyncMode::PushAndPull), SyncStatus::Finished);
        assert_eq!(sync(&cluster, "b", "a", SyncMode::PushAndPull), SyncStatus::Finished);
    }
    assert_eq!((a.received_items(), b.received_items()), (1, 1));
    for store in [&a, &b] {
        assert_eq!(store.get(b"from-a").unwrap(), b"1");
        assert_eq!(store.get(b"from-b").unwrap(), b"2");
    }
}

#[test]
fn pushed_entries_do_not_travel_back() {
    let (cluster, a, b) = pair();
    cluster.syncer("a").on_local_time_changed(-50).unwrap();
    a.put("k1", "v1");
    a.put("k2", "v2");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(sync(&cluster, "b", "a", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(a.received_items(), 0);
    assert_eq!(b.received_items(), 2);

    b.put("k3", "v3");
    assert_eq!(sync(&cluster, "b", "a", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(a.received_items(), 1);
    assert_eq!(a.get(b"k3").unwrap(), b"v3");
}

#[test]
fn repeated_push_only_sends_new_entries() {
    let (cluster, a, b) = pair();
    a.put("k1", "v1");
    a.put("k2", "v2");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(b.received_items(), 2);

    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(b.received_items(), 2);

    a.put("k3", "v3");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(b.received_items(), 3);
}

#[test]
fn lost_ack_resends_without_applying_twice() {
    let (cluster, a, b) = pair();
    a.put("k1", "v1");
    a.put("k2", "v2");
    cluster
        .network()
        .drop_next_responses("b", "a", MessageId::DataSync, 1);

    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(cluster.network().dropped_count(), 1);
    assert_eq!(b.received_items(), 2);
    assert_eq!(b.len(), 2);
}

#[test]
fn small_transfer_unit_pages_entries() {
    init_tracing();
    let mut cluster = Cluster::with_network(MemoryNetwork::with_mtu(512));
    let a = cluster.add_peer("a", fast_config());
    let b = cluster.add_peer("b", fast_config());
    cluster.connect_all();
    for i in 0..40 {
        a.put(format!("key-{i:02}"), vec![b'v'; 64]);
    }

    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(b.len(), 40);
    assert_eq!(b.received_items(), 40);
    // many packets, each acknowledged
    assert!(cluster.network().delivered_count() > 20);
}

#[test]
fn tombstones_propagate() {
    let (cluster, a, b) = pair();
    a.put("k", "v");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert!(b.get(b"k").is_some());

    a.delete("k");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert!(b.get(b"k").is_none());
}

#[test]
fn newer_write_wins_on_both_sides() {
    let (cluster, a, b) = pair();
    a.put("k", "old");
    std::thread::sleep(Duration::from_millis(2));
    b.put("k", "new");

    assert_eq!(sync(&cluster, "a", "b", SyncMode::PushAndPull), SyncStatus::Finished);
    assert_eq!(a.get(b"k").unwrap(), b"new");
    assert_eq!(b.get(b"k").unwrap(), b"new");
}

#[test]
fn removed_device_data_is_sent_again() {
    let (cluster, a, b) = pair();
    a.put("k1", "v1");
    a.put("k2", "v2");
    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);

    cluster.syncer("b").remove_device_data("a").unwrap();
    assert!(b.is_empty());

    assert_eq!(sync(&cluster, "a", "b", SyncMode::Push), SyncStatus::Finished);
    assert_eq!(b.len(), 2);
    assert_eq!(b.received_items(), 4);
}

#[test]
fn operations_on_one_device_complete_in_order() {
    let (cluster, a, b) = pair();
    a.put("k", "v");
    let (tx, rx) = mpsc::channel();
    for label in ["first", "second"] {
        let tx = tx.clone();
        cluster
            .syncer("a")
            .sync(
                SyncRequest::new(vec!["b".into()], SyncMode::Push).with_on_complete(move |statuses| {
                    let _ = tx.send((label, statuses["b"]));
                }),
            )
            .unwrap();
    }

    let first = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(first, ("first", SyncStatus::Finished));
    assert_eq!(second, ("second", SyncStatus::Finished));
    assert_eq!(b.received_items(), 1);
}

#[test]
fn blocking_sync_returns_after_completion() {
    let (cluster, a, _b) = pair();
    a.put("k", "v");
    let (tx, rx) = mpsc::channel();
    cluster
        .syncer("a")
        .sync(
            SyncRequest::new(vec!["b".into()], SyncMode::Push)
                .with_wait()
                .with_on_complete(move |statuses| {
                    let _ = tx.send(statuses["b"]);
                }),
        )
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), SyncStatus::Finished);
    assert_eq!(cluster.syncer("a").engine().operation_count(), 0);
}

#[test]
fn data_changed_notice_reaches_peers() {
    let (cluster, _a, _b) = pair();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    cluster
        .syncer("b")
        .set_remote_data_changed_callback(Arc::new(move |device: &str| {
            let _ = tx.lock().send(device.to_string());
        }));

    cluster.syncer("a").local_data_changed();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
}
