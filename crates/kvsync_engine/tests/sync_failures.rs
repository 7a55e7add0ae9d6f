//! Failure handling across engines: unreachable peers, refusals and
//! overload.

use kvsync_engine::{
    CheckFlag, DeviceDenyList, EngineConfig, RetryConfig, SyncError, SyncRequest, SyncStatus,
    SyncStore,
};
use kvsync_protocol::{SecurityLabel, SecurityOption};
use kvsync_testkit::prelude::*;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn short_retry_config() -> EngineConfig {
    fast_config()
        .with_response_timeout(Duration::from_millis(150))
        .with_retry(RetryConfig::new(2).with_initial_delay(Duration::ZERO).without_jitter())
}

fn peer_with_gate(cluster: &mut Cluster, device: &str, gate: Arc<DeviceDenyList>) -> Arc<MemorySyncStore> {
    let store = Arc::new(MemorySyncStore::new(test_store_info()));
    cluster.add_peer_with(device, fast_config(), SyncStore::single_ver(store.clone()), gate);
    store
}

#[test]
fn silent_peer_times_out_without_affecting_others() {
    init_tracing();
    let mut cluster = Cluster::new();
    let a = cluster.add_peer("a", short_retry_config());
    let b = cluster.add_peer("b", fast_config());
    cluster.add_peer("c", fast_config());
    cluster.connect_all();
    cluster.network().set_blackhole("a", "c", true);
    a.put("k", "v");

    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into(), "c".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::Finished);
    assert_eq!(statuses["c"], SyncStatus::Failed);
    assert_eq!(b.get(b"k").unwrap(), b"v");
}

#[test]
fn disconnected_peer_fails_fast() {
    init_tracing();
    let mut cluster = Cluster::new();
    cluster.add_peer("a", fast_config());
    cluster.add_peer("b", fast_config());
    cluster.connect_all();
    cluster.network().disconnect("a", "b");
    assert!(cluster.syncer("a").online_devices().is_empty());

    let started = Instant::now();
    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::Failed);
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[test]
fn local_permission_gate_fails_before_any_traffic() {
    init_tracing();
    let mut cluster = Cluster::new();
    let gate = Arc::new(DeviceDenyList::new());
    gate.deny("b", CheckFlag::Send);
    peer_with_gate(&mut cluster, "a", gate);
    cluster.add_peer("b", fast_config());
    cluster.connect_all();

    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::PermissionCheckFailed);
    assert_eq!(cluster.network().delivered_count(), 0);
}

#[test]
fn remote_permission_refusal_is_reported() {
    init_tracing();
    let mut cluster = Cluster::new();
    let a = cluster.add_peer("a", fast_config());
    let gate = Arc::new(DeviceDenyList::new());
    gate.deny("a", CheckFlag::Receive);
    let b = peer_with_gate(&mut cluster, "b", gate);
    cluster.connect_all();
    a.put("k", "v");

    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::PermissionCheckFailed);
    assert!(b.is_empty());
}

#[test]
fn schema_the_peer_cannot_store_is_refused() {
    init_tracing();
    let mut cluster = Cluster::new();
    let a = cluster.add_peer("a", fast_config());
    let b = cluster.add_peer("b", fast_config());
    cluster.connect_all();
    a.set_schema("name;age");
    b.set_schema("name");
    a.put("k", "v");

    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::SchemaIncompatible);
    assert!(b.is_empty());

    // the narrower schema still flows into the wider one
    b.put("j", "w");
    let statuses = cluster
        .syncer("b")
        .sync_and_wait(vec!["a".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["a"], SyncStatus::Finished);
    assert_eq!(a.get(b"j").unwrap(), b"w");
}

#[test]
fn higher_label_never_flows_to_lower() {
    init_tracing();
    let mut cluster = Cluster::new();
    let a = cluster.add_peer("a", fast_config());
    let b = cluster.add_peer("b", fast_config());
    cluster.connect_all();
    a.set_security_option(SecurityOption::new(SecurityLabel::S3, 0));
    b.set_security_option(SecurityOption::new(SecurityLabel::S1, 0));
    a.put("secret", "v");
    b.put("public", "w");

    let push = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(push["b"], SyncStatus::SecurityOptionCheckFailure);
    assert!(b.get(b"secret").is_none());

    let pull = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Pull)
        .unwrap();
    assert_eq!(pull["b"], SyncStatus::Finished);
    assert_eq!(a.get(b"public").unwrap(), b"w");
}

#[test]
fn busy_receiver_gets_the_packet_again() {
    init_tracing();
    let mut cluster = Cluster::new();
    let a = cluster.add_peer("a", fast_config());
    let b = cluster.add_peer("b", fast_config());
    cluster.connect_all();
    b.fail_next_puts_busy(1);
    a.put("k", "v");

    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::Finished);
    assert_eq!(b.get(b"k").unwrap(), b"v");
    assert_eq!(b.received_items(), 1);
}

#[test]
fn over_budget_receiver_drops_messages() {
    init_tracing();
    let mut cluster = Cluster::new();
    cluster.add_peer("a", short_retry_config());
    cluster.add_peer("b", fast_config());
    cluster.connect_all();
    let receiver = cluster.syncer("b").engine();
    receiver.set_max_queue_cache_size(1);

    let statuses = cluster
        .syncer("a")
        .sync_and_wait(vec!["b".into()], SyncMode::Push)
        .unwrap();
    assert_eq!(statuses["b"], SyncStatus::Failed);
    assert!(receiver.discard_msg_num() >= 2);
    assert_eq!(receiver.queue_cache_size(), 0);
}

#[test]
fn closing_fails_pending_syncs_and_refuses_new_ones() {
    init_tracing();
    let mut cluster = Cluster::new();
    cluster.add_peer("a", fast_config());
    cluster.add_peer("b", fast_config());
    cluster.connect_all();
    cluster.network().set_blackhole("a", "b", true);

    let (tx, rx) = mpsc::channel();
    cluster
        .syncer("a")
        .sync(
            SyncRequest::new(vec!["b".into()], SyncMode::Push).with_on_complete(move |statuses| {
                let _ = tx.send(statuses["b"]);
            }),
        )
        .unwrap();
    cluster.syncer("a").close();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), SyncStatus::Failed);
    let refused = cluster
        .syncer("a")
        .sync(SyncRequest::new(vec!["b".into()], SyncMode::Push));
    assert!(matches!(refused, Err(SyncError::Killed)));
}

#[test]
fn going_offline_fails_the_running_sync() {
    init_tracing();
    let mut cluster = Cluster::new();
    cluster.add_peer("a", fast_config().with_response_timeout(Duration::from_secs(30)));
    cluster.add_peer("b", fast_config());
    cluster.connect_all();
    cluster.network().set_blackhole("a", "b", true);

    let (tx, rx) = mpsc::channel();
    cluster
        .syncer("a")
        .sync(
            SyncRequest::new(vec!["b".into()], SyncMode::Push).with_on_complete(move |statuses| {
                let _ = tx.send(statuses["b"]);
            }),
        )
        .unwrap();
    wait_until(Duration::from_secs(5), || cluster.network().dropped_count() > 0);
    cluster.network().disconnect("a", "b");

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), SyncStatus::Failed);
}
