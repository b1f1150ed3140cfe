//! Node failure detection and graceful shutdown

use quorumd::common::{timestamp_now_millis, ClusterMessage, Heartbeat, NodeStatus};
use quorumd::coordinator::{LocalTransport, NodeCoordinator, ResourceLedger};
use quorumd::ClusterConfig;
use std::sync::Arc;

fn node(bus: &Arc<LocalTransport>, id: &str, leader: bool) -> Arc<NodeCoordinator> {
    let mut config = ClusterConfig::for_node(id);
    config.is_leader = leader;
    NodeCoordinator::from_config(config, bus.clone()).unwrap()
}

fn heartbeat(id: &str, timestamp: u64, sequence: u64, leader_epoch: Option<u64>) -> ClusterMessage {
    ClusterMessage::Heartbeat(Heartbeat {
        node_id: id.into(),
        timestamp,
        claims_leader: leader_epoch.is_some(),
        resources: ResourceLedger::new(100),
        sequence,
        epoch: leader_epoch.unwrap_or(0),
    })
}

#[test]
fn test_silent_leader_replaced_by_highest_survivor() {
    let bus = LocalTransport::new();
    let b = node(&bus, "b", false);
    let now = timestamp_now_millis();

    // a is alive, c led but went silent a minute ago
    b.deliver(heartbeat("a", now, 1, None)).unwrap();
    b.deliver(heartbeat("c", now - 60_000, 1, Some(1))).unwrap();
    assert_eq!(b.leader_id().as_deref(), Some("c"));

    b.run_detection_cycle().unwrap();

    assert_eq!(b.node("c").unwrap().status, NodeStatus::Inactive);
    assert!(b.node("a").unwrap().is_active());
    assert!(b.is_leader());
    assert_eq!(b.epoch(), 2);
    assert_eq!(b.metrics().nodes_marked_inactive.get(), 1);
}

#[test]
fn test_follower_failure_keeps_leader() {
    let bus = LocalTransport::new();
    let c = node(&bus, "c", true);
    let now = timestamp_now_millis();
    c.deliver(heartbeat("a", now - 60_000, 1, None)).unwrap();
    c.deliver(heartbeat("b", now, 1, None)).unwrap();

    c.run_detection_cycle().unwrap();
    assert_eq!(c.node("a").unwrap().status, NodeStatus::Inactive);
    assert!(c.is_leader());
    assert_eq!(c.epoch(), 1);

    // Inactive nodes are kept and revived by a fresh heartbeat
    c.deliver(heartbeat("a", timestamp_now_millis(), 2, None)).unwrap();
    assert!(c.node("a").unwrap().is_active());
    assert_eq!(c.cluster_status().total_count, 3);
}

#[test]
fn test_late_heartbeat_does_not_roll_back() {
    let bus = LocalTransport::new();
    let b = node(&bus, "b", false);
    let now = timestamp_now_millis();

    b.deliver(heartbeat("a", now, 7, None)).unwrap();
    // Delivered late: older sequence, ancient timestamp
    b.deliver(heartbeat("a", now - 60_000, 6, None)).unwrap();

    b.run_detection_cycle().unwrap();
    assert!(b.node("a").unwrap().is_active());
    assert_eq!(b.metrics().heartbeats_dropped.get(), 1);
    assert_eq!(b.metrics().heartbeats_received.get(), 1);
}

#[tokio::test]
async fn test_leader_shutdown_hands_off() {
    let bus = LocalTransport::new();
    let a = node(&bus, "a", false);
    let b = node(&bus, "b", false);
    let c = node(&bus, "c", true);
    for n in [&a, &b, &c] {
        n.emit_heartbeat().unwrap();
    }

    c.shutdown().await;

    assert!(b.is_leader());
    assert_eq!(b.epoch(), 2);
    assert_eq!(a.leader_id().as_deref(), Some("b"));
    assert_eq!(c.node("c").unwrap().status, NodeStatus::Inactive);
    assert!(!c.is_running());

    // Messages to a stopped node fail
    assert!(c.deliver(heartbeat("a", timestamp_now_millis(), u64::MAX, None)).is_err());
}

#[tokio::test]
async fn test_last_leader_shutdown_leaves_no_leader() {
    let bus = LocalTransport::new();
    let a = node(&bus, "a", true);
    a.start();
    a.shutdown().await;

    assert_eq!(a.leader_id(), None);
    assert!(!a.is_leader());
    assert_eq!(a.cluster_status().active_count, 0);
}

#[tokio::test]
async fn test_follower_shutdown_announces_nothing() {
    let bus = LocalTransport::new();
    let a = node(&bus, "a", false);
    let c = node(&bus, "c", true);
    a.emit_heartbeat().unwrap();
    c.emit_heartbeat().unwrap();

    a.shutdown().await;
    assert!(c.is_leader());
    assert_eq!(c.epoch(), 1);
    assert_eq!(a.leader_id().as_deref(), Some("c"));
}
