//! Joining a cluster and learning its state

use quorumd::coordinator::{LocalTransport, NodeCoordinator};
use quorumd::{ClusterConfig, Error};
use std::sync::Arc;

fn node(bus: &Arc<LocalTransport>, id: &str, leader: bool, slots: u64) -> Arc<NodeCoordinator> {
    let mut config = ClusterConfig::for_node(id);
    config.is_leader = leader;
    config.capacity.slots = slots;
    NodeCoordinator::from_config(config, bus.clone()).unwrap()
}

#[test]
fn test_join_through_leader_syncs_state() {
    let bus = LocalTransport::new();
    let c = node(&bus, "c", true, 30);
    let a = node(&bus, "a", false, 10);
    let b = node(&bus, "b", false, 20);

    a.join("c").unwrap();
    b.join("c").unwrap();

    let view = c.cluster_status();
    assert_eq!(view.active_count, 3);
    assert_eq!(view.total_capacity, 60);

    // b joined second and learnt everyone from the leader
    let view = b.cluster_status();
    assert_eq!(view.total_count, 3);
    assert_eq!(view.leader_id.as_deref(), Some("c"));
    assert_eq!(b.node("a").unwrap().resources.capacity_total, 10);
    assert_eq!(b.epoch(), 1);

    // a only knows the nodes present when it joined
    assert_eq!(a.cluster_status().total_count, 2);
    assert_eq!(a.leader_id().as_deref(), Some("c"));
}

#[test]
fn test_duplicate_join_rejected() {
    let bus = LocalTransport::new();
    let c = node(&bus, "c", true, 30);
    let a = node(&bus, "a", false, 10);

    a.join("c").unwrap();
    assert!(matches!(a.join("c"), Err(Error::AlreadyExists(id)) if id == "a"));
    assert_eq!(c.cluster_status().total_count, 2);
}

#[test]
fn test_join_through_follower_gets_no_state() {
    let bus = LocalTransport::new();
    let b = node(&bus, "b", false, 10);
    let a = node(&bus, "a", false, 10);

    a.join("b").unwrap();
    assert!(b.node("a").unwrap().is_active());
    assert_eq!(a.cluster_status().total_count, 1);
    assert_eq!(a.leader_id(), None);
}

#[test]
fn test_join_unknown_seed_fails() {
    let bus = LocalTransport::new();
    let a = node(&bus, "a", false, 10);
    assert!(matches!(a.join("nowhere"), Err(Error::ConnectionFailed(_))));
}

#[test]
fn test_cluster_view_serializes() {
    let bus = LocalTransport::new();
    let c = node(&bus, "c", true, 5);
    let json = serde_json::to_value(c.cluster_status()).unwrap();
    assert_eq!(json["leader_id"], "c");
    assert_eq!(json["election_state"], "leader");
    assert_eq!(json["nodes"]["c"], "active");
}
