//! Bully election over the in-process transport

use quorumd::coordinator::{ElectionState, LocalTransport, NodeCoordinator};
use quorumd::ClusterConfig;
use std::sync::Arc;
use std::time::Duration;

fn cluster(ids: &[&str], leader: Option<&str>) -> (Arc<LocalTransport>, Vec<Arc<NodeCoordinator>>) {
    let bus = LocalTransport::new();
    let nodes = ids
        .iter()
        .map(|id| {
            let mut config = ClusterConfig::for_node(*id);
            config.is_leader = leader == Some(*id);
            NodeCoordinator::from_config(config, bus.clone()).unwrap()
        })
        .collect();
    (bus, nodes)
}

fn exchange_heartbeats(nodes: &[Arc<NodeCoordinator>]) {
    for node in nodes {
        node.emit_heartbeat().unwrap();
    }
}

#[test]
fn test_lowest_node_election_converges_on_highest() {
    let (_bus, nodes) = cluster(&["a", "b", "c"], None);
    exchange_heartbeats(&nodes);
    for node in &nodes {
        assert_eq!(node.cluster_status().active_count, 3);
        assert_eq!(node.leader_id(), None);
    }

    nodes[0].start_election();

    let epoch = nodes[2].epoch();
    assert!(epoch >= 1);
    assert!(nodes[2].is_leader());
    for node in &nodes {
        assert_eq!(node.leader_id().as_deref(), Some("c"));
        assert_eq!(node.epoch(), epoch);
    }
    assert_eq!(nodes[0].election_state(), ElectionState::Follower);
    assert_eq!(nodes[1].election_state(), ElectionState::Follower);
}

#[test]
fn test_highest_node_declares_directly() {
    let (_bus, nodes) = cluster(&["a", "b", "c"], None);
    exchange_heartbeats(&nodes);

    nodes[2].start_election();
    assert_eq!(nodes[2].epoch(), 1);
    assert_eq!(nodes[0].leader_id().as_deref(), Some("c"));
    assert_eq!(nodes[1].leader_id().as_deref(), Some("c"));
}

#[test]
fn test_unreachable_higher_node_is_outwaited() {
    let mut config = ClusterConfig::for_node("a");
    config.election_timeout = Some(Duration::from_millis(0));
    let bus = LocalTransport::new();
    let a = NodeCoordinator::from_config(config, bus.clone()).unwrap();
    let b = NodeCoordinator::from_config(ClusterConfig::for_node("b"), bus.clone()).unwrap();
    b.emit_heartbeat().unwrap();

    bus.isolate("b");
    a.start_election();
    // Election sent into the void; nobody announced
    assert_eq!(a.leader_id(), None);
    assert_eq!(a.election_state(), ElectionState::Follower);

    // Zero timeout: the next detection cycle gives up on b
    std::thread::sleep(Duration::from_millis(5));
    a.run_detection_cycle().unwrap();
    assert!(a.is_leader());
    assert_eq!(a.epoch(), 1);
}

#[test]
fn test_bootstrap_leader_is_followed_after_heartbeat() {
    let (_bus, nodes) = cluster(&["a", "b", "c"], Some("b"));
    exchange_heartbeats(&nodes);

    for node in &nodes {
        assert_eq!(node.leader_id().as_deref(), Some("b"));
        assert_eq!(node.epoch(), 1);
    }
    assert!(!nodes[2].is_leader());
}

#[tokio::test]
async fn test_background_tasks_converge_after_leader_shutdown() {
    let bus = LocalTransport::new();
    let mut nodes = Vec::new();
    for id in ["a", "b", "c"] {
        let mut config = ClusterConfig::for_node(id);
        config.heartbeat_interval = Duration::from_millis(20);
        config.node_timeout = Duration::from_millis(100);
        config.is_leader = id == "c";
        let node = NodeCoordinator::from_config(config, bus.clone()).unwrap();
        node.start();
        nodes.push(node);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &nodes {
        assert_eq!(node.leader_id().as_deref(), Some("c"));
    }

    nodes[2].shutdown().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(nodes[1].is_leader());
    assert_eq!(nodes[0].leader_id().as_deref(), Some("b"));
    assert_eq!(nodes[0].epoch(), nodes[1].epoch());

    for node in &nodes[..2] {
        node.shutdown().await;
    }
}
