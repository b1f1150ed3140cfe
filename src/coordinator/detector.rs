//! Heartbeat-based failure detection
//!
//! A remote node is stale once `now - last_heartbeat > timeout`. Stale
//! active nodes are marked inactive. The local node is never considered,
//! whatever its own heartbeat entry says.

use crate::common::utils::duration_millis;
use crate::common::NodeStatus;
use crate::coordinator::membership::MembershipTable;
use std::time::Duration;
use tracing::warn;

/// Outcome of one detection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    /// Nodes moved from active to inactive this cycle, in id order
    pub marked_inactive: Vec<String>,
    /// The current leader is among the stale nodes
    pub leader_failed: bool,
}

#[derive(Debug, Clone)]
pub struct FailureDetector {
    timeout_ms: u64,
}

impl FailureDetector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_ms: duration_millis(timeout),
        }
    }

    pub fn is_stale(&self, last_heartbeat: u64, now: u64) -> bool {
        now.saturating_sub(last_heartbeat) > self.timeout_ms
    }

    /// Mark stale nodes inactive and report whether the leader is one of them
    pub fn scan(
        &self,
        table: &mut MembershipTable,
        leader_id: Option<&str>,
        now: u64,
    ) -> DetectionReport {
        let local_id = table.local_id().to_string();
        let mut stale: Vec<String> = table
            .heartbeats()
            .filter(|(id, ts)| *id != local_id && self.is_stale(*ts, now))
            .map(|(id, _)| id.to_string())
            .collect();
        stale.sort();

        let mut report = DetectionReport::default();
        for node_id in stale {
            if table.set_status(&node_id, NodeStatus::Inactive) {
                warn!("Node {} timed out", node_id);
                report.marked_inactive.push(node_id.clone());
            }
            if leader_id == Some(node_id.as_str()) {
                report.leader_failed = true;
            }
        }
        report
    }
}
