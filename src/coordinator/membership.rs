//! Membership table
//!
//! Maps node ids to their record (status + capacity ledger) together with
//! the last heartbeat time and sequence heard from each node. The table is
//! plain data; the coordinator owns it and serializes access.

use crate::common::{NodeStatus, Result};
use crate::coordinator::election::ElectionState;
use crate::coordinator::ledger::ResourceLedger;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A cluster member as known locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub status: NodeStatus,
    pub resources: ResourceLedger,
}

impl NodeRecord {
    pub fn active(node_id: impl Into<String>, resources: ResourceLedger) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Active,
            resources,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Read-only cluster snapshot, computed on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub local_id: String,
    pub leader_id: Option<String>,
    pub epoch: u64,
    pub election_state: ElectionState,
    pub active_count: usize,
    pub total_count: usize,
    pub total_capacity: u64,
    pub available_capacity: u64,
    pub nodes: BTreeMap<String, NodeStatus>,
}

/// node_id → record, plus liveness bookkeeping
#[derive(Debug, Clone)]
pub struct MembershipTable {
    local_id: String,
    nodes: BTreeMap<String, NodeRecord>,
    last_heartbeat: HashMap<String, u64>,
    last_sequence: HashMap<String, u64>,
}

impl MembershipTable {
    /// Table containing only the local node, active
    pub fn new(local_id: impl Into<String>, resources: ResourceLedger) -> Self {
        let local_id = local_id.into();
        let mut nodes = BTreeMap::new();
        nodes.insert(local_id.clone(), NodeRecord::active(local_id.clone(), resources));
        Self {
            local_id,
            nodes,
            last_heartbeat: HashMap::new(),
            last_sequence: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local(&self) -> &NodeRecord {
        // The local record is inserted at construction and never removed
        &self.nodes[&self.local_id]
    }

    pub fn local_mut(&mut self) -> &mut NodeRecord {
        self.nodes
            .get_mut(&self.local_id)
            .expect("local node record is never removed")
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records in node-id order
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Active records in node-id order
    pub fn active(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().filter(|r| r.is_active())
    }

    /// Active remote node ids in node-id order
    pub fn active_peer_ids(&self) -> Vec<String> {
        self.active()
            .filter(|r| r.node_id != self.local_id)
            .map(|r| r.node_id.clone())
            .collect()
    }

    pub fn last_heartbeat(&self, node_id: &str) -> Option<u64> {
        self.last_heartbeat.get(node_id).copied()
    }

    /// Heartbeat times of every node ever heard from
    pub fn heartbeats(&self) -> impl Iterator<Item = (&str, u64)> {
        self.last_heartbeat.iter().map(|(id, ts)| (id.as_str(), *ts))
    }

    /// Record a heartbeat time; never moves an entry backwards
    pub fn record_heartbeat(&mut self, node_id: &str, timestamp: u64) {
        let entry = self.last_heartbeat.entry(node_id.to_string()).or_insert(0);
        *entry = (*entry).max(timestamp);
    }

    /// Accept `sequence` from `node_id` if it is newer than anything seen.
    pub fn accept_sequence(&mut self, node_id: &str, sequence: u64) -> bool {
        match self.last_sequence.get(node_id) {
            Some(&last) if sequence <= last => false,
            _ => {
                self.last_sequence.insert(node_id.to_string(), sequence);
                true
            }
        }
    }

    /// Insert or refresh a remote node from a heartbeat. Returns true when
    /// the node was not known before.
    pub fn upsert(&mut self, node_id: &str, resources: &ResourceLedger) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(record) => {
                record.status = NodeStatus::Active;
                record.resources.refresh_from(resources);
                false
            }
            None => {
                self.nodes.insert(
                    node_id.to_string(),
                    NodeRecord::active(node_id, resources.normalized()),
                );
                true
            }
        }
    }

    /// Admit a joining node. An id that is already present and active is a
    /// duplicate; an inactive one is revived.
    pub fn admit(&mut self, node_id: &str, resources: &ResourceLedger) -> Result<()> {
        if let Some(record) = self.nodes.get(node_id) {
            if record.is_active() || node_id == self.local_id {
                return Err(crate::Error::AlreadyExists(node_id.to_string()));
            }
        }
        self.upsert(node_id, resources);
        Ok(())
    }

    /// Add a record learnt from another node's table if it is unknown here.
    pub fn merge(&mut self, record: &NodeRecord) -> bool {
        if self.nodes.contains_key(&record.node_id) {
            return false;
        }
        self.nodes.insert(
            record.node_id.clone(),
            NodeRecord {
                resources: record.resources.normalized(),
                ..record.clone()
            },
        );
        true
    }

    /// Change a node's status. Returns true if it changed.
    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(record) if record.status != status => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Snapshot for callers
    pub fn view(
        &self,
        leader_id: Option<String>,
        epoch: u64,
        election_state: ElectionState,
    ) -> ClusterView {
        let active: Vec<&NodeRecord> = self.active().collect();
        ClusterView {
            local_id: self.local_id.clone(),
            leader_id,
            epoch,
            election_state,
            active_count: active.len(),
            total_count: self.nodes.len(),
            total_capacity: active.iter().map(|r| r.resources.capacity_total).sum(),
            available_capacity: active.iter().map(|r| r.resources.capacity_available).sum(),
            nodes: self
                .nodes
                .values()
                .map(|r| (r.node_id.clone(), r.status))
                .collect(),
        }
    }
}
