//! Capacity placement: greedy allocation and rebalance planning
//!
//! Allocation fills a request from the active nodes with the most available
//! capacity first. Rebalancing compares each node's utilization with the
//! cluster average and pairs overloaded nodes with underloaded ones; the
//! plan is advisory and nothing is migrated.

use crate::common::Result;
use crate::coordinator::ledger::{Allocation, AllocationSlice};
use crate::coordinator::membership::MembershipTable;
use serde::{Deserialize, Serialize};

/// Utilization of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub node_id: String,
    pub utilization: f64,
}

/// Suggested move of load from an overloaded to an underloaded node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceMove {
    pub from: String,
    pub to: String,
}

/// Advisory rebalance output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub average_utilization: f64,
    /// Most loaded first
    pub overloaded: Vec<NodeLoad>,
    /// Least loaded first
    pub underloaded: Vec<NodeLoad>,
    pub moves: Vec<RebalanceMove>,
}

impl RebalancePlan {
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty() && self.underloaded.is_empty()
    }
}

/// PlacementManager decides where capacity is taken from.
#[derive(Debug, Clone)]
pub struct PlacementManager {
    rebalance_threshold: f64,
}

impl PlacementManager {
    pub fn new(rebalance_threshold: f64) -> Self {
        Self {
            rebalance_threshold,
        }
    }

    /// Compute a greedy allocation of `count` units without touching the
    /// table. Candidates are active nodes with free capacity, most available
    /// first; ties keep node-id order.
    pub fn plan_allocation(&self, table: &MembershipTable, count: u64) -> Result<Allocation> {
        let mut candidates: Vec<(&str, u64)> = table
            .active()
            .filter(|r| r.resources.capacity_available > 0)
            .map(|r| (r.node_id.as_str(), r.resources.capacity_available))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let available: u64 = candidates.iter().map(|(_, a)| a).sum();
        if available < count {
            return Err(crate::Error::InsufficientCapacity {
                requested: count,
                available,
            });
        }

        let mut slices = Vec::new();
        let mut remaining = count;
        for (node_id, node_available) in candidates {
            if remaining == 0 {
                break;
            }
            let granted = node_available.min(remaining);
            slices.push(AllocationSlice {
                node_id: node_id.to_string(),
                count: granted,
            });
            remaining -= granted;
        }

        Ok(Allocation { slices })
    }

    /// Debit a planned allocation from the table's ledgers
    pub fn apply(&self, table: &mut MembershipTable, allocation: &Allocation) {
        for slice in &allocation.slices {
            if let Some(record) = table.get_mut(&slice.node_id) {
                record.resources.take(slice.count);
            }
        }
    }

    /// Flag nodes whose utilization is more than the threshold away from
    /// the average of active nodes with capacity.
    pub fn plan_rebalance(&self, table: &MembershipTable) -> RebalancePlan {
        let loads: Vec<NodeLoad> = table
            .active()
            .filter(|r| r.resources.capacity_total > 0)
            .map(|r| NodeLoad {
                node_id: r.node_id.clone(),
                utilization: r.resources.utilization(),
            })
            .collect();

        if loads.is_empty() {
            return RebalancePlan::default();
        }

        let average = loads.iter().map(|l| l.utilization).sum::<f64>() / loads.len() as f64;

        let mut overloaded: Vec<NodeLoad> = loads
            .iter()
            .filter(|l| l.utilization > average + self.rebalance_threshold)
            .cloned()
            .collect();
        overloaded.sort_by(|a, b| b.utilization.total_cmp(&a.utilization));

        let mut underloaded: Vec<NodeLoad> = loads
            .iter()
            .filter(|l| l.utilization < average - self.rebalance_threshold)
            .cloned()
            .collect();
        underloaded.sort_by(|a, b| a.utilization.total_cmp(&b.utilization));

        let moves = overloaded
            .iter()
            .zip(underloaded.iter())
            .map(|(over, under)| RebalanceMove {
                from: over.node_id.clone(),
                to: under.node_id.clone(),
            })
            .collect();

        RebalancePlan {
            average_utilization: average,
            overloaded,
            underloaded,
            moves,
        }
    }
}
