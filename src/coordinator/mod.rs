//! Cluster coordinator
//!
//! The coordinator is responsible for:
//! - Membership (node registry, heartbeats, failure detection)
//! - Leader election (bully algorithm, epoch fenced)
//! - Capacity allocation and rebalance planning
//! - Workload distribution and result aggregation

pub mod detector;
pub mod distributor;
pub mod election;
pub mod ledger;
pub mod membership;
pub mod node;
pub mod placement;
pub mod transport;

pub use distributor::{NodeResults, WorkShare, Workload, WorkloadDistributor};
pub use election::ElectionState;
pub use ledger::{
    Allocation, AllocationSlice, CapacityProvider, ResourceLedger, ResourceTag, StaticCapacity,
};
pub use membership::{ClusterView, NodeRecord};
pub use node::NodeCoordinator;
pub use placement::{RebalanceMove, RebalancePlan};
pub use transport::{LocalTransport, Transport};
