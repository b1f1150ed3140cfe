//! # quorumd
//!
//! Cluster membership and coordination core:
//! - Node registry with heartbeats and timeout-based failure detection
//! - Bully leader election with epoch fencing against stale leaders
//! - Greedy capacity allocation and advisory rebalancing on the leader
//! - Workload splitting across nodes and result aggregation
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            NodeCoordinator               │
//! │  membership │ election │ placement       │
//! │  (one lock, outbound queued until free)  │
//! └───────┬──────────────────────┬───────────┘
//!         │ heartbeat task       │ detection task
//!         ▼                      ▼
//! ┌──────────────────────────────────────────┐
//! │        Transport (frames: QRM1)          │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run a node
//! ```bash
//! quorumd serve --id node-c --leader
//! quorumd serve --id node-c --leader --peers node-a,node-b
//! ```
//!
//! ### Simulate a cluster in one process
//! ```bash
//! quorumd simulate --nodes 5 --crash
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{ClusterConfig, Config, Error, Result};
pub use coordinator::{LocalTransport, NodeCoordinator, Transport};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
