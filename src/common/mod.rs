//! Common utilities and types shared across quorumd

pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod utils;

pub use config::{CapacityConfig, ClusterConfig, Config, PartitionPolicy};
pub use error::{Error, Result};
pub use messages::{decode_frame, encode_frame, ClusterMessage, Heartbeat, Outbound};
pub use metrics::ClusterMetrics;
pub use utils::{crc32, generate_node_id, parse_duration, timestamp_now_millis, NodeStatus};
