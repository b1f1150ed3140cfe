//! Configuration for quorumd nodes

use crate::coordinator::ledger::ResourceTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "quorumd";

/// Environment variable prefix (`QUORUMD_CLUSTER__NODE_TIMEOUT=20s`)
pub const ENV_PREFIX: &str = "QUORUMD";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster coordination settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default file (optional) and environment.
    pub fn load() -> crate::Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit file (required) or the default
    /// file (optional), then apply `QUORUMD_*` environment overrides.
    pub fn load_from(path: Option<&Path>) -> crate::Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.cluster.validate()?;
        Ok(config)
    }
}

/// How a workload is split across target nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionPolicy {
    /// Equal contiguous slices by position in the target list
    #[default]
    Even,
    /// Contiguous slices proportional to each node's available capacity
    CapacityWeighted,
}

/// Capacity advertised by the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Allocatable units (execution slots)
    #[serde(default = "default_slots")]
    pub slots: u64,

    /// Opaque tags advertised alongside capacity
    #[serde(default)]
    pub tags: BTreeMap<String, ResourceTag>,
}

fn default_slots() -> u64 {
    100
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            tags: BTreeMap::new(),
        }
    }
}

/// Cluster coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Local node id; a UUID v4 is generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    /// Start as leader (bootstrap node of a fresh cluster)
    #[serde(default)]
    pub is_leader: bool,

    /// Heartbeat emission and failure detection period
    #[serde(default = "default_heartbeat_interval", with = "duration_str")]
    pub heartbeat_interval: Duration,

    /// Silence after which a remote node is marked inactive
    #[serde(default = "default_node_timeout", with = "duration_str")]
    pub node_timeout: Duration,

    /// Wait for a coordinator announcement before self-declaring leader.
    /// Defaults to twice the node timeout.
    #[serde(default, with = "opt_duration_str")]
    pub election_timeout: Option<Duration>,

    /// Utilization distance from the cluster average flagged by rebalance
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,

    /// Workload partitioning policy
    #[serde(default)]
    pub partition_policy: PartitionPolicy,

    /// Bounded wait for background tasks on shutdown
    #[serde(default = "default_shutdown_grace", with = "duration_str")]
    pub shutdown_grace: Duration,

    /// Local capacity
    #[serde(default)]
    pub capacity: CapacityConfig,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_node_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_rebalance_threshold() -> f64 {
    0.2
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            is_leader: false,
            heartbeat_interval: default_heartbeat_interval(),
            node_timeout: default_node_timeout(),
            election_timeout: None,
            rebalance_threshold: default_rebalance_threshold(),
            partition_policy: PartitionPolicy::default(),
            shutdown_grace: default_shutdown_grace(),
            capacity: CapacityConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Config for a named node, defaults elsewhere
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Default::default()
        }
    }

    /// Effective election wait
    pub fn election_timeout(&self) -> Duration {
        self.election_timeout.unwrap_or(self.node_timeout * 2)
    }

    /// Check the invariants the coordinator relies on.
    pub fn validate(&self) -> crate::Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(crate::Error::InvalidConfig(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        if self.node_timeout <= self.heartbeat_interval {
            return Err(crate::Error::InvalidConfig(format!(
                "node_timeout ({:?}) must be greater than heartbeat_interval ({:?})",
                self.node_timeout, self.heartbeat_interval
            )));
        }
        if !(0.0..=1.0).contains(&self.rebalance_threshold) {
            return Err(crate::Error::InvalidConfig(format!(
                "rebalance_threshold must be within [0, 1], got {}",
                self.rebalance_threshold
            )));
        }
        if let Some(id) = &self.node_id {
            if id.is_empty() {
                return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
            }
        }
        Ok(())
    }
}

/// Durations as "500ms" / "5s" / "1m" strings, or plain integer milliseconds
mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Raw {
        Millis(u64),
        Text(String),
    }

    impl Raw {
        pub(super) fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
            match self {
                Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
                Raw::Text(s) => crate::common::parse_duration(&s).map_err(de::Error::custom),
            }
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Raw::deserialize(d)?.into_duration()
    }
}

mod opt_duration_str {
    use super::duration_str::Raw;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&format!("{}ms", d.as_millis())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<Raw>::deserialize(d)?
            .map(Raw::into_duration)
            .transpose()
    }
}
