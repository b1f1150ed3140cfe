//! Per-node capacity accounting
//!
//! A ledger tracks how many allocatable units (slots) a node advertises and
//! how many of them are still free. Tags are carried along untouched.

use crate::common::CapacityConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Opaque advertised resource tag (fidelity, connectivity, ...)
///
/// Human-readable formats (TOML, JSON) see a bare number or string; binary
/// formats get an explicit variant tag since they cannot self-describe.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceTag {
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UntaggedTag {
    Number(f64),
    Text(String),
}

#[derive(Serialize, Deserialize)]
enum TaggedTag {
    Number(f64),
    Text(String),
}

impl Serialize for ResourceTag {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match (self, s.is_human_readable()) {
            (ResourceTag::Number(n), true) => s.serialize_f64(*n),
            (ResourceTag::Text(t), true) => s.serialize_str(t),
            (ResourceTag::Number(n), false) => TaggedTag::Number(*n).serialize(s),
            (ResourceTag::Text(t), false) => TaggedTag::Text(t.clone()).serialize(s),
        }
    }
}

impl<'de> Deserialize<'de> for ResourceTag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            Ok(match UntaggedTag::deserialize(d)? {
                UntaggedTag::Number(n) => ResourceTag::Number(n),
                UntaggedTag::Text(t) => ResourceTag::Text(t),
            })
        } else {
            Ok(match TaggedTag::deserialize(d)? {
                TaggedTag::Number(n) => ResourceTag::Number(n),
                TaggedTag::Text(t) => ResourceTag::Text(t),
            })
        }
    }
}

/// Capacity tally of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLedger {
    pub capacity_total: u64,
    pub capacity_available: u64,
    #[serde(default)]
    pub tags: BTreeMap<String, ResourceTag>,
}

impl ResourceLedger {
    /// A fully available ledger
    pub fn new(capacity_total: u64) -> Self {
        Self {
            capacity_total,
            capacity_available: capacity_total,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, tag: ResourceTag) -> Self {
        self.tags.insert(key.into(), tag);
        self
    }

    pub fn used(&self) -> u64 {
        self.capacity_total.saturating_sub(self.capacity_available)
    }

    /// Used / total, 0.0 for a node without capacity
    pub fn utilization(&self) -> f64 {
        if self.capacity_total == 0 {
            0.0
        } else {
            self.used() as f64 / self.capacity_total as f64
        }
    }

    /// Take up to `count` units, returning what was taken
    pub fn take(&mut self, count: u64) -> u64 {
        let taken = count.min(self.capacity_available);
        self.capacity_available -= taken;
        taken
    }

    /// Give back `count` units. Returns the number of units that would have
    /// pushed availability above the total and were dropped instead.
    pub fn give_back(&mut self, count: u64) -> u64 {
        let headroom = self.used();
        let accepted = count.min(headroom);
        self.capacity_available += accepted;
        count - accepted
    }

    /// Copy of an advertised ledger with availability capped at the total
    pub fn normalized(&self) -> Self {
        Self {
            capacity_total: self.capacity_total,
            capacity_available: self.capacity_available.min(self.capacity_total),
            tags: self.tags.clone(),
        }
    }

    /// Refresh the advertised total and tags from a newer report, keeping
    /// the locally accounted usage.
    pub fn refresh_from(&mut self, advertised: &ResourceLedger) {
        let used = self.used();
        self.capacity_total = advertised.capacity_total;
        self.capacity_available = advertised.capacity_total.saturating_sub(used);
        self.tags = advertised.tags.clone();
    }
}

/// Units granted on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSlice {
    pub node_id: String,
    pub count: u64,
}

/// Result of a successful allocation, in greedy-fill order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub slices: Vec<AllocationSlice>,
}

impl Allocation {
    pub fn total(&self) -> u64 {
        self.slices.iter().map(|s| s.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Units granted on `node_id`
    pub fn count_on(&self, node_id: &str) -> u64 {
        self.slices
            .iter()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.count)
            .sum()
    }
}

/// Source of the local node's advertised capacity
pub trait CapacityProvider: Send + Sync {
    fn query(&self) -> ResourceLedger;
}

/// Fixed capacity, typically built from configuration
#[derive(Debug, Clone)]
pub struct StaticCapacity {
    ledger: ResourceLedger,
}

impl StaticCapacity {
    pub fn new(slots: u64) -> Self {
        Self {
            ledger: ResourceLedger::new(slots),
        }
    }
}

impl From<&CapacityConfig> for StaticCapacity {
    fn from(config: &CapacityConfig) -> Self {
        let mut ledger = ResourceLedger::new(config.slots);
        ledger.tags = config.tags.clone();
        Self { ledger }
    }
}

impl CapacityProvider for StaticCapacity {
    fn query(&self) -> ResourceLedger {
        self.ledger.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_give_back() {
        let mut ledger = ResourceLedger::new(10);
        assert_eq!(ledger.take(4), 4);
        assert_eq!(ledger.capacity_available, 6);
        assert_eq!(ledger.used(), 4);

        assert_eq!(ledger.take(20), 6);
        assert_eq!(ledger.capacity_available, 0);

        assert_eq!(ledger.give_back(3), 0);
        assert_eq!(ledger.capacity_available, 3);
    }

    #[test]
    fn test_give_back_clamps_to_total() {
        let mut ledger = ResourceLedger::new(10);
        ledger.take(2);
        assert_eq!(ledger.give_back(5), 3);
        assert_eq!(ledger.capacity_available, 10);
    }

    #[test]
    fn test_utilization() {
        let mut ledger = ResourceLedger::new(4);
        assert_eq!(ledger.utilization(), 0.0);
        ledger.take(3);
        assert!((ledger.utilization() - 0.75).abs() < f64::EPSILON);
        assert_eq!(ResourceLedger::new(0).utilization(), 0.0);
    }

    #[test]
    fn test_refresh_keeps_usage() {
        let mut ledger = ResourceLedger::new(10);
        ledger.take(7);

        let advertised = ResourceLedger::new(20).with_tag("fidelity", ResourceTag::Number(0.99));
        ledger.refresh_from(&advertised);
        assert_eq!(ledger.capacity_total, 20);
        assert_eq!(ledger.capacity_available, 13);
        assert_eq!(ledger.tags.len(), 1);

        // Shrinking below current usage leaves nothing available
        ledger.refresh_from(&ResourceLedger::new(5));
        assert_eq!(ledger.capacity_available, 0);
        assert!(ledger.capacity_available <= ledger.capacity_total);
    }

    #[test]
    fn test_tags_in_json_are_bare_values() {
        let ledger = ResourceLedger::new(2)
            .with_tag("fidelity", ResourceTag::Number(0.99))
            .with_tag("connectivity", ResourceTag::Text("all-to-all".into()));
        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["tags"]["fidelity"], serde_json::json!(0.99));
        assert_eq!(json["tags"]["connectivity"], "all-to-all");

        let back: ResourceLedger = serde_json::from_value(json).unwrap();
        assert_eq!(back, ledger);
    }

    #[test]
    fn test_tags_survive_bincode() {
        let ledger = ResourceLedger::new(2)
            .with_tag("decoherence_time", ResourceTag::Number(100.0))
            .with_tag("connectivity", ResourceTag::Text("ring".into()));
        let bytes = bincode::serialize(&ledger).unwrap();
        let back: ResourceLedger = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, ledger);
    }

    #[test]
    fn test_allocation_totals() {
        let allocation = Allocation {
            slices: vec![
                AllocationSlice {
                    node_id: "n1".into(),
                    count: 10,
                },
                AllocationSlice {
                    node_id: "n2".into(),
                    count: 5,
                },
            ],
        };
        assert_eq!(allocation.total(), 15);
        assert_eq!(allocation.count_on("n2"), 5);
        assert_eq!(allocation.count_on("n3"), 0);
    }
}
