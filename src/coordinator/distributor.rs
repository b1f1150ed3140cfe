//! Workload distribution and result aggregation
//!
//! A workload is anything made of an ordered sequence of units that can be
//! cut into contiguous sub-ranges. Distribution assigns each target node a
//! contiguous share; aggregation folds per-node result maps back into one.

use crate::common::{PartitionPolicy, Result};
use crate::coordinator::membership::MembershipTable;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Range;

/// Divisible unit of work
pub trait Workload: Sized {
    /// Number of units in the workload
    fn units(&self) -> usize;

    /// Sub-workload made of the units in `range`
    fn slice(&self, range: Range<usize>) -> Self;
}

impl<T: Clone> Workload for Vec<T> {
    fn units(&self) -> usize {
        self.len()
    }

    fn slice(&self, range: Range<usize>) -> Self {
        self[range].to_vec()
    }
}

/// Share of a workload assigned to one node
#[derive(Debug, Clone, PartialEq)]
pub struct WorkShare<W> {
    pub node_id: String,
    /// Index of the share's first unit in the original workload
    pub offset: usize,
    pub workload: W,
}

/// Per-node results, keyed by node id
pub type NodeResults = BTreeMap<String, Map<String, Value>>;

#[derive(Debug, Clone)]
pub struct WorkloadDistributor {
    policy: PartitionPolicy,
}

impl WorkloadDistributor {
    pub fn new(policy: PartitionPolicy) -> Self {
        Self { policy }
    }

    /// Split `workload` across `targets`, or across every active node with
    /// free capacity (in id order) when no targets are given.
    pub fn distribute<W: Workload>(
        &self,
        table: &MembershipTable,
        workload: &W,
        targets: Option<&[String]>,
    ) -> Result<Vec<WorkShare<W>>> {
        let targets = Self::resolve_targets(table, targets)?;
        let units = workload.units();

        let available: u64 = targets.iter().map(|(_, a)| *a).sum();
        if available < units as u64 {
            return Err(crate::Error::InsufficientCapacity {
                requested: units as u64,
                available,
            });
        }

        let capacities: Vec<u64> = targets.iter().map(|(_, a)| *a).collect();
        let sizes = self.share_sizes(units, &capacities);

        let mut shares = Vec::new();
        let mut offset = 0;
        for ((node_id, _), size) in targets.into_iter().zip(sizes) {
            if size == 0 {
                continue;
            }
            shares.push(WorkShare {
                node_id,
                offset,
                workload: workload.slice(offset..offset + size),
            });
            offset += size;
        }
        Ok(shares)
    }

    fn resolve_targets(
        table: &MembershipTable,
        targets: Option<&[String]>,
    ) -> Result<Vec<(String, u64)>> {
        match targets {
            Some(ids) => ids
                .iter()
                .map(|id| {
                    table
                        .get(id)
                        .map(|r| (id.clone(), r.resources.capacity_available))
                        .ok_or_else(|| crate::Error::UnknownNode(id.clone()))
                })
                .collect(),
            None => Ok(table
                .active()
                .filter(|r| r.resources.capacity_available > 0)
                .map(|r| (r.node_id.clone(), r.resources.capacity_available))
                .collect()),
        }
    }

    /// Share size per target, summing to `units`
    pub fn share_sizes(&self, units: usize, capacities: &[u64]) -> Vec<usize> {
        if capacities.is_empty() {
            return Vec::new();
        }
        match self.policy {
            PartitionPolicy::Even => even_sizes(units, capacities.len()),
            PartitionPolicy::CapacityWeighted => weighted_sizes(units, capacities),
        }
    }

    /// Merge per-node result maps in node-id order. Object values are
    /// treated as histograms and their numeric entries summed; any other
    /// value is overwritten by the later node.
    pub fn aggregate(results: &NodeResults) -> Map<String, Value> {
        let mut merged = Map::new();
        for result in results.values() {
            for (key, value) in result {
                match (merged.get_mut(key), value) {
                    (Some(Value::Object(existing)), Value::Object(counts)) => {
                        for (bucket, count) in counts {
                            let summed = match existing.get(bucket) {
                                Some(prev) => add_counts(prev, count),
                                None => count.clone(),
                            };
                            existing.insert(bucket.clone(), summed);
                        }
                    }
                    _ => {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        merged
    }
}

fn even_sizes(units: usize, n: usize) -> Vec<usize> {
    let base = units / n;
    let extra = units % n;
    (0..n).map(|i| base + usize::from(i < extra)).collect()
}

/// Largest-remainder apportionment of `units` by capacity
fn weighted_sizes(units: usize, capacities: &[u64]) -> Vec<usize> {
    let total: u128 = capacities.iter().map(|c| *c as u128).sum();
    if total == 0 || units == 0 {
        return vec![0; capacities.len()];
    }

    let mut sizes = Vec::with_capacity(capacities.len());
    let mut remainders = Vec::with_capacity(capacities.len());
    for (i, cap) in capacities.iter().enumerate() {
        let scaled = units as u128 * *cap as u128;
        sizes.push((scaled / total) as usize);
        remainders.push((scaled % total, i));
    }

    let leftover = units - sizes.iter().sum::<usize>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, i) in remainders.into_iter().take(leftover) {
        sizes[i] += 1;
    }
    sizes
}

fn add_counts(a: &Value, b: &Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Value::from(x + y),
        _ => b.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ledger::ResourceLedger;
    use serde_json::json;

    fn table(nodes: &[(&str, u64)]) -> MembershipTable {
        let mut t = MembershipTable::new("local", ResourceLedger::new(0));
        for (id, cap) in nodes {
            t.upsert(id, &ResourceLedger::new(*cap));
        }
        t
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_even_split_covers_every_unit_once() {
        let t = table(&[("n1", 10), ("n2", 10), ("n3", 10)]);
        let d = WorkloadDistributor::new(PartitionPolicy::Even);
        let work: Vec<u32> = (0..10).collect();

        let shares = d
            .distribute(&t, &work, Some(&ids(&["n1", "n2", "n3"])))
            .unwrap();
        let sizes: Vec<usize> = shares.iter().map(|s| s.workload.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);

        let joined: Vec<u32> = shares.iter().flat_map(|s| s.workload.clone()).collect();
        assert_eq!(joined, work);
        assert_eq!(shares[1].offset, 4);
        assert_eq!(shares[2].offset, 7);
    }

    #[test]
    fn test_empty_shares_omitted() {
        let t = table(&[("n1", 5), ("n2", 5), ("n3", 5)]);
        let d = WorkloadDistributor::new(PartitionPolicy::Even);
        let shares = d.distribute(&t, &vec!['x', 'y'], None).unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].node_id, "n1");
        assert_eq!(shares[1].node_id, "n2");
    }

    #[test]
    fn test_default_targets_skip_full_nodes() {
        let mut t = table(&[("n1", 5), ("n2", 5)]);
        t.get_mut("n1").unwrap().resources.take(5);
        let d = WorkloadDistributor::new(PartitionPolicy::Even);
        let shares = d.distribute(&t, &vec![1, 2, 3], None).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].node_id, "n2");
    }

    #[test]
    fn test_insufficient_capacity() {
        let t = table(&[("n1", 2), ("n2", 2)]);
        let d = WorkloadDistributor::new(PartitionPolicy::Even);
        let work: Vec<u8> = vec![0; 5];
        assert!(matches!(
            d.distribute(&t, &work, None),
            Err(crate::Error::InsufficientCapacity {
                requested: 5,
                available: 4
            })
        ));
    }

    #[test]
    fn test_unknown_target() {
        let t = table(&[("n1", 2)]);
        let d = WorkloadDistributor::new(PartitionPolicy::Even);
        assert!(matches!(
            d.distribute(&t, &vec![1], Some(&ids(&["n1", "ghost"]))),
            Err(crate::Error::UnknownNode(id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_capacity_weighted_sizes() {
        let d = WorkloadDistributor::new(PartitionPolicy::CapacityWeighted);
        assert_eq!(d.share_sizes(10, &[10, 30]), vec![3, 7]);
        assert_eq!(d.share_sizes(10, &[1, 1, 1]), vec![4, 3, 3]);
        assert_eq!(d.share_sizes(0, &[5, 5]), vec![0, 0]);
        let sizes = d.share_sizes(7, &[3, 2, 2]);
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().zip([3usize, 2, 2]).all(|(s, c)| *s <= c));
    }

    #[test]
    fn test_aggregate_sums_histograms() {
        let mut results = NodeResults::new();
        results.insert(
            "n2".into(),
            json!({"counts": {"00": 3, "11": 1}, "shots": 4, "backend": "n2"})
                .as_object()
                .unwrap()
                .clone(),
        );
        results.insert(
            "n1".into(),
            json!({"counts": {"00": 2, "01": 5}, "shots": 7, "backend": "n1"})
                .as_object()
                .unwrap()
                .clone(),
        );

        let merged = WorkloadDistributor::aggregate(&results);
        assert_eq!(merged["counts"], json!({"00": 5, "01": 5, "11": 1}));
        // Non-histogram keys: last node in id order wins
        assert_eq!(merged["shots"], json!(4));
        assert_eq!(merged["backend"], json!("n2"));
    }

    #[test]
    fn test_aggregate_mixed_numbers() {
        assert_eq!(add_counts(&json!(2), &json!(3)), json!(5));
        assert_eq!(add_counts(&json!(-2), &json!(3)), json!(1));
        assert_eq!(add_counts(&json!(0.5), &json!(1)), json!(1.5));
        assert_eq!(add_counts(&json!("a"), &json!(1)), json!(1));
    }
}
