//! Coordination metrics
//!
//! Per-coordinator counters and gauges, rendered in Prometheus text format.
//! Several coordinators can live in one process (tests, simulations), so
//! there is no global registry; each coordinator owns its `ClusterMetrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time value
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one coordinator
#[derive(Debug)]
pub struct ClusterMetrics {
    pub heartbeats_sent: Counter,
    pub heartbeats_received: Counter,
    /// Heartbeats dropped as out of order
    pub heartbeats_dropped: Counter,
    pub elections_started: Counter,
    pub leader_changes: Counter,
    /// Leadership claims rejected by epoch fencing
    pub stale_claims: Counter,
    pub nodes_marked_inactive: Counter,
    pub allocations_granted: Counter,
    pub allocations_rejected: Counter,
    pub units_allocated: Counter,
    pub units_released: Counter,
    pub tick_errors: Counter,

    pub active_nodes: Gauge,
    pub available_capacity: Gauge,

    start_time: Instant,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self {
            heartbeats_sent: Counter::new(),
            heartbeats_received: Counter::new(),
            heartbeats_dropped: Counter::new(),
            elections_started: Counter::new(),
            leader_changes: Counter::new(),
            stale_claims: Counter::new(),
            nodes_marked_inactive: Counter::new(),
            allocations_granted: Counter::new(),
            allocations_rejected: Counter::new(),
            units_allocated: Counter::new(),
            units_released: Counter::new(),
            tick_errors: Counter::new(),
            active_nodes: Gauge::new(),
            available_capacity: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition, labelled with `node`
    pub fn to_prometheus(&self, node_id: &str) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("heartbeats_sent_total", "Heartbeats broadcast", &self.heartbeats_sent),
            ("heartbeats_received_total", "Heartbeats accepted", &self.heartbeats_received),
            ("heartbeats_dropped_total", "Out-of-order heartbeats dropped", &self.heartbeats_dropped),
            ("elections_started_total", "Elections started locally", &self.elections_started),
            ("leader_changes_total", "Leader changes observed", &self.leader_changes),
            ("stale_claims_total", "Leadership claims rejected as stale", &self.stale_claims),
            ("nodes_marked_inactive_total", "Nodes marked inactive by the failure detector", &self.nodes_marked_inactive),
            ("allocations_granted_total", "Allocations granted", &self.allocations_granted),
            ("allocations_rejected_total", "Allocations rejected", &self.allocations_rejected),
            ("units_allocated_total", "Capacity units allocated", &self.units_allocated),
            ("units_released_total", "Capacity units released", &self.units_released),
            ("tick_errors_total", "Background tick failures", &self.tick_errors),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP quorumd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE quorumd_{} counter", name);
            let _ = writeln!(out, "quorumd_{}{{node=\"{}\"}} {}", name, node_id, counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("active_nodes", "Active nodes in the membership table", self.active_nodes.get()),
            ("available_capacity", "Available capacity across active nodes", self.available_capacity.get()),
            ("uptime_seconds", "Coordinator uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP quorumd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE quorumd_{} gauge", name);
            let _ = writeln!(out, "quorumd_{}{{node=\"{}\"}} {}", name, node_id, value);
        }

        out
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
