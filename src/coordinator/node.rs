//! Node coordinator
//!
//! Single authoritative view of membership and leadership for the local
//! node. Every operation, caller-driven or background, goes through one
//! mutex. Messages produced while the lock is held are queued and handed
//! to the transport only after it is released, so deliveries may call
//! straight back into any coordinator.

use crate::common::messages::{ClusterMessage, Heartbeat, Outbound};
use crate::common::{
    timestamp_now_millis, ClusterConfig, ClusterMetrics, Error, NodeStatus, Result,
};
use crate::coordinator::detector::FailureDetector;
use crate::coordinator::distributor::{NodeResults, WorkShare, Workload, WorkloadDistributor};
use crate::coordinator::election::{Election, ElectionState};
use crate::coordinator::ledger::{Allocation, CapacityProvider, ResourceLedger, StaticCapacity};
use crate::coordinator::membership::{ClusterView, MembershipTable, NodeRecord};
use crate::coordinator::placement::{PlacementManager, RebalancePlan};
use crate::coordinator::transport::Transport;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// State serialized behind the coordinator lock
struct CoordinatorState {
    table: MembershipTable,
    election: Election,
    shutting_down: bool,
    next_sequence: u64,
}

struct BackgroundTasks {
    stop: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
    detector: JoinHandle<()>,
}

pub struct NodeCoordinator {
    node_id: String,
    config: ClusterConfig,
    state: Mutex<CoordinatorState>,
    capacity: Arc<dyn CapacityProvider>,
    transport: Arc<dyn Transport>,
    detector: FailureDetector,
    placement: PlacementManager,
    distributor: WorkloadDistributor,
    metrics: ClusterMetrics,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl NodeCoordinator {
    /// Build a coordinator whose table holds only the local node.
    ///
    /// With `config.is_leader` the node asserts leadership without asking
    /// anyone; only one bootstrap node of a fresh cluster should do so.
    /// Background tasks are not running until [`NodeCoordinator::start`].
    pub fn new(
        config: ClusterConfig,
        capacity: Arc<dyn CapacityProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(crate::common::generate_node_id);
        let table = MembershipTable::new(node_id.clone(), capacity.query());
        let election = Election::new(node_id.clone(), config.is_leader, config.election_timeout());

        let node = Arc::new(Self {
            detector: FailureDetector::new(config.node_timeout),
            placement: PlacementManager::new(config.rebalance_threshold),
            distributor: WorkloadDistributor::new(config.partition_policy),
            state: Mutex::new(CoordinatorState {
                table,
                election,
                shutting_down: false,
                next_sequence: timestamp_now_millis(),
            }),
            node_id,
            config,
            capacity,
            transport: transport.clone(),
            metrics: ClusterMetrics::new(),
            tasks: Mutex::new(None),
        });

        transport.attach(&node);
        info!(
            "Node {} initialized ({})",
            node.node_id,
            if node.config.is_leader { "leader" } else { "follower" }
        );
        Ok(node)
    }

    /// Coordinator advertising the capacity from its configuration
    pub fn from_config(config: ClusterConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let capacity = Arc::new(StaticCapacity::from(&config.capacity));
        Self::new(config, capacity, transport)
    }

    // === Lifecycle ===

    /// Spawn the heartbeat and failure-detection tasks. Must be called from
    /// within a tokio runtime; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        // Lock order: tasks, then state. `shutdown` raises the flag before
        // it takes `tasks`, so it either sees our handles or we see the flag.
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.is_some() {
            return;
        }
        if self.lock().shutting_down {
            warn!("Node {} is shut down, not starting tasks", self.node_id);
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(Self::heartbeat_loop(self.clone(), stop_rx.clone()));
        let detector = tokio::spawn(Self::detection_loop(self.clone(), stop_rx));
        *tasks = Some(BackgroundTasks {
            stop,
            heartbeat,
            detector,
        });
        info!(
            "Node {} started (heartbeat every {:?}, timeout {:?})",
            self.node_id, self.config.heartbeat_interval, self.config.node_timeout
        );
    }

    async fn heartbeat_loop(node: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(node.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = node.emit_heartbeat() {
                        node.metrics.tick_errors.inc();
                        error!("Error in heartbeat task: {}", e);
                    }
                }
                _ = stop.changed() => break,
            }
        }
        debug!("Heartbeat task of {} stopped", node.node_id);
    }

    async fn detection_loop(node: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(node.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = node.run_detection_cycle() {
                        node.metrics.tick_errors.inc();
                        error!("Error in monitoring task: {}", e);
                    }
                }
                _ = stop.changed() => break,
            }
        }
        debug!("Detection task of {} stopped", node.node_id);
    }

    /// Gracefully leave the cluster. Marks the local node inactive, hands
    /// leadership to the highest remaining active node if we led, and stops
    /// the background tasks within `shutdown_grace`. Idempotent.
    pub async fn shutdown(&self) {
        let outbox = self.with_state(|st| {
            if st.shutting_down {
                return None;
            }
            st.shutting_down = true;
            st.table.set_status(&self.node_id, NodeStatus::Inactive);
            Some(st.election.hand_off(&st.table))
        });

        match outbox {
            Some(announcement) => {
                info!("Node {} shutting down", self.node_id);
                self.dispatch(announcement.into_iter().collect());
            }
            None => debug!("Node {} already shut down", self.node_id),
        }

        self.stop_tasks().await;
    }

    async fn stop_tasks(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(tasks) = tasks else {
            return;
        };

        let _ = tasks.stop.send(true);
        let grace = self.config.shutdown_grace;
        for (name, mut handle) in [("heartbeat", tasks.heartbeat), ("detector", tasks.detector)] {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    "{} task of {} did not stop within {:?}, aborting",
                    name, self.node_id, grace
                );
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.lock().shutting_down
    }

    // === Background ticks ===

    /// Broadcast one heartbeat carrying local resources and leadership claim
    pub fn emit_heartbeat(&self) -> Result<()> {
        let heartbeat = {
            let mut st = self.lock();
            if st.shutting_down {
                return Ok(());
            }
            let now = timestamp_now_millis();
            st.table.record_heartbeat(&self.node_id, now);
            let advertised = self.capacity.query();
            st.table.local_mut().resources.refresh_from(&advertised);
            st.next_sequence += 1;

            Heartbeat {
                node_id: self.node_id.clone(),
                timestamp: now,
                claims_leader: st.election.is_leader(),
                resources: st.table.local().resources.clone(),
                sequence: st.next_sequence,
                epoch: st.election.epoch(),
            }
        };

        debug!(
            "Sending heartbeat: seq={} leader={} available={}",
            heartbeat.sequence, heartbeat.claims_leader, heartbeat.resources.capacity_available
        );
        self.transport
            .broadcast(&self.node_id, &ClusterMessage::Heartbeat(heartbeat))?;
        self.metrics.heartbeats_sent.inc();
        Ok(())
    }

    /// One failure-detection cycle: mark stale nodes inactive, elect a new
    /// leader if ours went silent, and give up on a pending election whose
    /// announcement never came.
    pub fn run_detection_cycle(&self) -> Result<()> {
        self.detect_failures_at(timestamp_now_millis())
    }

    fn detect_failures_at(&self, now: u64) -> Result<()> {
        let outbox = self.with_state(|st| {
            if st.shutting_down {
                return Vec::new();
            }
            let leader = st.election.leader_id().map(str::to_owned);
            let report = self.detector.scan(&mut st.table, leader.as_deref(), now);
            self.metrics
                .nodes_marked_inactive
                .add(report.marked_inactive.len() as u64);

            if report.leader_failed {
                warn!("Leader node timed out. Starting election.");
                self.metrics.elections_started.inc();
                st.election.start(&st.table, now)
            } else {
                st.election.check_deadline(now).into_iter().collect()
            }
        });
        self.dispatch(outbox);
        Ok(())
    }

    // === Inbound messages ===

    /// Route a message from the transport to its handler
    pub fn deliver(&self, message: ClusterMessage) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ConnectionFailed(format!(
                "{} is shut down",
                self.node_id
            )));
        }
        match message {
            ClusterMessage::Heartbeat(hb) => self.receive_heartbeat(hb),
            ClusterMessage::Election { sender_id } => self.receive_election(&sender_id),
            ClusterMessage::Alive { sender_id } => self.receive_alive(&sender_id),
            ClusterMessage::Coordinator {
                new_leader_id,
                epoch,
            } => {
                self.receive_coordinator_announcement(&new_leader_id, epoch);
            }
            ClusterMessage::JoinAnnouncement {
                node_id,
                resources,
                timestamp,
            } => return self.handle_join_announcement(&node_id, resources, timestamp),
            ClusterMessage::ClusterStateSync {
                nodes,
                leader_id,
                epoch,
            } => self.receive_cluster_state_sync(&nodes, leader_id.as_deref(), epoch),
        }
        Ok(())
    }

    /// Process a heartbeat: upsert the sender as active, record its time,
    /// and follow its leadership claim unless the claim is stale.
    /// Heartbeats older than the last one seen from the sender are dropped.
    pub fn receive_heartbeat(&self, heartbeat: Heartbeat) {
        if heartbeat.node_id == self.node_id {
            return;
        }
        self.with_state(|st| {
            if !st.table.accept_sequence(&heartbeat.node_id, heartbeat.sequence) {
                self.metrics.heartbeats_dropped.inc();
                debug!(
                    "Dropping out-of-order heartbeat from {} (seq {})",
                    heartbeat.node_id, heartbeat.sequence
                );
                return;
            }
            self.metrics.heartbeats_received.inc();
            st.table
                .record_heartbeat(&heartbeat.node_id, heartbeat.timestamp);
            if st.table.upsert(&heartbeat.node_id, &heartbeat.resources) {
                info!("New node joined: {}", heartbeat.node_id);
            }

            if heartbeat.claims_leader
                && st.election.leader_id() != Some(heartbeat.node_id.as_str())
            {
                self.adopt_leader(st, &heartbeat.node_id, heartbeat.epoch);
            }
        });
    }

    /// Bully election message. A lower sender is answered and outbid.
    pub fn receive_election(&self, sender_id: &str) {
        let outbox = self.with_state(|st| {
            if sender_id < self.node_id.as_str() {
                self.metrics.elections_started.inc();
            }
            let now = timestamp_now_millis();
            st.election.on_election(sender_id, &st.table, now)
        });
        self.dispatch(outbox);
    }

    /// A higher node is alive and running its own election
    pub fn receive_alive(&self, sender_id: &str) {
        self.with_state(|st| st.election.on_alive(sender_id, timestamp_now_millis()));
    }

    /// Coordinator announcement. Returns true if the leader was adopted.
    pub fn receive_coordinator_announcement(&self, new_leader_id: &str, epoch: u64) -> bool {
        info!(
            "Received coordinator message. New leader: {} (epoch {})",
            new_leader_id, epoch
        );
        self.with_state(|st| self.adopt_leader(st, new_leader_id, epoch))
    }

    /// Announce the local node to a seed
    pub fn join(&self, seed: &str) -> Result<()> {
        let message = {
            let st = self.lock();
            ClusterMessage::JoinAnnouncement {
                node_id: self.node_id.clone(),
                resources: st.table.local().resources.clone(),
                timestamp: timestamp_now_millis(),
            }
        };
        info!("Node {} joining via {}", self.node_id, seed);
        self.transport.send(&self.node_id, seed, &message)
    }

    /// Admit a joining node. The leader answers with its cluster state.
    pub fn handle_join_announcement(
        &self,
        node_id: &str,
        resources: ResourceLedger,
        timestamp: u64,
    ) -> Result<()> {
        let outbox = self.with_state(|st| -> Result<Vec<Outbound>> {
            st.table.admit(node_id, &resources)?;
            st.table.record_heartbeat(node_id, timestamp);
            info!("New node joined: {}", node_id);

            if !st.election.is_leader() {
                return Ok(Vec::new());
            }
            Ok(vec![Outbound::Send {
                to: node_id.to_string(),
                message: ClusterMessage::ClusterStateSync {
                    nodes: st.table.records().cloned().collect(),
                    leader_id: st.election.leader_id().map(str::to_owned),
                    epoch: st.election.epoch(),
                },
            }])
        })?;
        self.dispatch(outbox);
        Ok(())
    }

    /// Merge the leader's table into ours after joining
    pub fn receive_cluster_state_sync(
        &self,
        nodes: &[NodeRecord],
        leader_id: Option<&str>,
        epoch: u64,
    ) {
        self.with_state(|st| {
            let now = timestamp_now_millis();
            for record in nodes.iter().filter(|r| r.node_id != self.node_id) {
                if st.table.merge(record) {
                    debug!("Learnt node {} from cluster state", record.node_id);
                    if record.is_active() {
                        st.table.record_heartbeat(&record.node_id, now);
                    }
                }
            }
            if let Some(leader) = leader_id {
                self.adopt_leader(st, leader, epoch);
            }
        });
    }

    /// Run a bully election now
    pub fn start_election(&self) {
        let outbox = self.with_state(|st| {
            self.metrics.elections_started.inc();
            st.election.start(&st.table, timestamp_now_millis())
        });
        self.dispatch(outbox);
    }

    // === Resource operations ===

    /// Grant `count` units across active nodes, most available first.
    /// Leader only; nothing changes on failure.
    pub fn allocate(&self, count: u64) -> Result<Allocation> {
        self.with_state(|st| {
            if !st.election.is_leader() {
                warn!("Only leader can allocate resources");
                return Err(Error::NotLeader(st.election.leader_id().map(str::to_owned)));
            }

            match self.placement.plan_allocation(&st.table, count) {
                Ok(allocation) => {
                    self.placement.apply(&mut st.table, &allocation);
                    self.metrics.allocations_granted.inc();
                    self.metrics.units_allocated.add(count);
                    debug!("Allocated {} units over {} nodes", count, allocation.slices.len());
                    Ok(allocation)
                }
                Err(e) => {
                    self.metrics.allocations_rejected.inc();
                    error!("Allocation of {} units failed: {}", count, e);
                    Err(e)
                }
            }
        })
    }

    /// Return an allocation's units to their nodes. Over-release is clamped
    /// to each node's total. Unknown nodes fail the whole call up front.
    pub fn release(&self, allocation: &Allocation) -> Result<()> {
        self.with_state(|st| {
            if let Some(slice) = allocation
                .slices
                .iter()
                .find(|s| !st.table.contains(&s.node_id))
            {
                return Err(Error::UnknownNode(slice.node_id.clone()));
            }

            for slice in &allocation.slices {
                if let Some(record) = st.table.get_mut(&slice.node_id) {
                    let dropped = record.resources.give_back(slice.count);
                    if dropped > 0 {
                        warn!(
                            "Release of {} units on {} exceeds capacity, clamped ({} dropped)",
                            slice.count, slice.node_id, dropped
                        );
                    }
                    self.metrics.units_released.add(slice.count - dropped);
                }
            }
            Ok(())
        })
    }

    /// Advisory rebalance plan. `None` unless the local node leads.
    pub fn rebalance(&self) -> Option<RebalancePlan> {
        let st = self.lock();
        if !st.election.is_leader() {
            debug!("Rebalance skipped: not leader");
            return None;
        }
        let plan = self.placement.plan_rebalance(&st.table);
        if !plan.is_balanced() {
            info!(
                "Rebalance plan: {} overloaded, {} underloaded (average utilization {:.2})",
                plan.overloaded.len(),
                plan.underloaded.len(),
                plan.average_utilization
            );
        }
        Some(plan)
    }

    // === Work distribution ===

    /// Split a workload over `targets` (or all active nodes with capacity)
    pub fn distribute<W: Workload>(
        &self,
        workload: &W,
        targets: Option<&[String]>,
    ) -> Result<Vec<WorkShare<W>>> {
        let st = self.lock();
        self.distributor.distribute(&st.table, workload, targets)
    }

    /// Fold per-node results into one map
    pub fn aggregate(&self, results: &NodeResults) -> Map<String, Value> {
        WorkloadDistributor::aggregate(results)
    }

    // === Queries ===

    pub fn cluster_status(&self) -> ClusterView {
        let st = self.lock();
        st.table.view(
            st.election.leader_id().map(str::to_owned),
            st.election.epoch(),
            st.election.state(),
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.lock().election.is_leader()
    }

    pub fn leader_id(&self) -> Option<String> {
        self.lock().election.leader_id().map(str::to_owned)
    }

    pub fn epoch(&self) -> u64 {
        self.lock().election.epoch()
    }

    pub fn election_state(&self) -> ElectionState {
        self.lock().election.state()
    }

    pub fn node(&self, node_id: &str) -> Result<NodeRecord> {
        self.lock()
            .table
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::UnknownNode(node_id.to_string()))
    }

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    // === Internals ===

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Coordinator lock of {} was poisoned, recovering", self.node_id);
            poisoned.into_inner()
        })
    }

    /// Run `f` under the lock, then log leader changes and refresh gauges
    fn with_state<R>(&self, f: impl FnOnce(&mut CoordinatorState) -> R) -> R {
        let mut st = self.lock();
        let before = st.election.leader_id().map(str::to_owned);
        let result = f(&mut *st);

        let after = st.election.leader_id();
        if before.as_deref() != after {
            self.metrics.leader_changes.inc();
            info!(
                "Node {}: leader {} -> {}",
                self.node_id,
                before.as_deref().unwrap_or("none"),
                after.unwrap_or("none")
            );
        }

        let view = st.table.view(None, 0, ElectionState::Idle);
        self.metrics.active_nodes.set(view.active_count as u64);
        self.metrics.available_capacity.set(view.available_capacity);
        result
    }

    fn adopt_leader(&self, st: &mut CoordinatorState, leader_id: &str, epoch: u64) -> bool {
        let adopted = st.election.on_leader_claim(leader_id, epoch);
        if !adopted {
            self.metrics.stale_claims.inc();
        }
        adopted
    }

    fn dispatch(&self, outbox: Vec<Outbound>) {
        for outbound in outbox {
            let result = match &outbound {
                Outbound::Send { to, message } => self.transport.send(&self.node_id, to, message),
                Outbound::Broadcast(message) => self.transport.broadcast(&self.node_id, message),
            };
            if let Err(e) = result {
                warn!("Node {} failed to send message: {}", self.node_id, e);
            }
        }
    }
}
