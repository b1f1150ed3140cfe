//! Message transport between coordinators
//!
//! The coordinator only needs point-to-point `send` and `broadcast`; how
//! bytes travel is up to the implementation. `LocalTransport` connects
//! coordinators living in the same process, pushing every message through
//! the frame codec so what is delivered is exactly what a wire would carry.

use crate::common::{decode_frame, encode_frame, ClusterMessage, Error, Result};
use crate::coordinator::node::NodeCoordinator;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, warn};

pub trait Transport: Send + Sync {
    /// Called once by a coordinator right after construction
    fn attach(&self, _node: &Arc<NodeCoordinator>) {}

    /// Deliver `message` to node `to` (a node id, or a seed address)
    fn send(&self, from: &str, to: &str, message: &ClusterMessage) -> Result<()>;

    /// Deliver `message` to every reachable node except `from`
    fn broadcast(&self, from: &str, message: &ClusterMessage) -> Result<()>;
}

/// In-process bus keyed by node id
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Weak<NodeCoordinator>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<NodeCoordinator>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.node_id().to_string(), Arc::downgrade(node));
    }

    /// Cut `node_id` off: nothing is delivered to or from it
    pub fn isolate(&self, node_id: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|e| e.into_inner());
        isolated.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|e| e.into_inner());
        isolated.remove(node_id);
    }

    pub fn is_isolated(&self, node_id: &str) -> bool {
        let isolated = self.isolated.read().unwrap_or_else(|e| e.into_inner());
        isolated.contains(node_id)
    }

    /// Registered node ids, sorted
    pub fn node_ids(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn resolve(&self, from: &str, to: &str) -> Result<Arc<NodeCoordinator>> {
        if self.is_isolated(from) || self.is_isolated(to) {
            return Err(Error::ConnectionFailed(format!("{} -> {}: partitioned", from, to)));
        }
        // Clone the handle out so no bus lock is held during delivery
        let handle = {
            let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
            nodes.get(to).cloned()
        };
        handle
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| Error::ConnectionFailed(format!("{}: no such node", to)))
    }

    fn deliver(target: &NodeCoordinator, message: &ClusterMessage) -> Result<()> {
        let frame = encode_frame(message)?;
        target.deliver(decode_frame(&frame)?)
    }
}

impl Transport for LocalTransport {
    fn attach(&self, node: &Arc<NodeCoordinator>) {
        self.register(node);
    }

    fn send(&self, from: &str, to: &str, message: &ClusterMessage) -> Result<()> {
        let target = self.resolve(from, to)?;
        debug!("{} -> {}: {}", from, to, message.kind());
        Self::deliver(&target, message)
    }

    fn broadcast(&self, from: &str, message: &ClusterMessage) -> Result<()> {
        for to in self.node_ids() {
            if to == from {
                continue;
            }
            let target = match self.resolve(from, &to) {
                Ok(target) => target,
                Err(e) => {
                    debug!("Skipping {} for {} broadcast: {}", to, message.kind(), e);
                    continue;
                }
            };
            if let Err(e) = Self::deliver(&target, message) {
                warn!("Broadcast of {} from {} to {} failed: {}", message.kind(), from, to, e);
            }
        }
        Ok(())
    }
}
