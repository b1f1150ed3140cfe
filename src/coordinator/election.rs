//! Bully leader election
//!
//! The highest active node id wins. A node starting an election sends
//! `Election` to every active node with a higher id; if there is none it
//! declares itself leader and broadcasts `Coordinator`. A node that hears
//! `Election` from a lower id answers `Alive` and runs its own election.
//!
//! Leadership claims carry an epoch. A claim is adopted when its epoch is
//! newer than the local one, or equal and from an id not lower than the
//! currently known leader. Every self-declaration bumps the epoch.

use crate::common::messages::{ClusterMessage, Outbound};
use crate::common::utils::duration_millis;
use crate::coordinator::membership::MembershipTable;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Election role of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    Idle,
    ElectionInProgress,
    Leader,
    Follower,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "idle"),
            ElectionState::ElectionInProgress => write!(f, "election-in-progress"),
            ElectionState::Leader => write!(f, "leader"),
            ElectionState::Follower => write!(f, "follower"),
        }
    }
}

/// Leadership state of one node
#[derive(Debug, Clone)]
pub struct Election {
    local_id: String,
    state: ElectionState,
    leader_id: Option<String>,
    epoch: u64,
    /// When a pending election gives up waiting for `Coordinator` (ms)
    deadline: Option<u64>,
    timeout: Duration,
}

impl Election {
    /// Bootstrap leaders start at epoch 1 so that any follower at epoch 0
    /// adopts their first heartbeat.
    pub fn new(local_id: impl Into<String>, is_leader: bool, timeout: Duration) -> Self {
        let local_id = local_id.into();
        let (state, leader_id, epoch) = if is_leader {
            (ElectionState::Leader, Some(local_id.clone()), 1)
        } else {
            (ElectionState::Idle, None, 0)
        };
        Self {
            local_id,
            state,
            leader_id,
            epoch,
            deadline: None,
            timeout,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    /// Deadline of the pending election, if one is awaiting `Coordinator`
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Run an election from the local node's point of view.
    pub fn start(&mut self, table: &MembershipTable, now: u64) -> Vec<Outbound> {
        self.state = ElectionState::ElectionInProgress;
        self.leader_id = None;

        let higher: Vec<String> = table
            .active()
            .filter(|r| r.node_id.as_str() > self.local_id.as_str())
            .map(|r| r.node_id.clone())
            .collect();

        if higher.is_empty() {
            return vec![self.declare_self()];
        }

        info!(
            "Node {} sending election message to higher nodes: {:?}",
            self.local_id, higher
        );
        self.state = ElectionState::Follower;
        self.deadline = Some(now.saturating_add(self.jittered_timeout()));

        higher
            .into_iter()
            .map(|to| Outbound::Send {
                to,
                message: ClusterMessage::Election {
                    sender_id: self.local_id.clone(),
                },
            })
            .collect()
    }

    /// Become leader in a new epoch and announce it
    pub fn declare_self(&mut self) -> Outbound {
        self.epoch += 1;
        self.state = ElectionState::Leader;
        self.leader_id = Some(self.local_id.clone());
        self.deadline = None;
        info!(
            "Node {} elected as new leader (epoch {})",
            self.local_id, self.epoch
        );
        Outbound::Broadcast(ClusterMessage::Coordinator {
            new_leader_id: self.local_id.clone(),
            epoch: self.epoch,
        })
    }

    /// `Election` received from `sender_id`
    pub fn on_election(
        &mut self,
        sender_id: &str,
        table: &MembershipTable,
        now: u64,
    ) -> Vec<Outbound> {
        if sender_id >= self.local_id.as_str() {
            debug!("Ignoring election from higher node {}", sender_id);
            return Vec::new();
        }

        info!("Replying to election from {}", sender_id);
        let mut out = vec![Outbound::Send {
            to: sender_id.to_string(),
            message: ClusterMessage::Alive {
                sender_id: self.local_id.clone(),
            },
        }];
        out.extend(self.start(table, now));
        out
    }

    /// A higher node answered our election. It now runs its own round, so
    /// wait for its announcement over two timeouts instead of one.
    pub fn on_alive(&mut self, sender_id: &str, now: u64) {
        if self.deadline.is_some() {
            debug!("Node {} is alive, awaiting coordinator", sender_id);
            let wait = self.jittered_timeout().saturating_mul(2);
            self.deadline = Some(now.saturating_add(wait));
        }
    }

    /// Leadership claim from an announcement or a heartbeat.
    /// Returns true if `leader_id` was adopted.
    pub fn on_leader_claim(&mut self, leader_id: &str, epoch: u64) -> bool {
        let accept = epoch > self.epoch
            || (epoch == self.epoch
                && self
                    .leader_id
                    .as_deref()
                    .map_or(true, |current| leader_id >= current));

        if !accept {
            warn!(
                "Ignoring stale leadership claim from {} (epoch {}, local epoch {})",
                leader_id, epoch, self.epoch
            );
            return false;
        }

        self.epoch = epoch;
        self.leader_id = Some(leader_id.to_string());
        self.deadline = None;
        self.state = if leader_id == self.local_id {
            ElectionState::Leader
        } else {
            ElectionState::Follower
        };
        true
    }

    /// Self-declare if the awaited announcement never came.
    pub fn check_deadline(&mut self, now: u64) -> Option<Outbound> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                warn!(
                    "Node {} got no coordinator announcement before deadline, taking over",
                    self.local_id
                );
                Some(self.declare_self())
            }
            _ => None,
        }
    }

    /// Hand leadership to the highest remaining active peer on shutdown.
    /// Returns the announcement to broadcast, if there is a successor.
    pub fn hand_off(&mut self, table: &MembershipTable) -> Option<Outbound> {
        let was_leader = self.is_leader();
        self.state = ElectionState::Idle;
        self.deadline = None;
        if !was_leader {
            return None;
        }

        match table.active_peer_ids().into_iter().max() {
            Some(successor) => {
                self.epoch += 1;
                self.leader_id = Some(successor.clone());
                info!(
                    "Announcing new leader before shutdown: {} (epoch {}, previous {})",
                    successor, self.epoch, self.local_id
                );
                Some(Outbound::Broadcast(ClusterMessage::Coordinator {
                    new_leader_id: successor,
                    epoch: self.epoch,
                }))
            }
            None => {
                info!("No active node left to take over leadership");
                self.leader_id = None;
                None
            }
        }
    }

    fn jittered_timeout(&self) -> u64 {
        let base = duration_millis(self.timeout);
        base + rand::thread_rng().gen_range(0..=base / 10)
    }
}
