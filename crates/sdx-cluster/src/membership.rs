//! Cluster membership contract.
//!
//! Membership consensus lives outside this crate. A node only needs to know
//! whether it belongs to a cluster, how to bootstrap or join one, and when
//! it has been removed.

use crate::error::MembershipError;
use crate::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipState {
    NotMember,
    Member,
    Decommissioning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// The node left the cluster. `data_transferred` tells whether its
    /// partitions were handed off first.
    NodeRemoved { node_id: NodeId, data_transferred: bool },
    Decommissioning { node_id: NodeId },
}

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn state(&self, node_id: NodeId) -> Result<MembershipState, MembershipError>;

    /// Bootstrap a new cluster with `node_id` as its first member.
    async fn initialize_cluster(&self, node_id: NodeId) -> Result<(), MembershipError>;

    async fn join_cluster(&self, node_id: NodeId, seed: Option<&str>) -> Result<(), MembershipError>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Membership kept in memory, driven by hand.
pub struct StaticMembership {
    states: RwLock<HashMap<NodeId, MembershipState>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// A cluster that already contains `nodes`.
    pub fn with_members(nodes: &[NodeId]) -> Self {
        let membership = Self::new();
        {
            let mut states = membership.states.write();
            for &node_id in nodes {
                states.insert(node_id, MembershipState::Member);
            }
        }
        membership
    }

    pub fn decommission(&self, node_id: NodeId) {
        self.states
            .write()
            .insert(node_id, MembershipState::Decommissioning);
        let _ = self.events.send(MembershipEvent::Decommissioning { node_id });
    }

    pub fn remove(&self, node_id: NodeId, data_transferred: bool) {
        self.states.write().remove(&node_id);
        let _ = self.events.send(MembershipEvent::NodeRemoved {
            node_id,
            data_transferred,
        });
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.states.read().keys().copied().collect();
        members.sort_unstable();
        members
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn state(&self, node_id: NodeId) -> Result<MembershipState, MembershipError> {
        Ok(self
            .states
            .read()
            .get(&node_id)
            .copied()
            .unwrap_or(MembershipState::NotMember))
    }

    async fn initialize_cluster(&self, node_id: NodeId) -> Result<(), MembershipError> {
        self.states.write().insert(node_id, MembershipState::Member);
        Ok(())
    }

    async fn join_cluster(&self, node_id: NodeId, seed: Option<&str>) -> Result<(), MembershipError> {
        let seed = seed.ok_or(MembershipError::MissingSeed)?;
        let mut states = self.states.write();
        if states.is_empty() {
            return Err(MembershipError::SeedUnreachable(seed.to_string()));
        }
        states.insert(node_id, MembershipState::Member);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
