//! The locally served replica of a node.
//!
//! Executes partition operations directly against the bucket stores, with
//! no fan-out. Transports deliver remote calls here, and the coordinator
//! uses it for its own share of a fan-out. It also keeps the registry of
//! downstream relays attached to this node.

use crate::batch::UpdateBatch;
use crate::bucket::{Bucket, BucketList};
use crate::client::RelayStatus;
use crate::error::{NodeError, Result};
use crate::iterator::MemorySiblingSetIterator;
use crate::NodeId;
use chrono::Utc;
use parking_lot::RwLock;
use sdx_core::SiblingSet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Capacity of a relay's update queue.
pub const RELAY_QUEUE_CAPACITY: usize = 256;

/// A patch pushed down to an attached relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayUpdate {
    pub site_id: String,
    pub bucket: String,
    pub patch: HashMap<String, SiblingSet>,
}

#[derive(Debug)]
struct RelayLink {
    site_id: String,
    tx: mpsc::Sender<RelayUpdate>,
}

#[derive(Debug)]
pub struct LocalReplica {
    node_id: NodeId,
    buckets: Arc<BucketList>,
    relays: RwLock<HashMap<String, RelayLink>>,
}

impl LocalReplica {
    pub fn new(node_id: NodeId, buckets: Arc<BucketList>) -> Self {
        Self {
            node_id,
            buckets,
            relays: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn buckets(&self) -> &Arc<BucketList> {
        &self.buckets
    }

    pub fn bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        self.buckets
            .get(name)
            .ok_or_else(|| NodeError::BucketNotFound(name.to_string()))
    }

    /// Apply `batch` as writes by this node and return the written sets.
    pub fn batch(
        &self,
        site_id: &str,
        bucket: &str,
        batch: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>> {
        let target = self.bucket(bucket)?;
        let timestamp = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let patch = target.batch(site_id, &self.node_id.to_string(), batch, timestamp)?;

        self.broadcast(&target, site_id, &patch);
        Ok(patch)
    }

    /// Fold a patch from a peer node into local storage.
    pub fn merge(
        &self,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
        broadcast_to_relays: bool,
    ) -> Result<()> {
        let target = self.bucket(bucket)?;
        target.merge(site_id, patch)?;

        if broadcast_to_relays {
            self.broadcast(&target, site_id, patch);
        }
        Ok(())
    }

    /// Fold a patch pushed up by an attached relay.
    pub fn merge_from_relay(
        &self,
        relay_id: &str,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<()> {
        let target = self.bucket(bucket)?;
        if !target.should_replicate_incoming(relay_id) {
            return Err(NodeError::Unauthorized {
                bucket: bucket.to_string(),
                client_id: relay_id.to_string(),
                operation: "replicate into",
            });
        }

        target.merge(site_id, patch)?;
        Ok(())
    }

    pub fn get(&self, site_id: &str, bucket: &str, keys: &[String]) -> Result<Vec<SiblingSet>> {
        Ok(self.bucket(bucket)?.get(site_id, keys)?)
    }

    pub fn get_matches(
        &self,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<MemorySiblingSetIterator> {
        let entries = self.bucket(bucket)?.get_matches(site_id, prefixes)?;
        Ok(MemorySiblingSetIterator::from_entries(entries))
    }

    /// Register a relay for `site_id`. Replacing an attached relay closes
    /// its previous queue.
    pub fn attach_relay(
        &self,
        relay_id: impl Into<String>,
        site_id: impl Into<String>,
    ) -> mpsc::Receiver<RelayUpdate> {
        let (tx, rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        let link = RelayLink {
            site_id: site_id.into(),
            tx,
        };
        self.relays.write().insert(relay_id.into(), link);
        rx
    }

    pub fn detach_relay(&self, relay_id: &str) -> bool {
        self.relays.write().remove(relay_id).is_some()
    }

    pub fn relay_status(&self, relay_id: &str) -> Result<RelayStatus> {
        let relays = self.relays.read();
        let link = relays
            .get(relay_id)
            .ok_or_else(|| NodeError::RelayNotFound(relay_id.to_string()))?;

        Ok(RelayStatus {
            relay_id: relay_id.to_string(),
            site_id: link.site_id.clone(),
            connected: !link.tx.is_closed(),
            connected_to: self.node_id,
            ping_ms: 0,
        })
    }

    // Relay delivery never blocks a write. A full queue drops the update;
    // the relay catches up through its own sync.
    fn broadcast(&self, bucket: &Bucket, site_id: &str, patch: &HashMap<String, SiblingSet>) {
        if patch.is_empty() {
            return;
        }

        let relays = self.relays.read();
        for (relay_id, link) in relays.iter() {
            if link.site_id != site_id || !bucket.should_replicate_outgoing(relay_id) {
                continue;
            }

            let update = RelayUpdate {
                site_id: site_id.to_string(),
                bucket: bucket.name().to_string(),
                patch: patch.clone(),
            };
            match link.tx.try_send(update) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(relay_id = %relay_id, site_id = %site_id, "Relay queue full, dropping update");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(relay_id = %relay_id, "Relay disconnected");
                }
            }
        }
    }
}
