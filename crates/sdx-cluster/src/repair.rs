//! Background read repair.
//!
//! After a read has merged every replica's answer, replicas whose answer
//! was behind the merged value get the merged value pushed back to them.
//! Repairs run detached from the read and never report to the reader.

use crate::client::NodeClient;
use crate::context::RequestContext;
use crate::merger::NodeReadMerger;
use futures::future::join_all;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

pub trait NodeReadRepairer: Send + Sync {
    /// Schedule repair of every replica `merger` heard from. Returns
    /// immediately.
    fn begin_repair(&self, partition: u64, site_id: &str, bucket: &str, merger: Arc<NodeReadMerger>);

    /// Cancel in-flight repairs and refuse new ones. Non-blocking.
    fn stop_repairs(&self);
}

/// Pushes one merge per lagging replica, carrying every key that replica
/// lags on. At most `max_concurrent` merges are in flight at once; the rest
/// wait for a permit, so a hung replica delays other repairs but never
/// drops them.
pub struct ReadRepairer<C> {
    client: Arc<C>,
    timeout: Duration,
    permits: Arc<Semaphore>,
    stop: watch::Sender<bool>,
}

impl<C: NodeClient> ReadRepairer<C> {
    pub fn new(client: Arc<C>, timeout: Duration, max_concurrent: usize) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            client,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            stop,
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

impl<C: NodeClient> NodeReadRepairer for ReadRepairer<C> {
    fn begin_repair(&self, partition: u64, site_id: &str, bucket: &str, merger: Arc<NodeReadMerger>) {
        if self.is_stopped() {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(partition, "Read repair requested outside a runtime");
            return;
        };
        let client = Arc::clone(&self.client);
        let permits = Arc::clone(&self.permits);
        let timeout = self.timeout;
        let mut stop = self.stop.subscribe();
        let site_id = site_id.to_string();
        let bucket = bucket.to_string();

        runtime.spawn(async move {
            let (site_id, bucket) = (site_id.as_str(), bucket.as_str());

            let repairs = merger.nodes().into_iter().filter_map(|node_id| {
                let patch = merger.patch(node_id);
                if patch.is_empty() {
                    return None;
                }

                let client = Arc::clone(&client);
                let permits = Arc::clone(&permits);
                Some(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    debug!(node_id, partition, keys = patch.len(), "Repairing replica");
                    let ctx = RequestContext::with_timeout(timeout);
                    if let Err(err) = client
                        .merge(&ctx, node_id, partition, site_id, bucket, &patch, false)
                        .await
                    {
                        warn!(error = ?err, node_id, partition, "Read repair failed");
                    }
                })
            });
            let repairs: Vec<_> = repairs.collect();
            if repairs.is_empty() {
                return;
            }

            let stopped = async {
                let closed = stop.wait_for(|stopped| *stopped).await.is_err();
                // A dropped repairer can no longer stop anything.
                if closed {
                    future::pending::<()>().await;
                }
            };

            tokio::select! {
                _ = join_all(repairs) => {}
                _ = stopped => debug!(partition, "Read repair cancelled"),
            }
        });
    }

    fn stop_repairs(&self) {
        self.stop.send_replace(true);
    }
}

/// For nodes running with read repair disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRepairer;

impl NodeReadRepairer for NoopRepairer {
    fn begin_repair(&self, _partition: u64, _site_id: &str, _bucket: &str, _merger: Arc<NodeReadMerger>) {}

    fn stop_repairs(&self) {}
}
