//! Request-scoped deadline, cancellation and caller identity.

use crate::error::NodeError;
use std::future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Carried by every node operation and every outgoing RPC it triggers.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    client_id: String,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels the context it was created with, and every clone of it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl RequestContext {
    /// No deadline, never cancelled, anonymous caller.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancel: Some(rx),
            ..Self::default()
        };
        (ctx, CancelHandle { tx })
    }

    /// Tighten the deadline. A later deadline than the current one is ignored.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn for_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Why the context is finished, if it is.
    pub fn err(&self) -> Option<NodeError> {
        if self.is_cancelled() {
            Some(NodeError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(NodeError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> NodeError {
        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    // A dropped handle can never cancel.
                    if closed {
                        future::pending::<()>().await;
                    }
                }
                None => future::pending::<()>().await,
            }
        };

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => NodeError::Cancelled,
            _ = expired => NodeError::DeadlineExceeded,
        }
    }
}
