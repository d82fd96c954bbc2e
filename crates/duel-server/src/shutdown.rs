//! Graceful shutdown coordination via `CancellationToken`.
//!
//! The coordinator owns the root token. The broker, the registry loop, and
//! every connection derive their tokens from it, so one `cancel()` reaches
//! every session and every pump.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::MatchBroker;

/// Default timeout for graceful shutdown before giving up on stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the root cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Perform a graceful shutdown.
    ///
    /// 1. Cancel the root token (pumps, registry loop, sessions)
    /// 2. Stop the broker: fail pending join requests, wait for supervisors
    /// 3. Wait for the remaining handles
    ///
    /// Steps 2 and 3 share one `timeout` budget.
    pub async fn graceful_shutdown(
        &self,
        broker: &MatchBroker,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + timeout;

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "shutting down"
        );

        if tokio::time::timeout_at(deadline, broker.shutdown()).await.is_err() {
            warn!("broker did not stop within {timeout:?}");
            return;
        }

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
