use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Why the daemon is stopping. The first trigger wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// ctrl-c or an explicit `Daemon::shutdown`.
    Operator,
    /// The scheduling loop ended on its own.
    LoopStopped,
    /// The state database failed; state on disk may be behind memory.
    StorageFailure,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::Operator => "operator request",
            ShutdownReason::LoopStopped => "scheduling loop stopped",
            ShutdownReason::StorageFailure => "storage failure",
        })
    }
}

/// One-shot stop signal shared by the scheduling loop, the HTTP server,
/// loop handles and the ctrl-c handler.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: broadcast::Sender<ShutdownReason>,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Returns false if shutdown was already under way; the original reason
    /// is kept.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_err() {
            debug!(%reason, "shutdown already under way");
            return false;
        }
        info!(%reason, "shutdown triggered");
        let _ = self.tx.send(reason);
        true
    }

    /// Resolves once shutdown has been triggered, including when that
    /// happened before the call.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        if let Some(reason) = self.reason() {
            return reason;
        }
        match rx.recv().await {
            Ok(reason) => reason,
            // Lagged or closed: the flag is authoritative.
            Err(_) => self.reason().unwrap_or(ShutdownReason::LoopStopped),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
