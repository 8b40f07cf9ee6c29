//! Run cancellation
//!
//! A [`CancelHandle`] flips a watch flag that the engine and scheduler check
//! between rounds and before each step. In-flight turns are never interrupted.

use tokio::sync::watch;

/// Sender side: request cancellation of a run
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiver side: observed by the engine
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the last value readable once the sender is gone
        drop(tx);
        Self { rx }
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Create a linked cancel handle and signal
pub fn cancellation() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle {
            tx: std::sync::Arc::new(tx),
        },
        CancellationSignal { rx },
    )
}
