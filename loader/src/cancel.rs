//! Cancellation of an in-flight attempt.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancels the attempt it was taken from.
///
/// Effective until the module is handed to the bridge; after that the
/// guest belongs to the bridge and cancelling does nothing.
///
/// During `Compiling` the attempt fails with `Cancelled` at once, but a
/// compilation already running on the blocking pool cannot be interrupted:
/// it runs to completion in the background and its module is dropped.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
