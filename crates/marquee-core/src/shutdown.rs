//! Cancellation plumbing on top of `tokio::sync::watch`.
//!
//! A `ShutdownController` owns the signal; clones of its `ShutdownToken` are
//! threaded through workers, which either poll `is_cancelled` at safe points
//! or await `cancelled` inside `select!` arms. Child controllers cancel when
//! their parent does, but not the other way around.

use tokio::sync::watch;

/// Owning side of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A controller that cancels when `parent` cancels. Requires a running
    /// tokio runtime.
    pub fn child_of(parent: &ShutdownToken) -> Self {
        let controller = Self::new();
        let token = parent.clone();
        let tx = controller.tx.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(true);
        });
        controller
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving side of a shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// A token that never fires; for tests and detached work.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // leak the sender so the channel stays open
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the controller signals shutdown or is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without signalling: treat as cancelled so orphaned
        // workers exit rather than hang.
    }
}
