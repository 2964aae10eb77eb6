//! Once-only cooperative shutdown.
//!
//! The flag flips from `false` to `true` at most once. The caller that wins
//! the flip broadcasts on a `watch` channel and runs the registered stop
//! actions (the thread runtime registers one that unblocks `accept`). Every
//! other caller, before or after, is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

type StopAction = Box<dyn FnOnce() + Send>;

/// Process-wide stop switch shared by the dispatcher and every worker.
pub struct Shutdown {
    requested: AtomicBool,
    signal: watch::Sender<bool>,
    /// Pending stop actions; drained on the transition
    actions: Mutex<Vec<StopAction>>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        let (signal, _) = watch::channel(false);
        Arc::new(Self {
            requested: AtomicBool::new(false),
            signal,
            actions: Mutex::new(Vec::new()),
        })
    }

    /// Request shutdown. Returns `true` only for the call that flipped the flag.
    pub fn request(&self, reason: &str) -> bool {
        if self
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason, "Shutdown already requested");
            return false;
        }

        info!(reason, "Shutdown requested");
        self.signal.send_replace(true);

        let actions = std::mem::take(&mut *self.lock_actions());
        for action in actions {
            action();
        }
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Register an action to run when shutdown is requested.
    ///
    /// Runs immediately if shutdown has already been requested.
    pub fn on_stop(&self, action: impl FnOnce() + Send + 'static) {
        let mut actions = self.lock_actions();
        if self.is_requested() {
            drop(actions);
            action();
        } else {
            actions.push(Box::new(action));
        }
    }

    /// A receiver that observes the broadcast.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only errors if it is gone.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    fn lock_actions(&self) -> MutexGuard<'_, Vec<StopAction>> {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
