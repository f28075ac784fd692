//! Shared cancellation scope for background refresh tasks.
//!
//! Every periodic refresh loop started by the cache manager holds a
//! [`ShutdownSignal`] from one [`ShutdownController`]. Triggering the
//! controller stops all loops together; a refresh already running when the
//! signal fires registers itself as an operation, so
//! [`ShutdownController::shutdown`] can wait for it to finish its merge.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use meshgov_cache::ShutdownController;
//!
//! # tokio_test_block_on(async {
//! let controller = ShutdownController::new();
//! let signal = controller.signal();
//!
//! let waiter = tokio::spawn(signal.wait());
//! assert!(controller.shutdown(Duration::from_secs(1)).await);
//! waiter.await.unwrap();
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{info, warn};

/// Controller for the refresh tasks' shared cancellation scope.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    initiated: AtomicBool,
    tx: watch::Sender<bool>,
    active_ops: AtomicUsize,
    idle: Notify,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// Create a new controller.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                initiated: AtomicBool::new(false),
                tx,
                active_ops: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// A signal that resolves once shutdown starts.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.inner.initiated.load(Ordering::SeqCst)
    }

    /// Signal every holder and wait up to `grace_period` for registered
    /// operations to finish.
    ///
    /// Returns `true` if all operations completed, `false` on timeout.
    /// Calling it again after the first time returns `true` immediately.
    pub async fn shutdown(&self, grace_period: Duration) -> bool {
        if self
            .inner
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }

        info!(grace_period = ?grace_period, "stopping cache refresh tasks");
        self.inner.tx.send_replace(true);

        match timeout(grace_period, self.wait_idle()).await {
            Ok(()) => {
                info!("cache refresh tasks stopped");
                true
            }
            Err(_) => {
                warn!(
                    remaining_ops = self.active_operations(),
                    "refresh tasks did not stop within the grace period"
                );
                false
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.active_ops.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Register an in-flight operation; shutdown waits until the guard drops.
    pub fn register_operation(&self) -> OperationGuard {
        self.inner.active_ops.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of registered operations.
    pub fn active_operations(&self) -> usize {
        self.inner.active_ops.load(Ordering::SeqCst)
    }
}

/// Guard for one registered operation.
#[derive(Debug)]
pub struct OperationGuard {
    inner: Arc<ShutdownInner>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.inner.active_ops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Resolves when shutdown is initiated.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has started.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the shutdown signal.
    ///
    /// A dropped controller counts as shutdown.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
