//! Refresh coordination: at most one in-flight pull per cache name.
//!
//! The first caller for a name becomes the leader and runs the pull; callers
//! arriving while it runs join it and receive the leader's result. A finished
//! call is unregistered *before* its result is published, so a caller that
//! starts after a shared result was returned never joins that same call
//! again. [`crate::ResourceCache::force_update`] builds the read-after-write
//! guarantee on top of this.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use meshgov_core::{RegistryError, RegistryResult};
use tokio::sync::watch;
use tracing::trace;

/// How a caller's refresh was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller ran the pull.
    Led,
    /// This caller joined a pull already in flight.
    Shared,
}

impl RefreshOutcome {
    /// Whether the result came from another caller's pull.
    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, RefreshOutcome::Shared)
    }
}

type CallResult = Option<RegistryResult<()>>;

#[derive(Debug)]
struct Call {
    id: u64,
    done: watch::Sender<CallResult>,
}

/// Deduplicates concurrent refreshes keyed by cache name.
///
/// One coordinator is shared by every cache in the process.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    calls: Mutex<HashMap<String, Arc<Call>>>,
    next_id: AtomicU64,
}

enum Role {
    Leader(Arc<Call>),
    Follower(watch::Receiver<CallResult>),
}

impl RefreshCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the call already in flight.
    ///
    /// `work` is only invoked when this caller becomes the leader.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (RegistryResult<()>, RefreshOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RegistryResult<()>>,
    {
        match self.join_or_lead(key) {
            Role::Follower(mut rx) => {
                trace!(cache = key, "joining in-flight refresh");
                let result = match rx.wait_for(Option::is_some).await {
                    Ok(done) => done
                        .clone()
                        .unwrap_or_else(|| Err(abandoned(key))),
                    Err(_) => Err(abandoned(key)),
                };
                (result, RefreshOutcome::Shared)
            }
            Role::Leader(call) => {
                let guard = CallGuard {
                    coordinator: self,
                    key,
                    call,
                };
                let result = work().await;
                guard.finish(result.clone());
                (result, RefreshOutcome::Led)
            }
        }
    }

    /// Whether a refresh for `key` is currently in flight.
    pub fn in_flight(&self, key: &str) -> bool {
        self.calls
            .lock()
            .expect("refresh lock poisoned")
            .contains_key(key)
    }

    /// Forget any in-flight call for `key`.
    ///
    /// Callers already waiting still receive that call's result; new callers
    /// start a fresh pull.
    pub fn forget(&self, key: &str) {
        self.calls.lock().expect("refresh lock poisoned").remove(key);
    }

    fn join_or_lead(&self, key: &str) -> Role {
        let mut calls = self.calls.lock().expect("refresh lock poisoned");
        if let Some(call) = calls.get(key) {
            return Role::Follower(call.done.subscribe());
        }
        let (done, _) = watch::channel(None);
        let call = Arc::new(Call {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            done,
        });
        calls.insert(key.to_string(), Arc::clone(&call));
        Role::Leader(call)
    }

    fn unregister(&self, key: &str, id: u64) {
        let mut calls = self.calls.lock().expect("refresh lock poisoned");
        if calls.get(key).is_some_and(|call| call.id == id) {
            calls.remove(key);
        }
    }
}

/// Unregisters the leader's call when dropped, including on cancellation,
/// in which case followers observe a closed channel.
struct CallGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    key: &'a str,
    call: Arc<Call>,
}

impl CallGuard<'_> {
    fn finish(self, result: RegistryResult<()>) {
        self.coordinator.unregister(self.key, self.call.id);
        self.call.done.send_replace(Some(result));
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.unregister(self.key, self.call.id);
    }
}

fn abandoned(key: &str) -> RegistryError {
    RegistryError::RefreshAbandoned {
        cache: key.to_string(),
    }
}
