use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;
use uuid::Uuid;

use crate::director::DoneFn;

/// An in-flight proxied call as seen by the registry.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub method: String,
    scope: CancellationToken,
}

/// Tracks in-flight proxied calls.
///
/// A call is registered once its route is resolved and stays registered until
/// its [`CallGuard`] is dropped, whichever way the call ends.
#[derive(Debug)]
pub struct CallRegistry {
    calls: DashMap<Uuid, ActiveCall, ahash::RandomState>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: DashMap::default(),
        }
    }

    /// Register a call. The returned guard removes it again on drop and ends
    /// its cancellation scope.
    pub(crate) fn track(
        self: &Arc<Self>,
        id: Uuid,
        method: impl Into<String>,
        scope: CancellationToken,
        on_done: Option<DoneFn>,
    ) -> CallGuard {
        let method = method.into();
        self.calls.insert(
            id,
            ActiveCall {
                method: method.clone(),
                scope: scope.clone(),
            },
        );

        CallGuard {
            id,
            method,
            scope,
            on_done,
            registry: Arc::clone(self),
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.calls.contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<ActiveCall> {
        self.calls.get(id).map(|entry| entry.value().clone())
    }

    /// Get the number of in-flight calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Cancel the scope of every in-flight call.
    ///
    /// Returns how many calls were signalled. Each call still unwinds through
    /// its own guard, so entries disappear as the calls finish.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.calls.iter() {
            entry.value().scope.cancel();
            cancelled += 1;
        }
        cancelled
    }

    fn remove(&self, id: &Uuid) {
        self.calls.remove(id);
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one registered call until it ends.
///
/// Dropping the guard runs the completion callback (if [`CallGuard::finish`]
/// did not already), deregisters the call and cancels its scope. Since every
/// exit path of a call drops the guard exactly once, the callback and the
/// cancellation each happen exactly once.
pub(crate) struct CallGuard {
    id: Uuid,
    method: String,
    scope: CancellationToken,
    on_done: Option<DoneFn>,
    registry: Arc<CallRegistry>,
}

impl CallGuard {
    /// Report the final outcome of the call and release it.
    pub fn finish(mut self, result: &Result<(), Status>) {
        if let Some(done) = self.on_done.take() {
            done(result.as_ref().err());
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(done) = self.on_done.take() {
            debug!(call_id = %self.id, method = %self.method, "Call abandoned before completion");
            done(Some(&Status::cancelled("call abandoned before completion")));
        }
        self.registry.remove(&self.id);
        self.scope.cancel();
    }
}

impl fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}
