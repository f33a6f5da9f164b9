// Consistency Gates
//
// `ConsistencyGate` holds a request until the local store has caught up to
// the log tail observed at request time. `SideEffectCatchUpGate` holds a
// caller until a revision produced on its behalf is applied locally.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::log::{LogError, Revision};
use crate::revision::{LocalRevisionTracker, RemoteTailTracker, WaitError};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("log tail unavailable: {0}")]
    TailUnavailable(#[source] LogError),

    #[error("policy not caught up: {0}")]
    Stale(#[from] WaitError),
}

/// Request interceptor enforcing read-after-log consistency.
pub struct ConsistencyGate {
    local: Arc<LocalRevisionTracker>,
    tail: Arc<RemoteTailTracker>,
    timeout: Duration,
    exclusions: BTreeSet<String>,
}

impl ConsistencyGate {
    pub fn new(
        local: Arc<LocalRevisionTracker>,
        tail: Arc<RemoteTailTracker>,
        timeout: Duration,
        exclusions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            local,
            tail,
            timeout,
            exclusions: exclusions.into_iter().collect(),
        }
    }

    pub fn is_excluded(&self, method: &str) -> bool {
        self.exclusions.contains(method)
    }

    /// Block until the local revision reaches the current log tail.
    ///
    /// The tail refresh and the wait share one `timeout` budget.
    pub fn admit(&self, method: &str) -> Result<(), GateError> {
        if self.is_excluded(method) {
            return Ok(());
        }

        let started = Instant::now();
        let target = self
            .tail
            .refresh(self.timeout)
            .map_err(GateError::TailUnavailable)?;
        if self.local.current() >= target {
            return Ok(());
        }

        tracing::debug!("{method} waiting for revision {target}");
        let remaining = self.timeout.saturating_sub(started.elapsed());
        self.local.wait_for(target, remaining)?;
        Ok(())
    }

    /// Run `call` once the gate admits `method`.
    pub fn intercept<T, E>(
        &self,
        method: &str,
        call: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<GateError>,
    {
        self.admit(method)?;
        call()
    }
}

/// Read-your-own-side-effects gate for one node.
pub struct SideEffectCatchUpGate {
    local: Arc<LocalRevisionTracker>,
    required: AtomicU64,
    timeout: Duration,
}

impl SideEffectCatchUpGate {
    pub fn new(local: Arc<LocalRevisionTracker>, timeout: Duration) -> Self {
        Self {
            local,
            required: AtomicU64::new(0),
            timeout,
        }
    }

    /// Raise the required revision; lower values never reduce it.
    pub fn raise(&self, revision: Revision) -> Revision {
        self.required
            .fetch_max(revision, Ordering::SeqCst)
            .max(revision)
    }

    pub fn required(&self) -> Revision {
        self.required.load(Ordering::SeqCst)
    }

    /// Wait for the local tracker to reach the required revision.
    ///
    /// Returns false on timeout or interruption; the caller proceeds anyway.
    pub fn await_catch_up(&self) -> bool {
        let required = self.required();
        match self.local.wait_for(required, self.timeout) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("side effects not visible locally: {err}");
                false
            }
        }
    }

    pub fn raise_and_wait(&self, revision: Revision) -> bool {
        self.raise(revision);
        self.await_catch_up()
    }
}
