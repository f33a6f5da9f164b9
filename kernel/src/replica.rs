// Replica Subscriber
//
// Keeps a resource node's policy in step with the log:
//
//   Bootstrapping -> CatchingUp -> Live -> Reconnecting -> Live | Failed
//
// A replica restores the latest snapshot, replays what follows it, then
// follows a catch-up subscription from its local revision. Cancelled
// subscriptions are re-opened from the local revision with backoff, so
// nothing is skipped and redeliveries are ignored by the applier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::backoff::{sleep_unless_shutdown, Backoff, BackoffPolicy};
use crate::log::{Delivery, EventLog, LogEntry, LogError, Subscription};
use crate::replay::EventApplier;
use crate::revision::LocalRevisionTracker;
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::state::PolicyStore;

/// How long a subscription read waits before re-checking shutdown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaState {
    Bootstrapping,
    CatchingUp,
    Live,
    Reconnecting,
    Failed,
}

/// State of a replication loop, shared with health checks.
#[derive(Debug)]
pub struct ReplicationStatus {
    name: &'static str,
    state: Mutex<ReplicaState>,
}

impl ReplicationStatus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ReplicaState::Bootstrapping),
        }
    }

    pub fn get(&self) -> ReplicaState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, next: ReplicaState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == next {
            return;
        }
        if next == ReplicaState::Failed {
            tracing::error!("{}: {:?} -> Failed", self.name, *state);
        } else {
            tracing::info!("{}: {:?} -> {next:?}", self.name, *state);
        }
        *state = next;
    }
}

/// Running replication thread.
pub struct ReplicationHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    status: Arc<ReplicationStatus>,
}

impl ReplicationHandle {
    pub(crate) fn spawn(
        name: &str,
        status: Arc<ReplicationStatus>,
        run: impl FnOnce(&AtomicBool) + Send + 'static,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&flag))?;
        Ok(Self {
            shutdown,
            join,
            status,
        })
    }

    pub fn status(&self) -> &Arc<ReplicationStatus> {
        &self.status
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

pub(crate) enum StreamEnd {
    Shutdown,
    Cancelled(String),
}

/// Feed deliveries to `on_entry` until shutdown, cancellation, or an
/// `on_entry` failure (treated as a dropped subscription).
pub(crate) fn follow(
    subscription: &Subscription,
    shutdown: &AtomicBool,
    mut on_entry: impl FnMut(&LogEntry) -> Result<(), LogError>,
) -> StreamEnd {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return StreamEnd::Shutdown;
        }
        match subscription.recv_timeout(POLL_INTERVAL) {
            None => continue,
            Some(Delivery::Cancelled(reason)) => return StreamEnd::Cancelled(reason),
            Some(Delivery::Entry(entry)) => {
                if let Err(err) = on_entry(&entry) {
                    return StreamEnd::Cancelled(err.to_string());
                }
            }
        }
    }
}

/// Restore the latest snapshot, retrying while the stream is unreachable.
/// An unreadable snapshot is ignored; replay then starts from the current
/// local revision. Returns false on shutdown.
pub(crate) fn restore_snapshot<S: PolicyStore>(
    snapshots: &SnapshotStore<S>,
    backoff: &mut Backoff,
    shutdown: &AtomicBool,
) -> bool {
    loop {
        match snapshots.restore_latest() {
            Ok(_) => return true,
            Err(SnapshotError::Log(err)) if err.is_transient() => {
                tracing::warn!("snapshot stream unavailable: {err}");
                if !sleep_unless_shutdown(backoff.next_delay(), shutdown) {
                    return false;
                }
            }
            Err(err) => {
                tracing::warn!("ignoring snapshot, replaying from the log: {err}");
                return true;
            }
        }
    }
}

/// Feed every entry already in the log past the local revision to
/// `on_entry`. Returns false on shutdown or a permanent log failure, the
/// latter also marking `status` as failed.
pub(crate) fn read_backlog(
    log: &dyn EventLog,
    local: &LocalRevisionTracker,
    status: &ReplicationStatus,
    backoff: &mut Backoff,
    shutdown: &AtomicBool,
    mut on_entry: impl FnMut(&LogEntry),
) -> bool {
    backoff.reset();
    loop {
        match log.read_from(local.current()) {
            Ok(entries) => {
                for entry in &entries {
                    if shutdown.load(Ordering::Relaxed) {
                        return false;
                    }
                    on_entry(entry);
                }
                return true;
            }
            Err(err) if !err.is_transient() => {
                tracing::error!("backlog read failed: {err}");
                status.set(ReplicaState::Failed);
                return false;
            }
            Err(err) => {
                tracing::warn!("backlog read failed, retrying: {err}");
                if !sleep_unless_shutdown(backoff.next_delay(), shutdown) {
                    return false;
                }
            }
        }
    }
}

pub struct ReplicaSubscriber<S> {
    log: Arc<dyn EventLog>,
    applier: EventApplier<S>,
    snapshots: SnapshotStore<S>,
    local: Arc<LocalRevisionTracker>,
    status: Arc<ReplicationStatus>,
    backoff: BackoffPolicy,
}

impl<S: PolicyStore + 'static> ReplicaSubscriber<S> {
    pub fn new(
        log: Arc<dyn EventLog>,
        applier: EventApplier<S>,
        snapshots: SnapshotStore<S>,
        local: Arc<LocalRevisionTracker>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            log,
            applier,
            snapshots,
            local,
            status: Arc::new(ReplicationStatus::new("replica")),
            backoff,
        }
    }

    pub fn start(self) -> std::io::Result<ReplicationHandle> {
        let status = Arc::clone(&self.status);
        ReplicationHandle::spawn("replica-subscriber", status, move |shutdown| {
            self.run(shutdown)
        })
    }

    fn run(&self, shutdown: &AtomicBool) {
        let mut backoff = Backoff::new(self.backoff);

        self.status.set(ReplicaState::Bootstrapping);
        if !restore_snapshot(&self.snapshots, &mut backoff, shutdown) {
            return;
        }
        self.status.set(ReplicaState::CatchingUp);
        let caught_up = read_backlog(
            &*self.log,
            &self.local,
            &self.status,
            &mut backoff,
            shutdown,
            |entry| self.handle(entry),
        );
        if !caught_up {
            return;
        }

        backoff.reset();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.log.subscribe_from(self.local.current()) {
                Ok(subscription) => {
                    backoff.reset();
                    self.status.set(ReplicaState::Live);
                    match follow(&subscription, shutdown, |entry| {
                        self.handle(entry);
                        Ok(())
                    }) {
                        StreamEnd::Shutdown => return,
                        StreamEnd::Cancelled(reason) => tracing::warn!(
                            "replica subscription ended at revision {}: {reason}",
                            self.local.current()
                        ),
                    }
                }
                Err(err) if !err.is_transient() => {
                    tracing::error!("replica cannot subscribe: {err}");
                    self.status.set(ReplicaState::Failed);
                    return;
                }
                Err(err) => tracing::warn!("replica resubscribe failed: {err}"),
            }

            self.status.set(ReplicaState::Reconnecting);
            if !sleep_unless_shutdown(backoff.next_delay(), shutdown) {
                return;
            }
        }
    }

    /// Apply one entry. After a failure the replica holds at the failed
    /// revision: later entries are ignored until it is redelivered.
    fn handle(&self, entry: &LogEntry) {
        if let Some(gap) = self.local.gap() {
            if entry.revision > gap {
                tracing::debug!("holding revision {} behind stalled {gap}", entry.revision);
                return;
            }
        }
        if let Err(err) = self.applier.apply_entry(entry) {
            tracing::warn!(
                "replica stalled at revision {}: {err}",
                entry.revision
            );
            self.local.mark_gap(entry.revision);
        }
    }
}
