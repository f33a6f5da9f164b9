// Persistent Consumer
//
// The admin node's own replay loop. Reads the log through a durable
// consumer group: every entry is either acknowledged once applied or parked
// when it cannot be, so a poison event never blocks the writer. A parked
// entry leaves a gap that disables snapshots until an operator intervenes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::backoff::{sleep_unless_shutdown, Backoff, BackoffPolicy};
use crate::log::{EventLog, LogEntry, LogError, Revision, Subscription};
use crate::replay::{ApplyOutcome, EventApplier};
use crate::replica::{
    follow, read_backlog, restore_snapshot, ReplicaState, ReplicationHandle, ReplicationStatus,
    StreamEnd, POLL_INTERVAL,
};
use crate::revision::LocalRevisionTracker;
use crate::snapshot::SnapshotStore;
use crate::state::{lock, PolicyStore};

pub struct PersistentConsumer<S> {
    log: Arc<dyn EventLog>,
    group: String,
    applier: EventApplier<S>,
    restore: SnapshotStore<S>,
    local: Arc<LocalRevisionTracker>,
    snapshot_interval: u64,
    snapshot_requests: Option<SnapshotRequests>,
    /// Entries that failed during backlog replay, awaiting a park.
    failed: Mutex<BTreeMap<Revision, String>>,
    status: Arc<ReplicationStatus>,
    backoff: BackoffPolicy,
}

impl<S: PolicyStore + 'static> PersistentConsumer<S> {
    pub fn new(
        log: Arc<dyn EventLog>,
        group: impl Into<String>,
        applier: EventApplier<S>,
        restore: SnapshotStore<S>,
        local: Arc<LocalRevisionTracker>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            log,
            group: group.into(),
            applier,
            restore,
            local,
            snapshot_interval: 0,
            snapshot_requests: None,
            failed: Mutex::new(BTreeMap::new()),
            status: Arc::new(ReplicationStatus::new("admin-consumer")),
            backoff,
        }
    }

    /// Request a snapshot whenever an applied revision is a multiple of
    /// `interval`. `0` disables snapshots.
    pub fn with_snapshots(mut self, interval: u64, requests: SnapshotRequests) -> Self {
        self.snapshot_interval = interval;
        self.snapshot_requests = Some(requests);
        self
    }

    pub fn start(self) -> std::io::Result<ReplicationHandle> {
        let status = Arc::clone(&self.status);
        ReplicationHandle::spawn("admin-consumer", status, move |shutdown| {
            self.run(shutdown)
        })
    }

    fn run(&self, shutdown: &AtomicBool) {
        let mut backoff = Backoff::new(self.backoff);

        self.status.set(ReplicaState::Bootstrapping);
        if !restore_snapshot(&self.restore, &mut backoff, shutdown) {
            return;
        }

        // The store is rebuilt from the snapshot and the raw log; the group
        // checkpoint only tracks which entries still need an ack or a park.
        self.status.set(ReplicaState::CatchingUp);
        let caught_up = read_backlog(
            &*self.log,
            &self.local,
            &self.status,
            &mut backoff,
            shutdown,
            |entry| self.replay(entry),
        );
        if !caught_up {
            return;
        }

        backoff.reset();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.subscribe() {
                Ok(subscription) => {
                    backoff.reset();
                    self.status.set(ReplicaState::Live);
                    match follow(&subscription, shutdown, |entry| self.handle(entry)) {
                        StreamEnd::Shutdown => return,
                        StreamEnd::Cancelled(reason) => tracing::warn!(
                            "consumer group {} dropped at revision {}: {reason}",
                            self.group,
                            self.local.current()
                        ),
                    }
                }
                Err(err) if !err.is_transient() => {
                    tracing::error!("consumer group {} unusable: {err}", self.group);
                    self.status.set(ReplicaState::Failed);
                    return;
                }
                Err(err) => tracing::warn!("consumer group {} resubscribe failed: {err}", self.group),
            }

            self.status.set(ReplicaState::Reconnecting);
            if !sleep_unless_shutdown(backoff.next_delay(), shutdown) {
                return;
            }
        }
    }

    fn subscribe(&self) -> Result<Subscription, LogError> {
        match self.log.create_consumer_group(&self.group) {
            Ok(()) => tracing::info!("created consumer group {}", self.group),
            Err(LogError::ConsumerGroupExists(_)) => {}
            Err(err) => return Err(err),
        }
        self.log.subscribe_group(&self.group)
    }

    /// Backlog replay: apply only. Acks and parks happen once the group
    /// redelivers the entry.
    fn replay(&self, entry: &LogEntry) {
        match self.applier.apply_entry(entry) {
            Ok(ApplyOutcome::Applied) => self.maybe_snapshot(entry.revision),
            Ok(ApplyOutcome::Skipped) => {}
            Err(err) => {
                tracing::warn!("revision {} failed during catch-up: {err}", entry.revision);
                self.local.mark_gap(entry.revision);
                lock(&self.failed).insert(entry.revision, err.to_string());
            }
        }
    }

    fn handle(&self, entry: &LogEntry) -> Result<(), LogError> {
        let earlier_failure = lock(&self.failed).get(&entry.revision).cloned();
        if let Some(reason) = earlier_failure {
            tracing::warn!("parking revision {}: {reason}", entry.revision);
            self.log.park(&self.group, entry.revision, &reason)?;
            lock(&self.failed).remove(&entry.revision);
            return Ok(());
        }

        match self.applier.apply_entry(entry) {
            Ok(outcome) => {
                self.log.ack(&self.group, entry.revision)?;
                if outcome == ApplyOutcome::Applied {
                    self.maybe_snapshot(entry.revision);
                }
            }
            Err(err) => {
                tracing::warn!("parking revision {}: {err}", entry.revision);
                self.local.mark_gap(entry.revision);
                self.log
                    .park(&self.group, entry.revision, &err.to_string())?;
            }
        }
        Ok(())
    }

    fn maybe_snapshot(&self, revision: Revision) {
        let Some(requests) = &self.snapshot_requests else {
            return;
        };
        if self.snapshot_interval == 0 || revision % self.snapshot_interval != 0 {
            return;
        }
        if let Some(gap) = self.local.gap() {
            tracing::warn!("skipping snapshot at {revision}: revision {gap} is parked");
            return;
        }
        requests.request(revision);
    }
}

/// Sending side of the snapshot worker's queue. At most one request waits;
/// extra requests coalesce into it.
#[derive(Clone)]
pub struct SnapshotRequests {
    tx: Sender<Revision>,
}

impl SnapshotRequests {
    pub fn request(&self, revision: Revision) {
        match self.tx.try_send(revision) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!("snapshot already pending; coalescing {revision}")
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("snapshot worker stopped; dropping request for {revision}")
            }
        }
    }
}

/// Background writer for policy snapshots, off the apply path.
pub struct SnapshotWorker {
    requests: SnapshotRequests,
    handle: ReplicationHandle,
}

impl SnapshotWorker {
    pub fn spawn<S: PolicyStore + 'static>(snapshots: SnapshotStore<S>) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded(1);
        let status = Arc::new(ReplicationStatus::new("snapshot-worker"));
        let handle = ReplicationHandle::spawn("snapshot-worker", status, move |shutdown| {
            Self::run(&snapshots, &rx, shutdown)
        })?;
        Ok(Self {
            requests: SnapshotRequests { tx },
            handle,
        })
    }

    fn run<S: PolicyStore>(
        snapshots: &SnapshotStore<S>,
        rx: &Receiver<Revision>,
        shutdown: &AtomicBool,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            let Ok(requested) = rx.recv_timeout(POLL_INTERVAL) else {
                continue;
            };
            match snapshots.snapshot() {
                Ok(revision) => tracing::debug!("snapshot for {requested} taken at {revision}"),
                Err(err) => tracing::warn!("snapshot for {requested} failed: {err}"),
            }
        }
    }

    pub fn requests(&self) -> SnapshotRequests {
        self.requests.clone()
    }

    pub fn shutdown(self) {
        self.handle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{InMemoryEventLog, PolicyEvent, SnapshotLog, SnapshotRecord};
    use crate::state::{lock, shared, MemoryPolicyStore, NodeId, NodeKind, SharedStore};
    use crate::test_utils::{fixture_bootstrap_event, wait_until};
    use std::time::Duration;

    const GROUP: &str = "admin";

    struct Admin {
        store: SharedStore<MemoryPolicyStore>,
        local: Arc<LocalRevisionTracker>,
        consumer: ReplicationHandle,
        worker: SnapshotWorker,
    }

    impl Admin {
        fn stop(self) {
            self.consumer.shutdown();
            self.worker.shutdown();
        }
    }

    /// Snapshot stream whose writes always fail.
    struct BrokenSnapshots;

    impl SnapshotLog for BrokenSnapshots {
        fn append_snapshot(&self, _record: SnapshotRecord) -> Result<(), LogError> {
            Err(LogError::Unreachable("snapshot bucket unavailable".into()))
        }

        fn latest_snapshot(&self) -> Result<Option<SnapshotRecord>, LogError> {
            Ok(None)
        }
    }

    fn start_admin(log: &Arc<InMemoryEventLog>, interval: u64) -> Admin {
        start_admin_with(log, interval, log.clone())
    }

    fn start_admin_with(
        log: &Arc<InMemoryEventLog>,
        interval: u64,
        snapshot_log: Arc<dyn SnapshotLog>,
    ) -> Admin {
        let store = shared(MemoryPolicyStore::new());
        let local = Arc::new(LocalRevisionTracker::new(0));
        let worker = SnapshotWorker::spawn(SnapshotStore::new(
            snapshot_log,
            Arc::clone(&store),
            Arc::clone(&local),
        ))
        .unwrap();
        let consumer = PersistentConsumer::new(
            log.clone(),
            GROUP,
            EventApplier::new(Arc::clone(&store), Arc::clone(&local)),
            SnapshotStore::new(log.clone(), Arc::clone(&store), Arc::clone(&local)),
            Arc::clone(&local),
            BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
        )
        .with_snapshots(interval, worker.requests())
        .start()
        .unwrap();
        Admin {
            store,
            local,
            consumer,
            worker,
        }
    }

    fn append(log: &InMemoryEventLog, event: &PolicyEvent) {
        log.append(vec![event.encode().unwrap()]).unwrap();
    }

    fn object(id: u64) -> PolicyEvent {
        PolicyEvent::NodeCreated {
            id: NodeId(id),
            name: format!("pc{id}"),
            kind: NodeKind::PolicyClass,
        }
    }

    #[test]
    fn acknowledges_applied_entries() {
        let log = Arc::new(InMemoryEventLog::new());
        append(&log, &fixture_bootstrap_event());
        let admin = start_admin(&log, 0);

        wait_until("checkpoint", || log.checkpoint(GROUP) == Some(1));
        append(&log, &object(100));
        wait_until("second ack", || log.checkpoint(GROUP) == Some(2));

        assert!(lock(&admin.store).node_by_name("pc100").is_some());
        admin.stop();
    }

    #[test]
    fn parks_a_failing_entry_and_keeps_going() {
        let log = Arc::new(InMemoryEventLog::new());
        append(&log, &fixture_bootstrap_event());
        append(&log, &PolicyEvent::NodeDeleted { id: NodeId(999) });
        append(&log, &object(100));
        let admin = start_admin(&log, 4);

        wait_until("checkpoint", || log.checkpoint(GROUP) == Some(3));
        assert_eq!(admin.local.current(), 3);
        assert_eq!(admin.local.gap(), Some(2));
        assert_eq!(log.parked(GROUP)[0].revision, 2);

        // With a parked revision behind it, no snapshot may be written.
        append(&log, &object(101));
        wait_until("fourth ack", || log.checkpoint(GROUP) == Some(4));
        thread_sleep();
        assert_eq!(log.snapshot_count(), 0);
        admin.stop();
    }

    #[test]
    fn snapshots_on_interval_boundaries() {
        let log = Arc::new(InMemoryEventLog::new());
        let admin = start_admin(&log, 2);

        append(&log, &object(100));
        append(&log, &object(101));
        wait_until("snapshot", || log.snapshot_count() == 1);

        let latest = log.latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.revision, 2);
        admin.stop();
    }

    #[test]
    fn resumes_after_the_group_is_dropped() {
        let log = Arc::new(InMemoryEventLog::new());
        let admin = start_admin(&log, 0);
        append(&log, &object(100));
        wait_until("first ack", || log.checkpoint(GROUP) == Some(1));

        log.cancel_subscriptions("node restarted");
        append(&log, &object(101));

        wait_until("second ack", || log.checkpoint(GROUP) == Some(2));
        assert_eq!(admin.local.current(), 2);
        admin.stop();
    }

    #[test]
    fn failed_snapshots_do_not_stop_consumption() {
        let log = Arc::new(InMemoryEventLog::new());
        let admin = start_admin_with(&log, 1, Arc::new(BrokenSnapshots));

        append(&log, &fixture_bootstrap_event());
        append(&log, &object(100));
        wait_until("second ack", || log.checkpoint(GROUP) == Some(2));
        thread_sleep();
        append(&log, &object(101));
        wait_until("third ack", || log.checkpoint(GROUP) == Some(3));

        assert_eq!(admin.local.current(), 3);
        assert_eq!(admin.local.gap(), None);
        assert_eq!(log.snapshot_count(), 0);
        assert!(log.parked(GROUP).is_empty());
        let store = lock(&admin.store);
        assert!(store.node_by_name("pc100").is_some());
        assert!(store.node_by_name("pc101").is_some());
        drop(store);
        assert_eq!(admin.consumer.status().get(), ReplicaState::Live);
        admin.stop();
    }

    #[test]
    fn restart_reuses_the_group_and_rebuilds_the_store() {
        let log = Arc::new(InMemoryEventLog::new());
        append(&log, &fixture_bootstrap_event());
        append(&log, &PolicyEvent::NodeDeleted { id: NodeId(999) });
        append(&log, &object(100));

        let first = start_admin(&log, 0);
        wait_until("checkpoint", || log.checkpoint(GROUP) == Some(3));
        first.stop();
        assert_eq!(log.parked(GROUP).len(), 1);

        // The group already exists; the new consumer must join it.
        let second = start_admin(&log, 0);
        wait_until("live", || second.consumer.status().get() == ReplicaState::Live);
        assert_eq!(second.local.current(), 3);
        assert_eq!(second.local.gap(), Some(2));
        assert!(lock(&second.store).node_by_name("pc100").is_some());
        assert!(lock(&second.store).node_by_name("admin").is_some());

        append(&log, &object(101));
        wait_until("fourth ack", || log.checkpoint(GROUP) == Some(4));
        thread_sleep();
        assert_eq!(log.parked(GROUP).len(), 1);
        assert_eq!(log.checkpoint(GROUP), Some(4));
        second.stop();
    }

    fn thread_sleep() {
        std::thread::sleep(Duration::from_millis(50));
    }
}
