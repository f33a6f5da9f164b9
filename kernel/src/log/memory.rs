// In-Memory Event Log
//
// Single-process backend for the event and snapshot streams. Used by the
// simulation and tests; also able to simulate outages and backend-side
// subscription cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use super::store::{Delivery, EventLog, SnapshotLog, SnapshotRecord, Subscription};
use super::{EncodedEvent, LogEntry, LogError, Revision};

/// An entry abandoned by a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedEntry {
    pub revision: Revision,
    pub reason: String,
}

#[derive(Debug, Default)]
struct GroupState {
    checkpoint: Revision,
    settled: BTreeSet<Revision>,
    parked: Vec<ParkedEntry>,
}

impl GroupState {
    fn settle(&mut self, revision: Revision) {
        if revision <= self.checkpoint {
            return;
        }
        self.settled.insert(revision);
        while self.settled.remove(&(self.checkpoint + 1)) {
            self.checkpoint += 1;
        }
    }

    fn is_settled(&self, revision: Revision) -> bool {
        revision <= self.checkpoint || self.settled.contains(&revision)
    }
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    subscribers: Vec<Sender<Delivery>>,
    groups: BTreeMap<String, GroupState>,
    snapshots: Vec<SnapshotRecord>,
    offline: bool,
}

impl LogInner {
    fn ensure_online(&self) -> Result<(), LogError> {
        if self.offline {
            return Err(LogError::Unreachable("in-memory log is offline".into()));
        }
        Ok(())
    }

    fn tail(&self) -> Revision {
        self.entries.last().map(|e| e.revision).unwrap_or(0)
    }

    fn cancel_all(&mut self, reason: &str) {
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(Delivery::Cancelled(reason.to_string()));
        }
    }
}

#[derive(Default)]
pub struct InMemoryEventLog {
    inner: Mutex<LogInner>,
    append_calls: AtomicUsize,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `append` calls observed, including failed and empty ones.
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.clone()
    }

    /// End every open subscription with a cancellation notice.
    pub fn cancel_subscriptions(&self, reason: &str) {
        self.lock().cancel_all(reason);
    }

    /// Simulate an outage. Going offline cancels open subscriptions.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.lock();
        inner.offline = offline;
        if offline {
            inner.cancel_all("log went offline");
        }
    }

    pub fn checkpoint(&self, group: &str) -> Option<Revision> {
        self.lock().groups.get(group).map(|g| g.checkpoint)
    }

    pub fn parked(&self, group: &str) -> Vec<ParkedEntry> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.parked.clone())
            .unwrap_or_default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn clear_snapshots(&self) {
        self.lock().snapshots.clear();
    }
}

impl EventLog for InMemoryEventLog {
    fn append(&self, batch: Vec<EncodedEvent>) -> Result<Option<Revision>, LogError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.lock();
        inner.ensure_online()?;

        let mut last = None;
        for encoded in batch {
            let entry = LogEntry {
                revision: inner.tail() + 1,
                event_id: encoded.event_id,
                event_type: encoded.event_type,
                payload: encoded.payload,
            };
            inner
                .subscribers
                .retain(|tx| tx.send(Delivery::Entry(entry.clone())).is_ok());
            last = Some(entry.revision);
            inner.entries.push(entry);
        }
        Ok(last)
    }

    fn read_from(&self, after: Revision) -> Result<Vec<LogEntry>, LogError> {
        let inner = self.lock();
        inner.ensure_online()?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.revision > after)
            .cloned()
            .collect())
    }

    fn subscribe_from(&self, after: Revision) -> Result<Subscription, LogError> {
        let mut inner = self.lock();
        inner.ensure_online()?;

        // History and registration happen under one lock: no gap, no overlap.
        let (tx, rx) = channel::unbounded();
        for entry in inner.entries.iter().filter(|e| e.revision > after) {
            let _ = tx.send(Delivery::Entry(entry.clone()));
        }
        inner.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    fn tail(&self, _timeout: Duration) -> Result<Revision, LogError> {
        let inner = self.lock();
        inner.ensure_online()?;
        Ok(inner.tail())
    }

    fn create_consumer_group(&self, group: &str) -> Result<(), LogError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        if inner.groups.contains_key(group) {
            return Err(LogError::ConsumerGroupExists(group.to_string()));
        }
        inner.groups.insert(group.to_string(), GroupState::default());
        Ok(())
    }

    fn subscribe_group(&self, group: &str) -> Result<Subscription, LogError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        let state = inner
            .groups
            .get(group)
            .ok_or_else(|| LogError::ConsumerGroupNotFound(group.to_string()))?;

        let (tx, rx) = channel::unbounded();
        for entry in inner.entries.iter().filter(|e| !state.is_settled(e.revision)) {
            let _ = tx.send(Delivery::Entry(entry.clone()));
        }
        inner.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    fn ack(&self, group: &str, revision: Revision) -> Result<(), LogError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        inner
            .groups
            .get_mut(group)
            .ok_or_else(|| LogError::ConsumerGroupNotFound(group.to_string()))?
            .settle(revision);
        Ok(())
    }

    fn park(&self, group: &str, revision: Revision, reason: &str) -> Result<(), LogError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        let state = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| LogError::ConsumerGroupNotFound(group.to_string()))?;
        state.parked.push(ParkedEntry {
            revision,
            reason: reason.to_string(),
        });
        state.settle(revision);
        Ok(())
    }
}

impl SnapshotLog for InMemoryEventLog {
    fn append_snapshot(&self, record: SnapshotRecord) -> Result<(), LogError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        inner.snapshots.push(record);
        Ok(())
    }

    fn latest_snapshot(&self) -> Result<Option<SnapshotRecord>, LogError> {
        let inner = self.lock();
        inner.ensure_online()?;
        Ok(inner.snapshots.iter().max_by_key(|s| s.revision).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::PolicyEvent;
    use crate::state::NodeId;

    fn batch(n: u64) -> Vec<EncodedEvent> {
        (0..n)
            .map(|i| {
                PolicyEvent::NodeDeleted { id: NodeId(i) }
                    .encode()
                    .unwrap()
            })
            .collect()
    }

    fn revisions(sub: &Subscription, n: usize) -> Vec<Revision> {
        (0..n)
            .map(|_| match sub.recv_timeout(Duration::from_secs(1)) {
                Some(Delivery::Entry(e)) => e.revision,
                other => panic!("unexpected delivery: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn append_assigns_contiguous_revisions_per_batch() {
        let log = InMemoryEventLog::new();
        assert_eq!(log.append(batch(2)).unwrap(), Some(2));
        assert_eq!(log.append(batch(0)).unwrap(), None);
        assert_eq!(log.append(batch(3)).unwrap(), Some(5));
        assert_eq!(log.append_calls(), 3);
        assert_eq!(log.tail(Duration::ZERO).unwrap(), 5);
    }

    #[test]
    fn catch_up_subscription_delivers_history_then_live() {
        let log = InMemoryEventLog::new();
        log.append(batch(3)).unwrap();

        let sub = log.subscribe_from(1).unwrap();
        log.append(batch(1)).unwrap();

        assert_eq!(revisions(&sub, 3), vec![2, 3, 4]);
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn group_resumes_after_acked_and_parked_entries() {
        let log = InMemoryEventLog::new();
        log.append(batch(4)).unwrap();
        log.create_consumer_group("g").unwrap();
        assert!(matches!(
            log.create_consumer_group("g"),
            Err(LogError::ConsumerGroupExists(_))
        ));

        log.ack("g", 1).unwrap();
        log.park("g", 2, "poison").unwrap();
        log.ack("g", 4).unwrap();
        assert_eq!(log.checkpoint("g"), Some(2));

        let sub = log.subscribe_group("g").unwrap();
        assert_eq!(revisions(&sub, 1), vec![3]);
        assert_eq!(log.parked("g")[0].revision, 2);
    }

    #[test]
    fn going_offline_cancels_subscriptions() {
        let log = InMemoryEventLog::new();
        let sub = log.subscribe_from(0).unwrap();

        log.set_offline(true);
        assert!(matches!(
            sub.recv_timeout(Duration::from_secs(1)),
            Some(Delivery::Cancelled(_))
        ));
        assert!(log.append(batch(1)).unwrap_err().is_transient());
    }
}
