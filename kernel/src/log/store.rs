// Event Log Storage Abstraction
//
// Defines the durability contract for the authoritative event stream and
// the snapshot stream next to it. Implementations may be a hosted event
// store, an embedded log, or the in-memory backend used by tests.
//
// This module defines *interfaces only*.

use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use super::{EncodedEvent, LogEntry, LogError, Revision};

/// One message on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Entry(LogEntry),
    /// The backend ended the subscription; the consumer must resubscribe.
    Cancelled(String),
}

/// An open subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: Receiver<Delivery>,
}

impl Subscription {
    pub fn new(rx: Receiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Wait up to `timeout` for the next delivery; `None` when idle.
    ///
    /// A closed channel is reported as a cancellation.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => Some(delivery),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Delivery::Cancelled("subscription channel closed".into()))
            }
        }
    }
}

/// Storage backend for the policy event stream.
///
/// Properties required from implementations:
/// - Append-only
/// - Totally ordered, revisions strictly increasing
/// - Atomic batches
///
/// Implementations MUST NOT:
/// - Reorder events
/// - Mutate existing events
/// - Interleave two batches
pub trait EventLog: Send + Sync {
    /// Append a batch atomically.
    ///
    /// Returns the revision of the last appended entry, `None` for an
    /// empty batch.
    fn append(&self, batch: Vec<EncodedEvent>) -> Result<Option<Revision>, LogError>;

    /// All entries with a revision strictly greater than `after`, up to the
    /// current tail.
    fn read_from(&self, after: Revision) -> Result<Vec<LogEntry>, LogError>;

    /// Catch-up subscription: every entry after `after`, then live entries.
    fn subscribe_from(&self, after: Revision) -> Result<Subscription, LogError>;

    /// Most recent revision in the stream, waiting at most `timeout`.
    fn tail(&self, timeout: Duration) -> Result<Revision, LogError>;

    /// Fails with [`LogError::ConsumerGroupExists`] if the group is present.
    fn create_consumer_group(&self, group: &str) -> Result<(), LogError>;

    /// Durable subscription resuming after the group's checkpoint.
    fn subscribe_group(&self, group: &str) -> Result<Subscription, LogError>;

    /// Mark an entry as processed; the checkpoint moves past it.
    fn ack(&self, group: &str, revision: Revision) -> Result<(), LogError>;

    /// Abandon an entry for operator inspection; the checkpoint moves past it.
    fn park(&self, group: &str, revision: Revision, reason: &str) -> Result<(), LogError>;
}

/// Serialized policy state tagged with the revision it reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub revision: Revision,
    pub state: Vec<u8>,
}

/// Dedicated stream of snapshots. Deletable: the event stream alone can
/// rebuild everything stored here.
pub trait SnapshotLog: Send + Sync {
    fn append_snapshot(&self, record: SnapshotRecord) -> Result<(), LogError>;

    /// The snapshot with the highest revision, if any.
    fn latest_snapshot(&self) -> Result<Option<SnapshotRecord>, LogError>;
}
