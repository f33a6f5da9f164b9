// Policy Snapshots
//
// Serializes the full policy with the revision it reflects, and restores the
// latest one on startup. Snapshots only ever capture a contiguous prefix of
// the log.

use std::sync::Arc;

use crate::log::{LogError, Revision, SnapshotLog, SnapshotRecord};
use crate::revision::LocalRevisionTracker;
use crate::state::{lock, PolicyStore, SharedStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("policy could not be serialized: {0}")]
    Store(#[from] StoreError),

    #[error("snapshot stream failed: {0}")]
    Log(#[from] LogError),

    #[error("revision {0} was never applied; refusing to snapshot past it")]
    NotContiguous(Revision),
}

pub struct SnapshotStore<S> {
    log: Arc<dyn SnapshotLog>,
    store: SharedStore<S>,
    local: Arc<LocalRevisionTracker>,
}

impl<S: PolicyStore> SnapshotStore<S> {
    pub fn new(
        log: Arc<dyn SnapshotLog>,
        store: SharedStore<S>,
        local: Arc<LocalRevisionTracker>,
    ) -> Self {
        Self { log, store, local }
    }

    /// Write the current policy together with the revision it reflects.
    pub fn snapshot(&self) -> Result<Revision, SnapshotError> {
        let record = {
            let store = lock(&self.store);
            if let Some(gap) = self.local.gap() {
                return Err(SnapshotError::NotContiguous(gap));
            }
            SnapshotRecord {
                revision: self.local.current(),
                state: store.to_snapshot()?,
            }
        };

        let revision = record.revision;
        self.log.append_snapshot(record)?;
        tracing::info!("snapshot written at revision {revision}");
        Ok(revision)
    }

    /// Load the latest snapshot into the store and set the local tracker to
    /// its revision. Returns `None` when the stream is empty.
    pub fn restore_latest(&self) -> Result<Option<Revision>, SnapshotError> {
        let Some(record) = self.log.latest_snapshot()? else {
            return Ok(None);
        };

        let mut store = lock(&self.store);
        store.restore_snapshot(&record.state)?;
        self.local.advance(record.revision);
        tracing::info!("restored snapshot at revision {}", record.revision);
        Ok(Some(record.revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryEventLog;
    use crate::state::{shared, MemoryPolicyStore};
    use crate::test_utils::fixture_store;

    #[test]
    fn restore_reproduces_snapshotted_policy_and_revision() {
        let log = Arc::new(InMemoryEventLog::new());
        let writer = SnapshotStore::new(
            log.clone(),
            shared(fixture_store()),
            Arc::new(LocalRevisionTracker::new(1000)),
        );
        assert_eq!(writer.snapshot().unwrap(), 1000);

        let store = shared(MemoryPolicyStore::new());
        let local = Arc::new(LocalRevisionTracker::new(0));
        let reader = SnapshotStore::new(log, Arc::clone(&store), Arc::clone(&local));

        assert_eq!(reader.restore_latest().unwrap(), Some(1000));
        assert_eq!(local.current(), 1000);
        assert_eq!(lock(&store).graph(), fixture_store().graph());
    }

    #[test]
    fn empty_stream_restores_nothing() {
        let log = Arc::new(InMemoryEventLog::new());
        let local = Arc::new(LocalRevisionTracker::new(0));
        let reader = SnapshotStore::new(log, shared(MemoryPolicyStore::new()), local);

        assert_eq!(reader.restore_latest().unwrap(), None);
    }

    #[test]
    fn refuses_to_snapshot_across_a_gap() {
        let log = Arc::new(InMemoryEventLog::new());
        let local = Arc::new(LocalRevisionTracker::new(9));
        local.mark_gap(7);
        let snapshots = SnapshotStore::new(log.clone(), shared(fixture_store()), local);

        assert!(matches!(
            snapshots.snapshot(),
            Err(SnapshotError::NotContiguous(7))
        ));
        assert_eq!(log.snapshot_count(), 0);
    }
}
