// Deterministic Replay Engine
//
// Applies policy events to a store. A store's state is derived only by
// replaying events in revision order, either live through an `EventApplier`
// or in bulk from a log read.

use std::sync::Arc;

use crate::log::{CodecError, LogEntry, PolicyEvent, Revision};
use crate::revision::LocalRevisionTracker;
use crate::state::bootstrap::{self, BootstrapError, NodeIds};
use crate::state::{
    lock, Association, Node, Obligation, OperationDef, PolicyStore, SharedStore, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("store rejected event: {0}")]
    Store(#[from] StoreError),

    #[error("bootstrap replay failed: {0}")]
    Bootstrap(#[from] BootstrapError),
}

/// A failed bulk replay, with the revision it stopped at.
#[derive(Debug, thiserror::Error)]
#[error("replay failed at revision {revision}: {source}")]
pub struct ReplayError {
    pub revision: Revision,
    #[source]
    pub source: ApplyError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already at or past this revision; a redelivery.
    Skipped,
}

/// Apply one event's mutation to `store`.
pub fn apply_event(store: &mut dyn PolicyStore, event: &PolicyEvent) -> Result<(), ApplyError> {
    match event {
        PolicyEvent::NodeCreated { id, name, kind } => store.create_node(Node {
            id: *id,
            name: name.clone(),
            kind: *kind,
        })?,
        PolicyEvent::NodeDeleted { id } => store.delete_node(*id)?,
        PolicyEvent::AssignmentCreated { child, parent } => {
            store.create_assignment(*child, *parent)?
        }
        PolicyEvent::AssignmentDeleted { child, parent } => {
            store.delete_assignment(*child, *parent)?
        }
        PolicyEvent::AssociationCreated { ua, target, rights } => {
            store.create_association(Association {
                ua: *ua,
                target: *target,
                rights: rights.clone(),
            })?
        }
        PolicyEvent::AssociationDeleted { ua, target } => store.delete_association(*ua, *target)?,
        PolicyEvent::ProhibitionCreated(prohibition) => {
            store.create_prohibition(prohibition.clone())?
        }
        PolicyEvent::ProhibitionDeleted { name } => store.delete_prohibition(name)?,
        PolicyEvent::ObligationCreated {
            name,
            author,
            rules,
        } => store.create_obligation(Obligation {
            name: name.clone(),
            author: *author,
            rules: rules.clone(),
        })?,
        PolicyEvent::ObligationDeleted { name } => store.delete_obligation(name)?,
        PolicyEvent::OperationCreated { name, definition } => {
            store.create_operation(OperationDef {
                name: name.clone(),
                definition: definition.clone(),
            })?
        }
        PolicyEvent::OperationDeleted { name } => store.delete_operation(name)?,
        PolicyEvent::ResourceAccessRightsSet { rights } => {
            store.set_resource_access_rights(rights.clone())?
        }
        PolicyEvent::Bootstrapped {
            source,
            content_type,
            created,
        } => {
            bootstrap::apply(store, source, *content_type, NodeIds::Recorded(created))?;
        }
    }
    Ok(())
}

/// Apply `event` in its own transaction: all of it or none of it.
fn apply_atomically(store: &mut dyn PolicyStore, event: &PolicyEvent) -> Result<(), ApplyError> {
    store.begin_tx()?;
    match apply_event(store, event) {
        Ok(()) => {
            store.commit_tx()?;
            Ok(())
        }
        Err(err) => {
            store.rollback_tx()?;
            Err(err)
        }
    }
}

/// Replay log entries into `store`, returning the last applied revision.
pub fn replay_entries(
    store: &mut dyn PolicyStore,
    entries: &[LogEntry],
) -> Result<Revision, ReplayError> {
    let mut last = 0;
    for entry in entries {
        let event = entry.decode().map_err(|err| ReplayError {
            revision: entry.revision,
            source: err.into(),
        })?;
        apply_atomically(store, &event).map_err(|source| ReplayError {
            revision: entry.revision,
            source,
        })?;
        last = entry.revision;
    }
    Ok(last)
}

/// Applies live events to a shared store and advances the local tracker.
pub struct EventApplier<S> {
    store: SharedStore<S>,
    local: Arc<LocalRevisionTracker>,
}

impl<S: PolicyStore> EventApplier<S> {
    pub fn new(store: SharedStore<S>, local: Arc<LocalRevisionTracker>) -> Self {
        Self { store, local }
    }

    pub fn apply_entry(&self, entry: &LogEntry) -> Result<ApplyOutcome, ApplyError> {
        if entry.revision <= self.local.current() {
            tracing::debug!("skipping redelivered revision {}", entry.revision);
            return Ok(ApplyOutcome::Skipped);
        }
        let event = entry.decode()?;
        self.apply(&event, entry.revision)
    }

    /// Apply `event` at `revision`. On failure neither the store nor the
    /// tracker changes.
    pub fn apply(
        &self,
        event: &PolicyEvent,
        revision: Revision,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mut store = lock(&self.store);
        if revision <= self.local.current() {
            return Ok(ApplyOutcome::Skipped);
        }

        apply_atomically(&mut *store, event)?;
        self.local.advance(revision);
        tracing::debug!("applied {} at revision {revision}", event.event_type());
        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{shared, MemoryPolicyStore, NodeId, NodeKind};
    use crate::test_utils::{entry, fixture_bootstrap_event, fixture_store};

    fn applier() -> (
        EventApplier<MemoryPolicyStore>,
        SharedStore<MemoryPolicyStore>,
        Arc<LocalRevisionTracker>,
    ) {
        let store = shared(MemoryPolicyStore::new());
        let local = Arc::new(LocalRevisionTracker::new(0));
        (
            EventApplier::new(Arc::clone(&store), Arc::clone(&local)),
            store,
            local,
        )
    }

    #[test]
    fn replaying_bootstrap_reproduces_the_writer_graph() {
        let mut replica = MemoryPolicyStore::new();
        let last = replay_entries(&mut replica, &[entry(1, &fixture_bootstrap_event())]).unwrap();

        assert_eq!(last, 1);
        assert_eq!(replica.graph(), fixture_store().graph());
    }

    #[test]
    fn applier_skips_revisions_already_applied() {
        let (applier, store, local) = applier();
        let created = PolicyEvent::NodeCreated {
            id: NodeId(1),
            name: "pc1".into(),
            kind: NodeKind::PolicyClass,
        };

        assert_eq!(applier.apply(&created, 1).unwrap(), ApplyOutcome::Applied);
        assert_eq!(applier.apply(&created, 1).unwrap(), ApplyOutcome::Skipped);
        assert_eq!(local.current(), 1);
        assert_eq!(lock(&store).graph().node_count(), 1);
    }

    #[test]
    fn failed_event_leaves_store_and_tracker_untouched() {
        let (applier, store, local) = applier();
        applier.apply(&fixture_bootstrap_event(), 1).unwrap();
        let before = lock(&store).graph().clone();

        // Deleting a node that still has children is rejected.
        let pc1 = lock(&store).node_by_name("pc1").unwrap().id;
        let err = applier
            .apply(&PolicyEvent::NodeDeleted { id: pc1 }, 2)
            .unwrap_err();

        assert!(matches!(err, ApplyError::Store(StoreError::NodeHasChildren(_))));
        assert_eq!(local.current(), 1);
        assert_eq!(lock(&store).graph(), &before);
    }

    #[test]
    fn bulk_replay_reports_the_failing_revision() {
        let mut store = MemoryPolicyStore::new();
        let entries = vec![
            entry(1, &fixture_bootstrap_event()),
            entry(2, &PolicyEvent::NodeDeleted { id: NodeId(999) }),
        ];

        let err = replay_entries(&mut store, &entries).unwrap_err();
        assert_eq!(err.revision, 2);
    }
}
