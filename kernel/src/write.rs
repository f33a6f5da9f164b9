// Write Coordinator
//
// The single writer. Runs an operation against the local store inside a
// transaction that is always rolled back, captures the mutations as events,
// and appends them to the log in one batch. The local store only changes
// when the appended events come back through replay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::log::{EventLog, LogError, PolicyEvent, Revision};
use crate::pdp::{OperationCall, OperationRegistry, OperationScope, PolicyError, UserContext};
use crate::revision::{LocalRevisionTracker, RemoteTailTracker, WaitError};
use crate::state::bootstrap::{self, ContentType, NodeIds};
use crate::state::{lock, CapturingStore, PolicyStore, SharedStore};

/// Outcome of a successful adjudication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjudication {
    pub value: Value,
    /// Revision of the last appended event, `0` if nothing was appended.
    pub revision: Revision,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("event append failed: {0}")]
    Append(#[from] LogError),

    #[error("writer has not applied its own appends: {0}")]
    Unsettled(#[source] WaitError),
}

pub struct WriteCoordinator<S> {
    store: SharedStore<S>,
    log: Arc<dyn EventLog>,
    registry: Arc<OperationRegistry>,
    local: Arc<LocalRevisionTracker>,
    tail: Arc<RemoteTailTracker>,
    writer: Mutex<()>,
    settle_timeout: Duration,
}

impl<S: PolicyStore> WriteCoordinator<S> {
    pub fn new(
        store: SharedStore<S>,
        log: Arc<dyn EventLog>,
        registry: Arc<OperationRegistry>,
        local: Arc<LocalRevisionTracker>,
        tail: Arc<RemoteTailTracker>,
        settle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            log,
            registry,
            local,
            tail,
            writer: Mutex::new(()),
            settle_timeout,
        }
    }

    pub fn store(&self) -> &SharedStore<S> {
        &self.store
    }

    /// Highest revision this writer knows to be in the log.
    pub fn last_revision(&self) -> Revision {
        self.tail.cached()
    }

    /// Wait until every known append has been applied locally, so the next
    /// adjudication sees its predecessors' effects.
    pub fn settle(&self) -> Result<(), WriteError> {
        self.local
            .wait_for(self.tail.cached(), self.settle_timeout)
            .map(|_| ())
            .map_err(WriteError::Unsettled)
    }

    pub fn adjudicate_operation(
        &self,
        user: &UserContext,
        call: &OperationCall,
    ) -> Result<Adjudication, WriteError> {
        self.adjudicate_routine(user, std::slice::from_ref(call))
    }

    /// Run `calls` in order as one unit. Either every call succeeds and all
    /// their events are appended in a single batch, or nothing is appended.
    pub fn adjudicate_routine(
        &self,
        user: &UserContext,
        calls: &[OperationCall],
    ) -> Result<Adjudication, WriteError> {
        let _writer = lock(&self.writer);
        self.settle()?;

        let (value, events) = {
            let mut store = lock(&self.store);
            capture(&mut *store, |store| {
                let mut scope = OperationScope::new(user, store, &self.registry);
                let mut last = Value::Null;
                for call in calls {
                    last = scope.invoke(call)?;
                }
                Ok(last)
            })?
        };

        let revision = self.append(&events)?;
        tracing::debug!(
            "{} appended {} event(s) through revision {revision}",
            user.user,
            events.len()
        );
        Ok(Adjudication { value, revision })
    }

    /// Apply a bootstrap source as a single `Bootstrapped` event.
    pub fn bootstrap(&self, source: &str, content_type: ContentType) -> Result<Revision, WriteError> {
        let _writer = lock(&self.writer);
        self.settle()?;

        let (created, _) = {
            let mut store = lock(&self.store);
            capture(&mut *store, |store| {
                Ok(bootstrap::apply(store, source, content_type, NodeIds::Allocate)?)
            })?
        };

        let event = PolicyEvent::Bootstrapped {
            source: source.to_string(),
            content_type,
            created,
        };
        let revision = self.append(std::slice::from_ref(&event))?;
        tracing::info!("policy bootstrapped at revision {revision}");
        Ok(revision)
    }

    /// One append per call, even for an empty batch.
    fn append(&self, events: &[PolicyEvent]) -> Result<Revision, WriteError> {
        let batch = events
            .iter()
            .map(PolicyEvent::encode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LogError::from)?;
        let revision = self.log.append(batch)?.unwrap_or(0);
        if revision > 0 {
            self.tail.observe(revision);
        }
        Ok(revision)
    }
}

/// Run `op` against a capturing view of `store` inside a transaction that is
/// always rolled back, returning its result and the events it produced.
fn capture<T>(
    store: &mut dyn PolicyStore,
    op: impl FnOnce(&mut dyn PolicyStore) -> Result<T, PolicyError>,
) -> Result<(T, Vec<PolicyEvent>), PolicyError> {
    store.begin_tx()?;
    let mut capturing = CapturingStore::new(&mut *store);
    let result = op(&mut capturing);
    let events = capturing.into_events();
    store.rollback_tx()?;
    Ok((result?, events))
}
