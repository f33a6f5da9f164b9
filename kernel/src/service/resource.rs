// Resource Node
//
// Answers data-plane access decisions from a local replica of the policy.
// Administrative calls and obligation events go to the admin node; when
// they produce events, the caller waits until the replica has applied them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{EppMode, NodeConfig};
use crate::epp::{AsyncEventQueue, EventContext, EventSink};
use crate::gate::{ConsistencyGate, SideEffectCatchUpGate};
use crate::log::{EventLog, Revision, SnapshotLog};
use crate::pdp::{self, OperationCall, PolicyError, UserContext};
use crate::replay::EventApplier;
use crate::replica::{ReplicaSubscriber, ReplicationHandle, ReplicationStatus};
use crate::revision::{LocalRevisionTracker, RemoteTailTracker};
use crate::snapshot::SnapshotStore;
use crate::state::{lock, shared, AccessRightSet, PolicyStore, SharedStore};
use crate::write::Adjudication;

use super::{health, methods, AdminClient, HealthStatus, NodeError, RpcError};

/// An allowed data-plane operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecision {
    pub target: String,
    pub operation: String,
    /// Last revision produced by obligations, `0` if none ran inline.
    pub revision: Revision,
    /// Whether those obligation effects were applied locally in time.
    pub caught_up: bool,
}

/// Result of a call forwarded to the admin node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forwarded {
    pub adjudication: Adjudication,
    /// False when the local replica had not applied the produced events
    /// before the side-effect timeout.
    pub caught_up: bool,
}

/// Result of an event forwarded to the admin node for obligation processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// Last revision the obligations produced, `0` if none matched.
    pub revision: Revision,
    pub caught_up: bool,
}

/// Sends event contexts to the admin node without waiting on replication.
pub struct ForwardToAdmin(pub Arc<dyn AdminClient>);

impl EventSink for ForwardToAdmin {
    fn deliver(&self, ctx: &EventContext) -> Result<Revision, RpcError> {
        self.0.process_event(ctx)
    }
}

pub struct ResourceService<S> {
    store: SharedStore<S>,
    admin: Arc<dyn AdminClient>,
    gate: ConsistencyGate,
    catch_up: SideEffectCatchUpGate,
    forwarder: Option<AsyncEventQueue>,
    local: Arc<LocalRevisionTracker>,
    status: Arc<ReplicationStatus>,
}

impl<S: PolicyStore> ResourceService<S> {
    pub fn store(&self) -> &SharedStore<S> {
        &self.store
    }

    pub fn local_revision(&self) -> Revision {
        self.local.current()
    }

    /// Rights `user` holds on `target` in the local replica.
    pub fn check_access(&self, user: &UserContext, target: &str) -> Result<AccessRightSet, RpcError> {
        self.gate.intercept(methods::CHECK_ACCESS, || {
            let store = lock(&self.store);
            let user_node = store
                .node_by_name(&user.user)
                .ok_or_else(|| PolicyError::UnknownUser(user.user.clone()))?;
            let target_node = store.node_named(target).map_err(PolicyError::from)?;
            Ok(pdp::privileges(&*store, user_node.id, target_node.id))
        })
    }

    /// Decide a resource operation locally, then hand the event to the
    /// obligation engine.
    pub fn adjudicate_resource_operation(
        &self,
        user: &UserContext,
        operation: &str,
        target: &str,
    ) -> Result<ResourceDecision, RpcError> {
        self.gate
            .intercept(methods::ADJUDICATE_RESOURCE_OPERATION, || -> Result<(), RpcError> {
                let store = lock(&self.store);
                if !store.resource_access_rights().contains(operation) {
                    return Err(PolicyError::UnknownAccessRight(operation.to_string()).into());
                }
                pdp::check(&*store, user, target, &[operation])?;
                Ok(())
            })?;

        let mut args = pdp::Args::new();
        args.insert("target".into(), json!(target));
        let ctx = EventContext::new(user.clone(), operation, args);

        let (revision, caught_up) = match &self.forwarder {
            Some(forwarder) => {
                forwarder.submit(ctx);
                (0, true)
            }
            None => {
                let revision = self.admin.process_event(&ctx)?;
                (revision, self.wait_for(revision))
            }
        };
        Ok(ResourceDecision {
            target: target.to_string(),
            operation: operation.to_string(),
            revision,
            caught_up,
        })
    }

    pub fn adjudicate_operation(
        &self,
        user: &UserContext,
        call: &OperationCall,
    ) -> Result<Forwarded, RpcError> {
        self.gate.intercept(methods::ADJUDICATE_OPERATION, || {
            let adjudication = self.admin.adjudicate_operation(user, call)?;
            Ok(self.forwarded(adjudication))
        })
    }

    pub fn adjudicate_routine(
        &self,
        user: &UserContext,
        calls: &[OperationCall],
    ) -> Result<Forwarded, RpcError> {
        self.gate.intercept(methods::ADJUDICATE_ROUTINE, || {
            let adjudication = self.admin.adjudicate_routine(user, calls)?;
            Ok(self.forwarded(adjudication))
        })
    }

    pub fn process_event(&self, ctx: &EventContext) -> Result<ProcessedEvent, RpcError> {
        self.gate.intercept(methods::PROCESS_EVENT, || {
            let revision = self.admin.process_event(ctx)?;
            Ok(ProcessedEvent {
                revision,
                caught_up: self.wait_for(revision),
            })
        })
    }

    pub fn health(&self) -> HealthStatus {
        health(&self.status, &self.local)
    }

    fn forwarded(&self, adjudication: Adjudication) -> Forwarded {
        let caught_up = self.wait_for(adjudication.revision);
        Forwarded {
            adjudication,
            caught_up,
        }
    }

    fn wait_for(&self, revision: Revision) -> bool {
        revision == 0 || self.catch_up.raise_and_wait(revision)
    }
}

/// A running resource node and its replication thread.
pub struct ResourceNode<S> {
    service: Arc<ResourceService<S>>,
    replication: ReplicationHandle,
}

impl<S: PolicyStore + 'static> ResourceNode<S> {
    pub fn start<L>(
        config: &NodeConfig,
        log: Arc<L>,
        store: S,
        admin: Arc<dyn AdminClient>,
    ) -> Result<Self, NodeError>
    where
        L: EventLog + SnapshotLog + 'static,
    {
        let events: Arc<dyn EventLog> = log.clone();
        let snapshot_log: Arc<dyn SnapshotLog> = log;
        let store = shared(store);
        let local = Arc::new(LocalRevisionTracker::new(0));

        let replication = ReplicaSubscriber::new(
            Arc::clone(&events),
            EventApplier::new(Arc::clone(&store), Arc::clone(&local)),
            SnapshotStore::new(snapshot_log, Arc::clone(&store), Arc::clone(&local)),
            Arc::clone(&local),
            config.backoff(),
        )
        .start()?;

        let forwarder = match config.epp_mode {
            EppMode::Sync => None,
            EppMode::Async => Some(AsyncEventQueue::spawn(Arc::new(ForwardToAdmin(
                Arc::clone(&admin),
            )))?),
        };
        let service = Arc::new(ResourceService {
            store,
            admin,
            gate: ConsistencyGate::new(
                Arc::clone(&local),
                Arc::new(RemoteTailTracker::new(events)),
                config.consistency_timeout(),
                config.gate_exclusions.iter().cloned(),
            ),
            catch_up: SideEffectCatchUpGate::new(Arc::clone(&local), config.side_effect_timeout()),
            forwarder,
            local,
            status: Arc::clone(replication.status()),
        });

        Ok(Self {
            service,
            replication,
        })
    }

    pub fn service(&self) -> &Arc<ResourceService<S>> {
        &self.service
    }

    pub fn shutdown(self) {
        self.replication.shutdown();
        self.service.local.interrupt();
    }
}
