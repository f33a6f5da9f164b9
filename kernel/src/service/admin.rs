// Admin Node
//
// The single writer: adjudicates administrative operations through the
// write coordinator, runs obligations, and replays its own appends through
// a persistent consumer. Snapshots are written by a background worker.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::{EppMode, NodeConfig};
use crate::consumer::{PersistentConsumer, SnapshotWorker};
use crate::epp::{AsyncEventQueue, Epp, EventContext};
use crate::gate::ConsistencyGate;
use crate::log::{EventLog, Revision, SnapshotLog};
use crate::pdp::{OperationCall, OperationRegistry, UserContext};
use crate::replay::EventApplier;
use crate::replica::{ReplicationHandle, ReplicationStatus};
use crate::revision::{LocalRevisionTracker, RemoteTailTracker};
use crate::snapshot::SnapshotStore;
use crate::state::bootstrap::ContentType;
use crate::state::{shared, PolicyStore, SharedStore};
use crate::write::{Adjudication, WriteCoordinator};

use super::{health, methods, AdminClient, HealthStatus, NodeError, RpcError};

/// Policy source applied to an empty log at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSource {
    pub text: String,
    pub content_type: ContentType,
}

impl BootstrapSource {
    pub fn read(path: &Path) -> Result<Self, NodeError> {
        let text = fs::read_to_string(path).map_err(|source| NodeError::BootstrapSource {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            text,
            content_type: ContentType::from_path(path),
        })
    }
}

pub struct AdminService<S> {
    writer: Arc<WriteCoordinator<S>>,
    epp: Arc<Epp<S>>,
    queue: Option<AsyncEventQueue>,
    gate: ConsistencyGate,
    local: Arc<LocalRevisionTracker>,
    status: Arc<ReplicationStatus>,
}

impl<S: PolicyStore + 'static> AdminService<S> {
    pub fn store(&self) -> &SharedStore<S> {
        self.writer.store()
    }

    pub fn local_revision(&self) -> Revision {
        self.local.current()
    }

    pub fn adjudicate_operation(
        &self,
        user: &UserContext,
        call: &OperationCall,
    ) -> Result<Adjudication, RpcError> {
        self.gate.intercept(methods::ADJUDICATE_OPERATION, || {
            let outcome = self.writer.adjudicate_operation(user, call)?;
            Ok(self.run_obligations(user, std::slice::from_ref(call), outcome))
        })
    }

    pub fn adjudicate_routine(
        &self,
        user: &UserContext,
        calls: &[OperationCall],
    ) -> Result<Adjudication, RpcError> {
        self.gate.intercept(methods::ADJUDICATE_ROUTINE, || {
            let outcome = self.writer.adjudicate_routine(user, calls)?;
            Ok(self.run_obligations(user, calls, outcome))
        })
    }

    /// Run obligations for an event reported by a resource node. Returns the
    /// last revision produced, `0` when nothing was appended or the event
    /// was queued.
    pub fn process_event(&self, ctx: &EventContext) -> Result<Revision, RpcError> {
        self.gate.intercept(methods::PROCESS_EVENT, || match &self.queue {
            Some(queue) => {
                queue.submit(ctx.clone());
                Ok(0)
            }
            None => Ok(self.epp.process_event(ctx)?),
        })
    }

    pub fn health(&self) -> HealthStatus {
        health(&self.status, &self.local)
    }

    /// The operation is committed at this point: obligation failures are
    /// logged, never reported to the caller.
    fn run_obligations(
        &self,
        user: &UserContext,
        calls: &[OperationCall],
        mut outcome: Adjudication,
    ) -> Adjudication {
        for call in calls {
            let ctx = EventContext::new(user.clone(), call.name.clone(), call.args.clone());
            if let Some(queue) = &self.queue {
                queue.submit(ctx);
                continue;
            }
            match self.epp.process_event(&ctx) {
                Ok(revision) => outcome.revision = outcome.revision.max(revision),
                Err(err) => tracing::warn!("obligations for {} not run: {err}", call.name),
            }
        }
        outcome
    }
}

impl<S: PolicyStore + 'static> AdminClient for AdminService<S> {
    fn adjudicate_operation(
        &self,
        user: &UserContext,
        call: &OperationCall,
    ) -> Result<Adjudication, RpcError> {
        AdminService::adjudicate_operation(self, user, call)
    }

    fn adjudicate_routine(
        &self,
        user: &UserContext,
        calls: &[OperationCall],
    ) -> Result<Adjudication, RpcError> {
        AdminService::adjudicate_routine(self, user, calls)
    }

    fn process_event(&self, ctx: &EventContext) -> Result<Revision, RpcError> {
        AdminService::process_event(self, ctx)
    }
}

pub enum AdminStart<S> {
    Running(AdminNode<S>),
    /// Configured as a one-shot bootstrap job; the log holds this revision.
    Bootstrapped(Revision),
}

/// A running admin node and its background threads.
pub struct AdminNode<S> {
    service: Arc<AdminService<S>>,
    consumer: ReplicationHandle,
    snapshots: SnapshotWorker,
}

impl<S: PolicyStore + 'static> AdminNode<S> {
    /// Start from `config`, reading its bootstrap source if one is set.
    pub fn start<L>(
        config: &NodeConfig,
        log: Arc<L>,
        store: S,
        registry: OperationRegistry,
    ) -> Result<AdminStart<S>, NodeError>
    where
        L: EventLog + SnapshotLog + 'static,
    {
        let source = config
            .bootstrap_path
            .as_deref()
            .map(BootstrapSource::read)
            .transpose()?;
        Self::start_with_source(config, log, store, registry, source.as_ref())
    }

    pub fn start_with_source<L>(
        config: &NodeConfig,
        log: Arc<L>,
        store: S,
        registry: OperationRegistry,
        bootstrap: Option<&BootstrapSource>,
    ) -> Result<AdminStart<S>, NodeError>
    where
        L: EventLog + SnapshotLog + 'static,
    {
        let events: Arc<dyn EventLog> = log.clone();
        let snapshot_log: Arc<dyn SnapshotLog> = log;
        let store = shared(store);
        let local = Arc::new(LocalRevisionTracker::new(0));
        let tail = Arc::new(RemoteTailTracker::new(Arc::clone(&events)));

        let writer = Arc::new(WriteCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::new(registry),
            Arc::clone(&local),
            Arc::clone(&tail),
            config.consistency_timeout(),
        ));

        // Adjudications must not run against a store that has not yet
        // replayed what the log already holds.
        let known_tail = tail.refresh(config.consistency_timeout())?;

        if let Some(source) = bootstrap {
            let revision = if known_tail == 0 {
                writer.bootstrap(&source.text, source.content_type)?
            } else {
                tracing::info!("log already at revision {known_tail}; skipping bootstrap");
                known_tail
            };
            if config.shutdown_after_bootstrap {
                return Ok(AdminStart::Bootstrapped(revision));
            }
        }

        let snapshots = SnapshotWorker::spawn(SnapshotStore::new(
            Arc::clone(&snapshot_log),
            Arc::clone(&store),
            Arc::clone(&local),
        ))?;
        let consumer = PersistentConsumer::new(
            Arc::clone(&events),
            config.consumer_group.clone(),
            EventApplier::new(Arc::clone(&store), Arc::clone(&local)),
            SnapshotStore::new(snapshot_log, Arc::clone(&store), Arc::clone(&local)),
            Arc::clone(&local),
            config.backoff(),
        )
        .with_snapshots(config.snapshot_interval, snapshots.requests())
        .start()?;

        let epp = Arc::new(Epp::new(Arc::clone(&writer)));
        let queue = match config.epp_mode {
            EppMode::Sync => None,
            EppMode::Async => Some(AsyncEventQueue::spawn(epp.clone())?),
        };
        let service = Arc::new(AdminService {
            writer,
            epp,
            queue,
            gate: ConsistencyGate::new(
                Arc::clone(&local),
                tail,
                config.consistency_timeout(),
                config.gate_exclusions.iter().cloned(),
            ),
            local,
            status: Arc::clone(consumer.status()),
        });

        tracing::info!("admin node started at log revision {known_tail}");
        Ok(AdminStart::Running(AdminNode {
            service,
            consumer,
            snapshots,
        }))
    }

    pub fn service(&self) -> &Arc<AdminService<S>> {
        &self.service
    }

    /// Stop background threads and fail any request still waiting on them.
    pub fn shutdown(self) {
        self.consumer.shutdown();
        self.snapshots.shutdown();
        self.service.local.interrupt();
    }
}
