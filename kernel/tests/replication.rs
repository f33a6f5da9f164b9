// Cross-component replication scenarios: writer, log, replicas and gates
// wired together through the public API only.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use warden_kernel::backoff::BackoffPolicy;
use warden_kernel::gate::{ConsistencyGate, GateError, SideEffectCatchUpGate};
use warden_kernel::log::{EventLog, InMemoryEventLog, LogEntry, Revision};
use warden_kernel::pdp::{self, OperationCall, OperationRegistry, UserContext};
use warden_kernel::replay::{replay_entries, ApplyOutcome, EventApplier};
use warden_kernel::replica::{ReplicaState, ReplicaSubscriber};
use warden_kernel::revision::{LocalRevisionTracker, RemoteTailTracker, WaitError};
use warden_kernel::snapshot::SnapshotStore;
use warden_kernel::state::bootstrap::ContentType;
use warden_kernel::state::{lock, shared, MemoryPolicyStore, PolicyStore, SharedStore};
use warden_kernel::write::WriteCoordinator;

/// o1 starts outside oa1; ua1 reads everything under oa1.
const POLICY: &str = r#"
{
  "resource_access_rights": ["read", "write"],
  "nodes": [
    { "name": "pc1", "kind": "policy_class" },
    { "name": "ua1", "kind": "user_attribute", "parents": ["pc1"] },
    { "name": "admins", "kind": "user_attribute", "parents": ["pc1"] },
    { "name": "oa1", "kind": "object_attribute", "parents": ["pc1"] },
    { "name": "oa2", "kind": "object_attribute", "parents": ["pc1"] },
    { "name": "o1", "kind": "object", "parents": ["oa2"] },
    { "name": "u1", "kind": "user", "parents": ["ua1"] },
    { "name": "admin", "kind": "user", "parents": ["admins"] }
  ],
  "associations": [
    { "ua": "ua1", "target": "oa1", "rights": ["read"] },
    { "ua": "admins", "target": "pc1", "rights": ["*"] },
    { "ua": "admins", "target": "PM_ADMIN:base", "rights": ["*"] }
  ]
}
"#;

/// The admin side: a writer whose appends are applied back into its store
/// by hand, standing in for the persistent consumer.
struct Writer {
    log: Arc<InMemoryEventLog>,
    coordinator: WriteCoordinator<MemoryPolicyStore>,
    applier: EventApplier<MemoryPolicyStore>,
    local: Arc<LocalRevisionTracker>,
}

impl Writer {
    fn bootstrapped() -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        let store = shared(MemoryPolicyStore::new());
        let local = Arc::new(LocalRevisionTracker::new(0));
        let coordinator = WriteCoordinator::new(
            Arc::clone(&store),
            log.clone(),
            Arc::new(OperationRegistry::new()),
            Arc::clone(&local),
            Arc::new(RemoteTailTracker::new(log.clone())),
            Duration::from_secs(1),
        );
        let writer = Self {
            log,
            applier: EventApplier::new(store, Arc::clone(&local)),
            coordinator,
            local,
        };
        writer.coordinator.bootstrap(POLICY, ContentType::Json).unwrap();
        writer.catch_up();
        writer
    }

    fn catch_up(&self) {
        for entry in self.log.read_from(self.local.current()).unwrap() {
            self.applier.apply_entry(&entry).unwrap();
        }
    }

    fn run(&self, user: &str, name: &str, args: serde_json::Value) -> Revision {
        let outcome = self
            .coordinator
            .adjudicate_operation(&UserContext::new(user), &OperationCall::new(name, args))
            .unwrap();
        self.catch_up();
        outcome.revision
    }

    /// Append single-event operations until the log tail is `revision`.
    fn fill_to(&self, revision: Revision) {
        let mut i = 0;
        while self.local.current() < revision {
            let rights = if i % 2 == 0 { json!(["read", "write"]) } else { json!(["read", "write", "list"]) };
            self.run("admin", "set_resource_access_rights", json!({ "rights": rights }));
            i += 1;
        }
    }
}

fn replica_of(entries: &[LogEntry]) -> MemoryPolicyStore {
    let mut store = MemoryPolicyStore::new();
    replay_entries(&mut store, entries).unwrap();
    store
}

fn snapshot_bytes(store: &dyn PolicyStore) -> Vec<u8> {
    store.to_snapshot().unwrap()
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn blocked_request_observes_the_assignment_at_revision_42() {
    let writer = Writer::bootstrapped();
    writer.fill_to(41);

    let revision = writer.run("admin", "assign", json!({ "child": "o1", "parents": ["oa1"] }));
    assert_eq!(revision, 42);
    let entries = writer.log.entries();
    assert_eq!(entries[41].event_type, "AssignmentCreated");

    // A resource node that has applied everything up to 41.
    let store: SharedStore<MemoryPolicyStore> = shared(MemoryPolicyStore::new());
    let local = Arc::new(LocalRevisionTracker::new(0));
    let applier = EventApplier::new(Arc::clone(&store), Arc::clone(&local));
    for entry in &entries[..41] {
        applier.apply_entry(entry).unwrap();
    }
    assert_eq!(local.current(), 41);

    let gate = Arc::new(ConsistencyGate::new(
        Arc::clone(&local),
        Arc::new(RemoteTailTracker::new(writer.log.clone())),
        Duration::from_secs(5),
        Vec::new(),
    ));

    let request = {
        let gate = Arc::clone(&gate);
        let store = Arc::clone(&store);
        thread::spawn(move || {
            gate.intercept("CheckAccess", || {
                let store = lock(&store);
                let u1 = store.node_by_name("u1").unwrap().id;
                let o1 = store.node_by_name("o1").unwrap().id;
                Ok::<_, GateError>(pdp::privileges(&*store, u1, o1))
            })
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!request.is_finished(), "gate let a stale request through");

    applier.apply_entry(&entries[41]).unwrap();
    let granted = request.join().unwrap().unwrap();
    assert!(granted.contains("read"));
}

#[test]
fn denied_adjudication_appends_nothing() {
    let writer = Writer::bootstrapped();
    let before = writer.log.append_calls();

    let denied = writer.coordinator.adjudicate_operation(
        &UserContext::new("u1"),
        &OperationCall::new("assign", json!({ "child": "o1", "parents": ["oa1"] })),
    );

    assert!(denied.is_err());
    assert_eq!(writer.log.append_calls(), before);
}

#[test]
fn snapshot_plus_suffix_equals_full_replay() {
    let writer = Writer::bootstrapped();
    writer.run("admin", "create_object", json!({ "name": "o2", "parents": ["oa1"] }));
    writer.run("admin", "assign", json!({ "child": "o1", "parents": ["oa1"] }));
    writer.run("admin", "deassign", json!({ "child": "o1", "parents": ["oa2"] }));
    writer.run("admin", "delete_node", json!({ "name": "o2" }));

    let entries = writer.log.entries();
    let full = snapshot_bytes(&replica_of(&entries));

    for k in 0..=entries.len() {
        let snapshot = snapshot_bytes(&replica_of(&entries[..k]));

        let mut restored = MemoryPolicyStore::new();
        restored.restore_snapshot(&snapshot).unwrap();
        replay_entries(&mut restored, &entries[k..]).unwrap();

        assert_eq!(snapshot_bytes(&restored), full, "diverged after snapshot at {k}");
    }
}

#[test]
fn resubscription_resumes_without_gaps_or_duplicates() {
    let writer = Writer::bootstrapped();
    writer.fill_to(6);

    let store = shared(MemoryPolicyStore::new());
    let local = Arc::new(LocalRevisionTracker::new(0));
    let replica = ReplicaSubscriber::new(
        writer.log.clone(),
        EventApplier::new(Arc::clone(&store), Arc::clone(&local)),
        SnapshotStore::new(writer.log.clone(), Arc::clone(&store), Arc::clone(&local)),
        Arc::clone(&local),
        BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        },
    )
    .start()
    .unwrap();
    wait_until("revision 6", || local.current() == 6);

    writer.log.cancel_subscriptions("leader moved");
    writer.run("admin", "create_object", json!({ "name": "o2", "parents": ["oa1"] }));
    writer.fill_to(12);

    wait_until("tail", || local.current() == 12);
    wait_until("live", || replica.status().get() == ReplicaState::Live);
    assert_eq!(
        snapshot_bytes(&*lock(&store)),
        snapshot_bytes(&replica_of(&writer.log.entries()))
    );

    // Redelivery of an applied revision is a no-op.
    let applier = EventApplier::new(Arc::clone(&store), Arc::clone(&local));
    let sixth = writer.log.entries()[5].clone();
    assert_eq!(applier.apply_entry(&sixth).unwrap(), ApplyOutcome::Skipped);
    assert_eq!(local.current(), 12);

    replica.shutdown();
}

#[test]
fn local_revision_never_decreases() {
    let local = LocalRevisionTracker::new(0);
    let mut seen = Vec::new();
    for revision in [3, 1, 5, 5, 2, 9, 4] {
        local.advance(revision);
        seen.push(local.current());
    }

    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(local.current(), 9);
}

#[test]
fn gate_fails_after_roughly_the_timeout() {
    let writer = Writer::bootstrapped();
    writer.fill_to(3);

    let gate = ConsistencyGate::new(
        Arc::new(LocalRevisionTracker::new(2)),
        Arc::new(RemoteTailTracker::new(writer.log.clone())),
        Duration::from_millis(100),
        Vec::new(),
    );

    let started = Instant::now();
    let err = gate.admit("CheckAccess").unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, GateError::Stale(WaitError::TimedOut { .. })));
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn catch_up_target_only_rises() {
    let gate = SideEffectCatchUpGate::new(
        Arc::new(LocalRevisionTracker::new(0)),
        Duration::from_millis(10),
    );
    for revision in [5, 3, 7, 6] {
        gate.raise(revision);
    }
    assert_eq!(gate.required(), 7);
}
