// Shared fixtures for unit tests.

use std::thread;
use std::time::{Duration, Instant};

use crate::log::{LogEntry, PolicyEvent, Revision};
use crate::state::bootstrap::{self, ContentType, NodeIds};
use crate::state::MemoryPolicyStore;

/// u1 reads under oa1; u2 is prohibited from it; admin holds everything.
pub const FIXTURE_POLICY: &str = r#"
{
  "resource_access_rights": ["read", "write"],
  "nodes": [
    { "name": "pc1", "kind": "policy_class" },
    { "name": "ua1", "kind": "user_attribute", "parents": ["pc1"] },
    { "name": "ua2", "kind": "user_attribute", "parents": ["pc1"] },
    { "name": "admins", "kind": "user_attribute", "parents": ["pc1"] },
    { "name": "oa1", "kind": "object_attribute", "parents": ["pc1"] },
    { "name": "oa2", "kind": "object_attribute", "parents": ["pc1"] },
    { "name": "o1", "kind": "object", "parents": ["oa1"] },
    { "name": "u1", "kind": "user", "parents": ["ua1"] },
    { "name": "u2", "kind": "user", "parents": ["ua1"] },
    { "name": "admin", "kind": "user", "parents": ["admins"] }
  ],
  "associations": [
    { "ua": "ua1", "target": "oa1", "rights": ["read"] },
    { "ua": "admins", "target": "pc1", "rights": ["*"] },
    { "ua": "admins", "target": "PM_ADMIN:base", "rights": ["*"] }
  ],
  "prohibitions": [
    {
      "name": "deny-u2",
      "subject": "u2",
      "rights": ["read"],
      "containers": [{ "name": "oa1" }]
    }
  ]
}
"#;

pub fn fixture_store() -> MemoryPolicyStore {
    let mut store = MemoryPolicyStore::new();
    bootstrap::apply(&mut store, FIXTURE_POLICY, ContentType::Json, NodeIds::Allocate)
        .expect("fixture policy applies");
    store
}

/// The `Bootstrapped` event a writer emits for the fixture policy.
pub fn fixture_bootstrap_event() -> PolicyEvent {
    let mut store = MemoryPolicyStore::new();
    let created =
        bootstrap::apply(&mut store, FIXTURE_POLICY, ContentType::Json, NodeIds::Allocate)
            .expect("fixture policy applies");
    PolicyEvent::Bootstrapped {
        source: FIXTURE_POLICY.to_string(),
        content_type: ContentType::Json,
        created,
    }
}

pub fn entry(revision: Revision, event: &PolicyEvent) -> LogEntry {
    let encoded = event.encode().expect("event encodes");
    LogEntry {
        revision,
        event_id: encoded.event_id,
        event_type: encoded.event_type,
        payload: encoded.payload,
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
