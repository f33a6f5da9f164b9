// End-to-End Cluster Simulation
//
// Runs an admin node and a set of resource nodes over one in-memory log:
// bootstrap → scripted calls → convergence → replica comparison

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::log::{EventLog, InMemoryEventLog, LogError, Revision};
use crate::pdp::{OperationCall, OperationRegistry, UserContext};
use crate::service::{
    AdminNode, AdminStart, BootstrapSource, ErrorCode, HealthStatus, NodeError, ResourceNode,
    RpcError,
};
use crate::state::{lock, MemoryPolicyStore, PolicyStore, StoreError};
use crate::write::Adjudication;

/// One scripted call, as read from a script file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCall {
    pub user: String,
    #[serde(flatten)]
    pub call: OperationCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallOutcome {
    pub user: String,
    pub operation: String,
    /// Node the call entered through.
    pub via: String,
    pub revision: Option<Revision>,
    pub error: Option<ErrorCode>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub revision: Revision,
    pub health: HealthStatus,
    /// Whether this node's policy serializes identically to the admin's.
    pub matches_admin: bool,
}

/// Result of a full simulation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub tail: Revision,
    pub snapshots: usize,
    pub calls: Vec<CallOutcome>,
    pub nodes: Vec<NodeReport>,
}

impl ClusterReport {
    /// Every node reached the tail and holds the admin's policy.
    pub fn converged(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.revision == self.tail && node.matches_admin)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("event log failed: {0}")]
    Log(#[from] LogError),

    #[error("policy could not be serialized: {0}")]
    Store(#[from] StoreError),

    #[error("admin node exited after bootstrap at revision {0}")]
    AdminExited(Revision),
}

/// Run a cluster simulation with `replicas` resource nodes.
///
/// Calls are routed round-robin through the resource nodes (or straight to
/// the admin when there are none), then every node is given up to the
/// consistency timeout to reach the log tail.
pub fn run_cluster(
    config: &NodeConfig,
    bootstrap: &BootstrapSource,
    calls: &[ScriptedCall],
    replicas: usize,
) -> Result<ClusterReport, SimulationError> {
    let config = NodeConfig {
        shutdown_after_bootstrap: false,
        ..config.clone()
    };
    let log = Arc::new(InMemoryEventLog::new());

    // 1. Start the writer and its replicas
    let admin = match AdminNode::start_with_source(
        &config,
        log.clone(),
        MemoryPolicyStore::new(),
        OperationRegistry::new(),
        Some(bootstrap),
    )? {
        AdminStart::Running(node) => node,
        AdminStart::Bootstrapped(revision) => {
            return Err(SimulationError::AdminExited(revision));
        }
    };
    let resources = (0..replicas)
        .map(|_| {
            ResourceNode::start(
                &config,
                log.clone(),
                MemoryPolicyStore::new(),
                admin.service().clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    // 2. Run the script
    let mut outcomes = Vec::with_capacity(calls.len());
    for (i, scripted) in calls.iter().enumerate() {
        let user = UserContext::new(scripted.user.clone());
        let (via, result) = if resources.is_empty() {
            let result = admin.service().adjudicate_operation(&user, &scripted.call);
            ("admin".to_string(), result)
        } else {
            let index = i % resources.len();
            let result = resources[index]
                .service()
                .adjudicate_operation(&user, &scripted.call)
                .map(|forwarded| forwarded.adjudication);
            (format!("resource-{index}"), result)
        };
        outcomes.push(outcome(scripted, via, result));
    }

    // 3. Wait for every node to reach the tail
    let tail = log.tail(config.consistency_timeout())?;
    let deadline = Instant::now() + config.consistency_timeout();
    let admin_service = admin.service();
    await_revision(tail, deadline, || admin_service.local_revision());
    for resource in &resources {
        await_revision(tail, deadline, || resource.service().local_revision());
    }

    // 4. Compare every replica with the writer
    let expected = lock(admin_service.store()).to_snapshot()?;
    let mut nodes = vec![NodeReport {
        name: "admin".into(),
        revision: admin_service.local_revision(),
        health: admin_service.health(),
        matches_admin: true,
    }];
    for (index, resource) in resources.iter().enumerate() {
        let service = resource.service();
        let state = lock(service.store()).to_snapshot()?;
        nodes.push(NodeReport {
            name: format!("resource-{index}"),
            revision: service.local_revision(),
            health: service.health(),
            matches_admin: state == expected,
        });
    }

    let report = ClusterReport {
        tail,
        snapshots: log.snapshot_count(),
        calls: outcomes,
        nodes,
    };

    for resource in resources {
        resource.shutdown();
    }
    admin.shutdown();
    Ok(report)
}

fn outcome(
    scripted: &ScriptedCall,
    via: String,
    result: Result<Adjudication, RpcError>,
) -> CallOutcome {
    let (revision, error, message) = match result {
        Ok(adjudication) => (Some(adjudication.revision), None, None),
        Err(err) => {
            tracing::info!("{} {} rejected: {err}", scripted.user, scripted.call.name);
            (None, Some(err.code()), Some(err.to_string()))
        }
    };
    CallOutcome {
        user: scripted.user.clone(),
        operation: scripted.call.name.clone(),
        via,
        revision,
        error,
        message,
    }
}

fn await_revision(target: Revision, deadline: Instant, current: impl Fn() -> Revision) {
    while current() < target && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::bootstrap::ContentType;
    use crate::test_utils::FIXTURE_POLICY;
    use serde_json::json;

    fn script() -> Vec<ScriptedCall> {
        serde_json::from_value(json!([
            { "user": "admin", "name": "create_object", "args": { "name": "o5", "parents": ["oa1"] } },
            { "user": "u1", "name": "create_object", "args": { "name": "o6", "parents": ["oa1"] } },
            { "user": "admin", "name": "assign", "args": { "child": "o5", "parents": ["oa2"] } }
        ]))
        .unwrap()
    }

    #[test]
    fn full_simulation_converges() {
        let bootstrap = BootstrapSource {
            text: FIXTURE_POLICY.to_string(),
            content_type: ContentType::Json,
        };
        let config = NodeConfig {
            snapshot_interval: 2,
            ..NodeConfig::default()
        };

        let report = run_cluster(&config, &bootstrap, &script(), 2).unwrap();

        assert!(report.converged(), "{report:#?}");
        assert_eq!(report.nodes.len(), 3);

        assert_eq!(report.calls[1].error, Some(ErrorCode::PermissionDenied));
        assert_eq!(report.calls[1].via, "resource-1");
        assert_eq!(report.calls[1].revision, None);

        // The denied call left no trace in the log: the assignment after it
        // is the very next revision.
        let created_at = report.calls[0].revision.unwrap();
        assert_eq!(report.calls[2].revision, Some(created_at + 1));
        assert_eq!(report.calls[2].revision, Some(report.tail));
    }
}
