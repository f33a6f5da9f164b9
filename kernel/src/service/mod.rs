// Node Services
//
// RPC-facing surface of the admin and resource nodes: method names, the
// error taxonomy callers see, health, and the client seam used to reach the
// admin node.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::epp::EventContext;
use crate::gate::GateError;
use crate::log::{LogError, Revision};
use crate::pdp::{OperationCall, PolicyError, UserContext};
use crate::replica::{ReplicaState, ReplicationStatus};
use crate::revision::LocalRevisionTracker;
use crate::state::StoreError;
use crate::write::{Adjudication, WriteError};

pub mod admin;
pub mod resource;

pub use admin::{AdminNode, AdminService, AdminStart, BootstrapSource};
pub use resource::{
    ForwardToAdmin, Forwarded, ProcessedEvent, ResourceDecision, ResourceNode, ResourceService,
};

/// RPC method names, as matched by gate exclusions.
pub mod methods {
    pub const ADJUDICATE_OPERATION: &str = "AdjudicateOperation";
    pub const ADJUDICATE_ROUTINE: &str = "AdjudicateRoutine";
    pub const PROCESS_EVENT: &str = "ProcessEvent";
    pub const CHECK_ACCESS: &str = "CheckAccess";
    pub const ADJUDICATE_RESOURCE_OPERATION: &str = "AdjudicateResourceOperation";
    pub const HEALTH: &str = "Health";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    PermissionDenied,
    InvalidArgument,
    NotFound,
    Unavailable,
    Internal,
}

/// Every failure a node reports to its callers, in three classes.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("unavailable: {0}")]
    Unavailable(#[from] GateError),

    #[error("infrastructure failure: {0}")]
    Infra(#[from] LogError),
}

impl From<WriteError> for RpcError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Policy(err) => RpcError::Policy(err),
            WriteError::Append(err) => RpcError::Infra(err),
            WriteError::Unsettled(err) => RpcError::Unavailable(GateError::Stale(err)),
        }
    }
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::Policy(err) => match err {
                PolicyError::Unauthorized { .. } => ErrorCode::PermissionDenied,
                PolicyError::UnknownUser(_)
                | PolicyError::UnknownOperation(_)
                | PolicyError::Store(StoreError::NodeNotFound(_) | StoreError::NotFound { .. }) => {
                    ErrorCode::NotFound
                }
                _ => ErrorCode::InvalidArgument,
            },
            RpcError::Unavailable(_) => ErrorCode::Unavailable,
            RpcError::Infra(err) if err.is_transient() => ErrorCode::Unavailable,
            RpcError::Infra(_) => ErrorCode::Internal,
        }
    }

    /// Whether the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        self.code() == ErrorCode::Unavailable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Serving,
    NotServing,
}

/// Serving only while replication is live and the local policy is a
/// contiguous prefix of the log.
pub(crate) fn health(status: &ReplicationStatus, local: &LocalRevisionTracker) -> HealthStatus {
    if status.get() == ReplicaState::Live && local.gap().is_none() {
        HealthStatus::Serving
    } else {
        HealthStatus::NotServing
    }
}

/// Failures starting a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("cannot read bootstrap source {path}: {source}")]
    BootstrapSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] WriteError),

    #[error("event log unavailable at startup: {0}")]
    Log(#[from] LogError),

    #[error("cannot start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Synchronous round trip to the admin node.
pub trait AdminClient: Send + Sync {
    fn adjudicate_operation(
        &self,
        user: &UserContext,
        call: &OperationCall,
    ) -> Result<Adjudication, RpcError>;

    fn adjudicate_routine(
        &self,
        user: &UserContext,
        calls: &[OperationCall],
    ) -> Result<Adjudication, RpcError>;

    fn process_event(&self, ctx: &EventContext) -> Result<Revision, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::WaitError;
    use std::time::Duration;

    #[test]
    fn error_classes_map_to_codes() {
        let denied = RpcError::Policy(PolicyError::Unauthorized {
            user: "u1".into(),
            target: "o1".into(),
            missing: ["write".to_string()].into(),
        });
        assert_eq!(denied.code(), ErrorCode::PermissionDenied);
        assert!(!denied.is_retryable());

        let missing = RpcError::Policy(PolicyError::Store(StoreError::NodeNotFound("x".into())));
        assert_eq!(missing.code(), ErrorCode::NotFound);

        let stale = RpcError::from(WriteError::Unsettled(WaitError::TimedOut {
            local: 1,
            target: 2,
            waited: Duration::from_millis(5),
        }));
        assert_eq!(stale.code(), ErrorCode::Unavailable);
        assert!(stale.is_retryable());

        let down = RpcError::Infra(LogError::Unreachable("down".into()));
        assert!(down.is_retryable());
        let group = RpcError::Infra(LogError::ConsumerGroupNotFound("g".into()));
        assert_eq!(group.code(), ErrorCode::Internal);
    }
}
