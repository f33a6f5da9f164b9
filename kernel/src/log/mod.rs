// Policy Event Log
//
// Typed policy-mutation events, their wire encoding, and the log entry
// shape shared by every log backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::bootstrap::ContentType;
use crate::state::{AccessRightSet, NodeId, NodeKind, Prohibition};

pub mod memory;
pub mod store;

pub use memory::InMemoryEventLog;
pub use store::{Delivery, EventLog, SnapshotLog, SnapshotRecord, Subscription};

/// Position in the event log. `0` means "nothing appended yet".
pub type Revision = u64;

/// A replicated policy mutation.
///
/// Each variant carries only what is needed to replay the mutation on an
/// empty or partially built store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyEvent {
    NodeCreated {
        id: NodeId,
        name: String,
        kind: NodeKind,
    },
    NodeDeleted {
        id: NodeId,
    },
    AssignmentCreated {
        child: NodeId,
        parent: NodeId,
    },
    AssignmentDeleted {
        child: NodeId,
        parent: NodeId,
    },
    AssociationCreated {
        ua: NodeId,
        target: NodeId,
        rights: AccessRightSet,
    },
    AssociationDeleted {
        ua: NodeId,
        target: NodeId,
    },
    ProhibitionCreated(Prohibition),
    ProhibitionDeleted {
        name: String,
    },
    ObligationCreated {
        name: String,
        author: NodeId,
        rules: String,
    },
    ObligationDeleted {
        name: String,
    },
    OperationCreated {
        name: String,
        definition: String,
    },
    OperationDeleted {
        name: String,
    },
    ResourceAccessRightsSet {
        rights: AccessRightSet,
    },
    Bootstrapped {
        source: String,
        content_type: ContentType,
        created: BTreeMap<String, NodeId>,
    },
}

impl PolicyEvent {
    /// Tag written next to the payload so backends can index by kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            PolicyEvent::NodeCreated { .. } => "NodeCreated",
            PolicyEvent::NodeDeleted { .. } => "NodeDeleted",
            PolicyEvent::AssignmentCreated { .. } => "AssignmentCreated",
            PolicyEvent::AssignmentDeleted { .. } => "AssignmentDeleted",
            PolicyEvent::AssociationCreated { .. } => "AssociationCreated",
            PolicyEvent::AssociationDeleted { .. } => "AssociationDeleted",
            PolicyEvent::ProhibitionCreated(_) => "ProhibitionCreated",
            PolicyEvent::ProhibitionDeleted { .. } => "ProhibitionDeleted",
            PolicyEvent::ObligationCreated { .. } => "ObligationCreated",
            PolicyEvent::ObligationDeleted { .. } => "ObligationDeleted",
            PolicyEvent::OperationCreated { .. } => "OperationCreated",
            PolicyEvent::OperationDeleted { .. } => "OperationDeleted",
            PolicyEvent::ResourceAccessRightsSet { .. } => "ResourceAccessRightsSet",
            PolicyEvent::Bootstrapped { .. } => "Bootstrapped",
        }
    }

    pub fn encode(&self) -> Result<EncodedEvent, CodecError> {
        Ok(EncodedEvent {
            event_id: Uuid::new_v4(),
            event_type: self.event_type().to_string(),
            payload: serde_json::to_vec(self)?,
        })
    }
}

/// An event ready to be appended; the log assigns its revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
}

/// An appended event as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub revision: Revision,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn decode(&self) -> Result<PolicyEvent, CodecError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("event codec error: {0}")]
pub struct CodecError(#[from] serde_json::Error);

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("event log unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?} waiting for the event log")]
    Timeout(std::time::Duration),

    #[error("consumer group `{0}` already exists")]
    ConsumerGroupExists(String),

    #[error("consumer group `{0}` does not exist")]
    ConsumerGroupNotFound(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl LogError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Unreachable(_) | LogError::Timeout(_))
    }
}
