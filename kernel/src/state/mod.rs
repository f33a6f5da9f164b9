// Policy State
//
// The policy store contract consumed by the replication core, plus the
// graph element types carried by events and snapshots.
//
// The store itself is an external collaborator: this module only fixes the
// mutation/query surface that events replay through.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

pub mod bootstrap;
pub mod capture;
pub mod memory;

pub use capture::CapturingStore;
pub use memory::{MemoryPolicyStore, PolicyGraph};

/// A policy store shared between the applying component and readers.
pub type SharedStore<S> = Arc<Mutex<S>>;

pub fn shared<S: PolicyStore>(store: S) -> SharedStore<S> {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store, recovering the guard from a poisoned lock.
pub fn lock<S: ?Sized>(store: &Mutex<S>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stable identifier for a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a node in the access-control graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    PolicyClass,
    UserAttribute,
    ObjectAttribute,
    User,
    Object,
}

impl NodeKind {
    /// Whether a node of this kind may be assigned to a node of `parent` kind.
    pub fn can_assign_to(self, parent: NodeKind) -> bool {
        use NodeKind::*;

        matches!(
            (self, parent),
            (UserAttribute, UserAttribute | PolicyClass)
                | (ObjectAttribute, ObjectAttribute | PolicyClass)
                | (User, UserAttribute)
                | (Object, ObjectAttribute)
        )
    }

    pub fn is_user_side(self) -> bool {
        matches!(self, NodeKind::User | NodeKind::UserAttribute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

pub type AccessRightSet = BTreeSet<String>;

/// Grants `rights` to members of `ua` over everything contained in `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub ua: NodeId,
    pub target: NodeId,
    pub rights: AccessRightSet,
}

/// One container clause of a prohibition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCondition {
    pub container: NodeId,
    pub complement: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prohibition {
    pub name: String,
    /// A user or user attribute.
    pub subject: NodeId,
    pub rights: AccessRightSet,
    /// Conjunctive (all containers) when true, disjunctive otherwise.
    pub intersection: bool,
    pub containers: Vec<ContainerCondition>,
}

/// An obligation as stored: rule text stays serialized until the EPP reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    pub name: String,
    pub author: NodeId,
    pub rules: String,
}

/// A policy-defined operation; `definition` is its serialized routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDef {
    pub name: String,
    pub definition: String,
}

/// Errors produced by a policy store mutation or query.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node `{0}` does not exist")]
    NodeNotFound(String),

    #[error("node {0} does not exist")]
    NodeIdNotFound(NodeId),

    #[error("node `{0}` already exists")]
    NodeExists(String),

    #[error("node id {0} is already in use")]
    NodeIdInUse(NodeId),

    #[error("cannot assign {child:?} to {parent:?}")]
    InvalidAssignment { child: NodeKind, parent: NodeKind },

    #[error("assignment {child} -> {parent} already exists")]
    AssignmentExists { child: NodeId, parent: NodeId },

    #[error("assignment {child} -> {parent} does not exist")]
    AssignmentNotFound { child: NodeId, parent: NodeId },

    #[error("node {0} still has children assigned to it")]
    NodeHasChildren(NodeId),

    #[error("node {0} is referenced by prohibition `{1}`")]
    NodeReferenced(NodeId, String),

    #[error("association {ua} -> {target} does not exist")]
    AssociationNotFound { ua: NodeId, target: NodeId },

    #[error("{kind} `{name}` already exists")]
    Exists { kind: &'static str, name: String },

    #[error("{kind} `{name}` does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("no transaction is open")]
    NoTransaction,

    #[error("a transaction is already open")]
    TransactionActive,

    #[error("`{0}` is not available inside an adjudication")]
    TransactionControlDenied(&'static str),

    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Transactional mutation and query surface of the access-control graph.
///
/// Every mutation maps one-to-one onto a replicated event kind, which is
/// what lets a replica reproduce the writer's state by replay alone.
pub trait PolicyStore: Send {
    fn create_node(&mut self, node: Node) -> Result<(), StoreError>;
    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError>;
    fn create_assignment(&mut self, child: NodeId, parent: NodeId) -> Result<(), StoreError>;
    fn delete_assignment(&mut self, child: NodeId, parent: NodeId) -> Result<(), StoreError>;
    fn create_association(&mut self, association: Association) -> Result<(), StoreError>;
    fn delete_association(&mut self, ua: NodeId, target: NodeId) -> Result<(), StoreError>;
    fn create_prohibition(&mut self, prohibition: Prohibition) -> Result<(), StoreError>;
    fn delete_prohibition(&mut self, name: &str) -> Result<(), StoreError>;
    fn create_obligation(&mut self, obligation: Obligation) -> Result<(), StoreError>;
    fn delete_obligation(&mut self, name: &str) -> Result<(), StoreError>;
    fn create_operation(&mut self, operation: OperationDef) -> Result<(), StoreError>;
    fn delete_operation(&mut self, name: &str) -> Result<(), StoreError>;
    fn set_resource_access_rights(&mut self, rights: AccessRightSet) -> Result<(), StoreError>;

    fn node(&self, id: NodeId) -> Option<Node>;
    fn node_by_name(&self, name: &str) -> Option<Node>;
    fn parents(&self, id: NodeId) -> Vec<NodeId>;
    fn children(&self, id: NodeId) -> Vec<NodeId>;
    fn associations(&self) -> Vec<Association>;
    fn prohibitions(&self) -> Vec<Prohibition>;
    fn obligations(&self) -> Vec<Obligation>;
    fn operation(&self, name: &str) -> Option<OperationDef>;
    fn resource_access_rights(&self) -> AccessRightSet;
    fn is_empty(&self) -> bool;

    /// Id the next created node should take. Deterministic so that replay
    /// allocates nothing on its own.
    fn next_node_id(&self) -> NodeId;

    fn begin_tx(&mut self) -> Result<(), StoreError>;
    fn commit_tx(&mut self) -> Result<(), StoreError>;
    fn rollback_tx(&mut self) -> Result<(), StoreError>;

    /// Serialize the full store state.
    fn to_snapshot(&self) -> Result<Vec<u8>, StoreError>;

    /// Replace the full store state with a previously serialized one.
    fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    fn node_named(&self, name: &str) -> Result<Node, StoreError> {
        self.node_by_name(name)
            .ok_or_else(|| StoreError::NodeNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_rules_follow_node_kinds() {
        use NodeKind::*;

        assert!(User.can_assign_to(UserAttribute));
        assert!(UserAttribute.can_assign_to(PolicyClass));
        assert!(ObjectAttribute.can_assign_to(ObjectAttribute));
        assert!(!User.can_assign_to(ObjectAttribute));
        assert!(!Object.can_assign_to(PolicyClass));
        assert!(!PolicyClass.can_assign_to(PolicyClass));
    }
}
