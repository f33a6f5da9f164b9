// Policy Decision Point
//
// Computes a user's privileges on a target from associations and
// prohibitions, and turns missing privileges into policy errors.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::state::bootstrap::BootstrapError;
use crate::state::{AccessRightSet, NodeId, PolicyStore, Prohibition, StoreError};

pub mod operation;

pub use operation::{
    Args, Builtin, Operation, OperationCall, OperationHandle, OperationRegistry, OperationScope,
};

/// Grants every known right.
pub const ALL_ACCESS_RIGHTS: &str = "*";

pub mod rights {
    pub const CREATE_POLICY_CLASS: &str = "create_policy_class";
    pub const CREATE_NODE: &str = "create_node";
    pub const DELETE_NODE: &str = "delete_node";
    pub const ASSIGN: &str = "assign";
    pub const ASSIGN_TO: &str = "assign_to";
    pub const DEASSIGN: &str = "deassign";
    pub const DEASSIGN_FROM: &str = "deassign_from";
    pub const ASSOCIATE: &str = "associate";
    pub const ASSOCIATE_TO: &str = "associate_to";
    pub const DISSOCIATE: &str = "dissociate";
    pub const DISSOCIATE_FROM: &str = "dissociate_from";
    pub const CREATE_PROHIBITION: &str = "create_prohibition";
    pub const DELETE_PROHIBITION: &str = "delete_prohibition";
    pub const CREATE_OBLIGATION: &str = "create_obligation";
    pub const DELETE_OBLIGATION: &str = "delete_obligation";
    pub const CREATE_OPERATION: &str = "create_operation";
    pub const DELETE_OPERATION: &str = "delete_operation";
    pub const SET_RESOURCE_ACCESS_RIGHTS: &str = "set_resource_access_rights";

    pub const ADMIN_RIGHTS: &[&str] = &[
        CREATE_POLICY_CLASS,
        CREATE_NODE,
        DELETE_NODE,
        ASSIGN,
        ASSIGN_TO,
        DEASSIGN,
        DEASSIGN_FROM,
        ASSOCIATE,
        ASSOCIATE_TO,
        DISSOCIATE,
        DISSOCIATE_FROM,
        CREATE_PROHIBITION,
        DELETE_PROHIBITION,
        CREATE_OBLIGATION,
        DELETE_OBLIGATION,
        CREATE_OPERATION,
        DELETE_OPERATION,
        SET_RESOURCE_ACCESS_RIGHTS,
    ];
}

/// Caller identity, passed explicitly into every adjudication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user: String,
    #[serde(default)]
    pub process: Option<String>,
}

impl UserContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            process: None,
        }
    }
}

/// Adjudication failures: a denial or a malformed request.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("user `{user}` is missing {missing:?} on `{target}`")]
    Unauthorized {
        user: String,
        target: String,
        missing: AccessRightSet,
    },

    #[error("unknown user `{0}`")]
    UnknownUser(String),

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    #[error("operation `{0}` is already registered")]
    DuplicateOperation(String),

    #[error("unknown access right `{0}`")]
    UnknownAccessRight(String),

    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("invalid obligation rules: {0}")]
    InvalidObligation(String),

    #[error("operation `{name}` failed: {reason}")]
    OperationFailed { name: String, reason: String },

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PolicyError {
    pub fn is_denial(&self) -> bool {
        matches!(self, PolicyError::Unauthorized { .. })
    }

    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        PolicyError::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Every right that can be granted in this policy.
pub fn known_rights(store: &dyn PolicyStore) -> AccessRightSet {
    let mut all = store.resource_access_rights();
    all.extend(rights::ADMIN_RIGHTS.iter().map(|r| r.to_string()));
    all
}

/// `id` plus every node reachable from it through assignments.
pub fn ancestors(store: &dyn PolicyStore, id: NodeId) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::from([id]);
    let mut frontier = vec![id];
    while let Some(next) = frontier.pop() {
        for parent in store.parents(next) {
            if seen.insert(parent) {
                frontier.push(parent);
            }
        }
    }
    seen
}

/// Rights `user` holds on `target`.
pub fn privileges(store: &dyn PolicyStore, user: NodeId, target: NodeId) -> AccessRightSet {
    let user_scope = ancestors(store, user);
    let target_scope = ancestors(store, target);

    let mut granted = AccessRightSet::new();
    for association in store.associations() {
        if user_scope.contains(&association.ua) && target_scope.contains(&association.target) {
            granted.extend(association.rights);
        }
    }
    if granted.remove(ALL_ACCESS_RIGHTS) {
        granted.extend(known_rights(store));
    }

    for prohibition in store.prohibitions() {
        if !user_scope.contains(&prohibition.subject) || !denies(&prohibition, &target_scope) {
            continue;
        }
        if prohibition.rights.contains(ALL_ACCESS_RIGHTS) {
            granted.clear();
        } else {
            granted.retain(|right| !prohibition.rights.contains(right));
        }
    }

    granted
}

fn denies(prohibition: &Prohibition, target_scope: &BTreeSet<NodeId>) -> bool {
    let mut hits = prohibition
        .containers
        .iter()
        .map(|c| target_scope.contains(&c.container) != c.complement);
    if prohibition.intersection {
        hits.all(|hit| hit)
    } else {
        hits.any(|hit| hit)
    }
}

/// Require `required` rights for `user` on the node named `target`.
pub fn check(
    store: &dyn PolicyStore,
    user: &UserContext,
    target: &str,
    required: &[&str],
) -> Result<(), PolicyError> {
    let user_node = store
        .node_by_name(&user.user)
        .ok_or_else(|| PolicyError::UnknownUser(user.user.clone()))?;
    let target_node = store.node_named(target)?;

    let granted = privileges(store, user_node.id, target_node.id);
    let missing: AccessRightSet = required
        .iter()
        .filter(|right| !granted.contains(**right))
        .map(|right| right.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PolicyError::Unauthorized {
            user: user.user.clone(),
            target: target.to_string(),
            missing,
        })
    }
}
