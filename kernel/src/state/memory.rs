// In-Memory Policy Store
//
// Reference PolicyStore backed by ordered maps. Ordered containers make two
// stores built by different paths (replay vs. snapshot + replay) compare
// equal structurally.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{
    AccessRightSet, Association, Node, NodeId, Obligation, OperationDef, PolicyStore, Prohibition,
    StoreError,
};

/// Full state of the access-control graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyGraph {
    nodes: BTreeMap<NodeId, Node>,
    names: BTreeMap<String, NodeId>,
    parents: BTreeMap<NodeId, BTreeSet<NodeId>>,
    associations: BTreeMap<NodeId, BTreeMap<NodeId, AccessRightSet>>,
    prohibitions: BTreeMap<String, Prohibition>,
    obligations: BTreeMap<String, Obligation>,
    operations: BTreeMap<String, OperationDef>,
    resource_access_rights: AccessRightSet,
    next_id: u64,
}

impl PolicyGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn require(&self, id: NodeId) -> Result<&Node, StoreError> {
        self.nodes.get(&id).ok_or(StoreError::NodeIdNotFound(id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    graph: PolicyGraph,
    savepoint: Option<PolicyGraph>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &PolicyGraph {
        &self.graph
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn create_node(&mut self, node: Node) -> Result<(), StoreError> {
        if self.graph.names.contains_key(&node.name) {
            return Err(StoreError::NodeExists(node.name));
        }
        if self.graph.nodes.contains_key(&node.id) {
            return Err(StoreError::NodeIdInUse(node.id));
        }

        self.graph.next_id = self.graph.next_id.max(node.id.0 + 1);
        self.graph.names.insert(node.name.clone(), node.id);
        self.graph.nodes.insert(node.id, node);
        Ok(())
    }

    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError> {
        let name = self.graph.require(id)?.name.clone();

        if !self.children(id).is_empty() {
            return Err(StoreError::NodeHasChildren(id));
        }
        if let Some(prohibition) = self.graph.prohibitions.values().find(|p| {
            p.subject == id || p.containers.iter().any(|c| c.container == id)
        }) {
            return Err(StoreError::NodeReferenced(id, prohibition.name.clone()));
        }

        self.graph.parents.remove(&id);
        self.graph.associations.remove(&id);
        for targets in self.graph.associations.values_mut() {
            targets.remove(&id);
        }
        self.graph.associations.retain(|_, targets| !targets.is_empty());
        self.graph.names.remove(&name);
        self.graph.nodes.remove(&id);
        Ok(())
    }

    fn create_assignment(&mut self, child: NodeId, parent: NodeId) -> Result<(), StoreError> {
        let child_kind = self.graph.require(child)?.kind;
        let parent_kind = self.graph.require(parent)?.kind;
        if !child_kind.can_assign_to(parent_kind) {
            return Err(StoreError::InvalidAssignment {
                child: child_kind,
                parent: parent_kind,
            });
        }

        if !self.graph.parents.entry(child).or_default().insert(parent) {
            return Err(StoreError::AssignmentExists { child, parent });
        }
        Ok(())
    }

    fn delete_assignment(&mut self, child: NodeId, parent: NodeId) -> Result<(), StoreError> {
        let removed = self
            .graph
            .parents
            .get_mut(&child)
            .map(|parents| parents.remove(&parent))
            .unwrap_or(false);
        if !removed {
            return Err(StoreError::AssignmentNotFound { child, parent });
        }
        if self.graph.parents.get(&child).is_some_and(BTreeSet::is_empty) {
            self.graph.parents.remove(&child);
        }
        Ok(())
    }

    fn create_association(&mut self, association: Association) -> Result<(), StoreError> {
        self.graph.require(association.ua)?;
        self.graph.require(association.target)?;

        // Re-associating replaces the granted rights.
        self.graph
            .associations
            .entry(association.ua)
            .or_default()
            .insert(association.target, association.rights);
        Ok(())
    }

    fn delete_association(&mut self, ua: NodeId, target: NodeId) -> Result<(), StoreError> {
        let removed = self
            .graph
            .associations
            .get_mut(&ua)
            .and_then(|targets| targets.remove(&target))
            .is_some();
        if !removed {
            return Err(StoreError::AssociationNotFound { ua, target });
        }
        self.graph.associations.retain(|_, targets| !targets.is_empty());
        Ok(())
    }

    fn create_prohibition(&mut self, prohibition: Prohibition) -> Result<(), StoreError> {
        self.graph.require(prohibition.subject)?;
        for condition in &prohibition.containers {
            self.graph.require(condition.container)?;
        }
        if self.graph.prohibitions.contains_key(&prohibition.name) {
            return Err(StoreError::Exists {
                kind: "prohibition",
                name: prohibition.name,
            });
        }
        self.graph
            .prohibitions
            .insert(prohibition.name.clone(), prohibition);
        Ok(())
    }

    fn delete_prohibition(&mut self, name: &str) -> Result<(), StoreError> {
        self.graph
            .prohibitions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "prohibition",
                name: name.to_string(),
            })
    }

    fn create_obligation(&mut self, obligation: Obligation) -> Result<(), StoreError> {
        self.graph.require(obligation.author)?;
        if self.graph.obligations.contains_key(&obligation.name) {
            return Err(StoreError::Exists {
                kind: "obligation",
                name: obligation.name,
            });
        }
        self.graph
            .obligations
            .insert(obligation.name.clone(), obligation);
        Ok(())
    }

    fn delete_obligation(&mut self, name: &str) -> Result<(), StoreError> {
        self.graph
            .obligations
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "obligation",
                name: name.to_string(),
            })
    }

    fn create_operation(&mut self, operation: OperationDef) -> Result<(), StoreError> {
        if self.graph.operations.contains_key(&operation.name) {
            return Err(StoreError::Exists {
                kind: "operation",
                name: operation.name,
            });
        }
        self.graph
            .operations
            .insert(operation.name.clone(), operation);
        Ok(())
    }

    fn delete_operation(&mut self, name: &str) -> Result<(), StoreError> {
        self.graph
            .operations
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "operation",
                name: name.to_string(),
            })
    }

    fn set_resource_access_rights(&mut self, rights: AccessRightSet) -> Result<(), StoreError> {
        self.graph.resource_access_rights = rights;
        Ok(())
    }

    fn node(&self, id: NodeId) -> Option<Node> {
        self.graph.nodes.get(&id).cloned()
    }

    fn node_by_name(&self, name: &str) -> Option<Node> {
        self.graph
            .names
            .get(name)
            .and_then(|id| self.graph.nodes.get(id))
            .cloned()
    }

    fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.graph
            .parents
            .get(&id)
            .map(|parents| parents.iter().copied().collect())
            .unwrap_or_default()
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.graph
            .parents
            .iter()
            .filter(|(_, parents)| parents.contains(&id))
            .map(|(child, _)| *child)
            .collect()
    }

    fn associations(&self) -> Vec<Association> {
        self.graph
            .associations
            .iter()
            .flat_map(|(ua, targets)| {
                targets.iter().map(move |(target, rights)| Association {
                    ua: *ua,
                    target: *target,
                    rights: rights.clone(),
                })
            })
            .collect()
    }

    fn prohibitions(&self) -> Vec<Prohibition> {
        self.graph.prohibitions.values().cloned().collect()
    }

    fn obligations(&self) -> Vec<Obligation> {
        self.graph.obligations.values().cloned().collect()
    }

    fn operation(&self, name: &str) -> Option<OperationDef> {
        self.graph.operations.get(name).cloned()
    }

    fn resource_access_rights(&self) -> AccessRightSet {
        self.graph.resource_access_rights.clone()
    }

    fn is_empty(&self) -> bool {
        self.graph.nodes.is_empty()
    }

    fn next_node_id(&self) -> NodeId {
        NodeId(self.graph.next_id.max(1))
    }

    fn begin_tx(&mut self) -> Result<(), StoreError> {
        if self.savepoint.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.savepoint = Some(self.graph.clone());
        Ok(())
    }

    fn commit_tx(&mut self) -> Result<(), StoreError> {
        self.savepoint
            .take()
            .map(|_| ())
            .ok_or(StoreError::NoTransaction)
    }

    fn rollback_tx(&mut self) -> Result<(), StoreError> {
        let savepoint = self.savepoint.take().ok_or(StoreError::NoTransaction)?;
        self.graph = savepoint;
        Ok(())
    }

    fn to_snapshot(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(&self.graph)?)
    }

    fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.graph = serde_json::from_slice(bytes)?;
        self.savepoint = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeKind;

    fn node(id: u64, name: &str, kind: NodeKind) -> Node {
        Node {
            id: NodeId(id),
            name: name.into(),
            kind,
        }
    }

    fn small_store() -> MemoryPolicyStore {
        let mut store = MemoryPolicyStore::new();
        store.create_node(node(1, "pc1", NodeKind::PolicyClass)).unwrap();
        store.create_node(node(2, "oa1", NodeKind::ObjectAttribute)).unwrap();
        store.create_node(node(3, "o1", NodeKind::Object)).unwrap();
        store.create_assignment(NodeId(2), NodeId(1)).unwrap();
        store
    }

    #[test]
    fn next_id_follows_highest_created_id() {
        let store = small_store();
        assert_eq!(store.next_node_id(), NodeId(4));
        assert_eq!(MemoryPolicyStore::new().next_node_id(), NodeId(1));
    }

    #[test]
    fn rejects_duplicate_names_and_bad_assignments() {
        let mut store = small_store();

        let err = store.create_node(node(9, "oa1", NodeKind::ObjectAttribute));
        assert!(matches!(err, Err(StoreError::NodeExists(_))));

        let err = store.create_assignment(NodeId(3), NodeId(1));
        assert!(matches!(err, Err(StoreError::InvalidAssignment { .. })));
    }

    #[test]
    fn delete_refuses_nodes_with_children() {
        let mut store = small_store();
        store.create_assignment(NodeId(3), NodeId(2)).unwrap();

        assert!(matches!(
            store.delete_node(NodeId(2)),
            Err(StoreError::NodeHasChildren(_))
        ));

        store.delete_assignment(NodeId(3), NodeId(2)).unwrap();
        store.delete_node(NodeId(3)).unwrap();
        assert!(store.node_by_name("o1").is_none());
    }

    #[test]
    fn rollback_restores_state_from_before_the_transaction() {
        let mut store = small_store();
        let before = store.graph().clone();

        store.begin_tx().unwrap();
        store.create_node(node(4, "o2", NodeKind::Object)).unwrap();
        store.create_assignment(NodeId(4), NodeId(2)).unwrap();
        assert_eq!(store.next_node_id(), NodeId(5));
        store.rollback_tx().unwrap();

        assert_eq!(store.graph(), &before);
        assert!(matches!(store.rollback_tx(), Err(StoreError::NoTransaction)));
    }

    #[test]
    fn snapshot_restores_identical_graph() {
        let store = small_store();
        let bytes = store.to_snapshot().unwrap();

        let mut restored = MemoryPolicyStore::new();
        restored.restore_snapshot(&bytes).unwrap();

        assert_eq!(restored.graph(), store.graph());
    }
}
