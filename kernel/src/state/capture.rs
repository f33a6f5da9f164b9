// Event-Capturing Store
//
// Wraps a policy store so every successful mutation is also recorded as
// the event that replays it.

use crate::log::PolicyEvent;

use super::{
    AccessRightSet, Association, Node, NodeId, Obligation, OperationDef, PolicyStore, Prohibition,
    StoreError,
};

pub struct CapturingStore<'a> {
    inner: &'a mut dyn PolicyStore,
    events: Vec<PolicyEvent>,
}

impl<'a> CapturingStore<'a> {
    pub fn new(inner: &'a mut dyn PolicyStore) -> Self {
        Self {
            inner,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[PolicyEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<PolicyEvent> {
        self.events
    }

    fn record(&mut self, result: Result<(), StoreError>, event: PolicyEvent) -> Result<(), StoreError> {
        result?;
        self.events.push(event);
        Ok(())
    }
}

impl PolicyStore for CapturingStore<'_> {
    fn create_node(&mut self, node: Node) -> Result<(), StoreError> {
        let event = PolicyEvent::NodeCreated {
            id: node.id,
            name: node.name.clone(),
            kind: node.kind,
        };
        let result = self.inner.create_node(node);
        self.record(result, event)
    }

    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError> {
        let result = self.inner.delete_node(id);
        self.record(result, PolicyEvent::NodeDeleted { id })
    }

    fn create_assignment(&mut self, child: NodeId, parent: NodeId) -> Result<(), StoreError> {
        let result = self.inner.create_assignment(child, parent);
        self.record(result, PolicyEvent::AssignmentCreated { child, parent })
    }

    fn delete_assignment(&mut self, child: NodeId, parent: NodeId) -> Result<(), StoreError> {
        let result = self.inner.delete_assignment(child, parent);
        self.record(result, PolicyEvent::AssignmentDeleted { child, parent })
    }

    fn create_association(&mut self, association: Association) -> Result<(), StoreError> {
        let event = PolicyEvent::AssociationCreated {
            ua: association.ua,
            target: association.target,
            rights: association.rights.clone(),
        };
        let result = self.inner.create_association(association);
        self.record(result, event)
    }

    fn delete_association(&mut self, ua: NodeId, target: NodeId) -> Result<(), StoreError> {
        let result = self.inner.delete_association(ua, target);
        self.record(result, PolicyEvent::AssociationDeleted { ua, target })
    }

    fn create_prohibition(&mut self, prohibition: Prohibition) -> Result<(), StoreError> {
        let event = PolicyEvent::ProhibitionCreated(prohibition.clone());
        let result = self.inner.create_prohibition(prohibition);
        self.record(result, event)
    }

    fn delete_prohibition(&mut self, name: &str) -> Result<(), StoreError> {
        let result = self.inner.delete_prohibition(name);
        self.record(
            result,
            PolicyEvent::ProhibitionDeleted {
                name: name.to_string(),
            },
        )
    }

    fn create_obligation(&mut self, obligation: Obligation) -> Result<(), StoreError> {
        let event = PolicyEvent::ObligationCreated {
            name: obligation.name.clone(),
            author: obligation.author,
            rules: obligation.rules.clone(),
        };
        let result = self.inner.create_obligation(obligation);
        self.record(result, event)
    }

    fn delete_obligation(&mut self, name: &str) -> Result<(), StoreError> {
        let result = self.inner.delete_obligation(name);
        self.record(
            result,
            PolicyEvent::ObligationDeleted {
                name: name.to_string(),
            },
        )
    }

    fn create_operation(&mut self, operation: OperationDef) -> Result<(), StoreError> {
        let event = PolicyEvent::OperationCreated {
            name: operation.name.clone(),
            definition: operation.definition.clone(),
        };
        let result = self.inner.create_operation(operation);
        self.record(result, event)
    }

    fn delete_operation(&mut self, name: &str) -> Result<(), StoreError> {
        let result = self.inner.delete_operation(name);
        self.record(
            result,
            PolicyEvent::OperationDeleted {
                name: name.to_string(),
            },
        )
    }

    fn set_resource_access_rights(&mut self, rights: AccessRightSet) -> Result<(), StoreError> {
        let event = PolicyEvent::ResourceAccessRightsSet {
            rights: rights.clone(),
        };
        let result = self.inner.set_resource_access_rights(rights);
        self.record(result, event)
    }

    fn node(&self, id: NodeId) -> Option<Node> {
        self.inner.node(id)
    }

    fn node_by_name(&self, name: &str) -> Option<Node> {
        self.inner.node_by_name(name)
    }

    fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.inner.parents(id)
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.inner.children(id)
    }

    fn associations(&self) -> Vec<Association> {
        self.inner.associations()
    }

    fn prohibitions(&self) -> Vec<Prohibition> {
        self.inner.prohibitions()
    }

    fn obligations(&self) -> Vec<Obligation> {
        self.inner.obligations()
    }

    fn operation(&self, name: &str) -> Option<OperationDef> {
        self.inner.operation(name)
    }

    fn resource_access_rights(&self) -> AccessRightSet {
        self.inner.resource_access_rights()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn next_node_id(&self) -> NodeId {
        self.inner.next_node_id()
    }

    // Transaction control stays with the writer that opened the capture.
    fn begin_tx(&mut self) -> Result<(), StoreError> {
        Err(StoreError::TransactionControlDenied("begin_tx"))
    }

    fn commit_tx(&mut self) -> Result<(), StoreError> {
        Err(StoreError::TransactionControlDenied("commit_tx"))
    }

    fn rollback_tx(&mut self) -> Result<(), StoreError> {
        Err(StoreError::TransactionControlDenied("rollback_tx"))
    }

    fn to_snapshot(&self) -> Result<Vec<u8>, StoreError> {
        self.inner.to_snapshot()
    }

    /// Replacing the whole policy has no event, so it cannot be captured.
    fn restore_snapshot(&mut self, _bytes: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::TransactionControlDenied("restore_snapshot"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryPolicyStore, NodeKind};

    #[test]
    fn records_only_successful_mutations() {
        let mut store = MemoryPolicyStore::new();
        let mut capture = CapturingStore::new(&mut store);

        capture
            .create_node(Node {
                id: NodeId(1),
                name: "pc1".into(),
                kind: NodeKind::PolicyClass,
            })
            .unwrap();
        assert!(capture.delete_node(NodeId(7)).is_err());

        let events = capture.into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "NodeCreated");
        assert!(store.node_by_name("pc1").is_some());
    }

    #[test]
    fn refuses_transaction_control_and_restore() {
        let mut store = MemoryPolicyStore::new();
        let bytes = store.to_snapshot().unwrap();
        store.begin_tx().unwrap();

        let mut capture = CapturingStore::new(&mut store);
        assert!(matches!(
            capture.commit_tx(),
            Err(StoreError::TransactionControlDenied("commit_tx"))
        ));
        assert!(capture.rollback_tx().is_err());
        assert!(capture.begin_tx().is_err());
        assert!(capture.restore_snapshot(&bytes).is_err());
        assert!(capture.into_events().is_empty());

        // The outer transaction is still open for its owner.
        store.rollback_tx().unwrap();
    }
}
