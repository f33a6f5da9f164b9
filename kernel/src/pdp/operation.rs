// Administrative Operations
//
// Operations are resolved by name at call time: builtins first, then
// operations registered by the embedding process, then operations defined
// inside the policy itself. Each runs inside an explicit `OperationScope`
// that carries the caller and the (transactional) store.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{known_rights, rights, PolicyError, UserContext, ALL_ACCESS_RIGHTS};
use crate::epp;
use crate::state::bootstrap::ADMIN_BASE;
use crate::state::{
    AccessRightSet, Association, ContainerCondition, Node, NodeKind, Obligation, OperationDef,
    PolicyStore, Prohibition,
};

pub type Args = serde_json::Map<String, Value>;

/// Nested operation calls allowed before a routine is rejected.
const MAX_CALL_DEPTH: usize = 16;

/// A named invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    pub name: String,
    #[serde(default)]
    pub args: Args,
}

impl OperationCall {
    /// Build a call from a JSON object; non-object `args` become empty.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Args::new(),
        };
        Self {
            name: name.into(),
            args,
        }
    }
}

/// An administrative operation.
///
/// `check` must only read; `execute` mutates through the scope's store.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, scope: &OperationScope<'_>, args: &Args) -> Result<(), PolicyError>;

    fn execute(&self, scope: &mut OperationScope<'_>, args: &Args) -> Result<Value, PolicyError>;
}

/// Call scope of one adjudication: who is calling, against which store.
pub struct OperationScope<'a> {
    user: &'a UserContext,
    store: &'a mut dyn PolicyStore,
    registry: &'a OperationRegistry,
    depth: usize,
}

impl<'a> OperationScope<'a> {
    pub fn new(
        user: &'a UserContext,
        store: &'a mut dyn PolicyStore,
        registry: &'a OperationRegistry,
    ) -> Self {
        Self {
            user,
            store,
            registry,
            depth: 0,
        }
    }

    pub fn user(&self) -> &UserContext {
        self.user
    }

    pub fn store(&self) -> &dyn PolicyStore {
        &*self.store
    }

    pub fn store_mut(&mut self) -> &mut dyn PolicyStore {
        &mut *self.store
    }

    pub fn require(&self, target: &str, required: &[&str]) -> Result<(), PolicyError> {
        super::check(self.store(), self.user, target, required)
    }

    /// Resolve, check and execute one call.
    pub fn invoke(&mut self, call: &OperationCall) -> Result<Value, PolicyError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(PolicyError::OperationFailed {
                name: call.name.clone(),
                reason: format!("call depth exceeds {MAX_CALL_DEPTH}"),
            });
        }

        let registry = self.registry;
        let handle = registry.resolve(&call.name, self.store())?;

        self.depth += 1;
        let result = handle.run(self, &call.args);
        self.depth -= 1;
        result
    }
}

/// A resolved operation.
pub enum OperationHandle {
    Builtin(Builtin),
    /// Registered by the embedding process; runs sandboxed.
    External(Arc<dyn Operation>),
    /// Stored in the policy as a routine of calls.
    Defined(DefinedOperation),
}

impl OperationHandle {
    fn run(&self, scope: &mut OperationScope<'_>, args: &Args) -> Result<Value, PolicyError> {
        match self {
            OperationHandle::Builtin(op) => {
                op.check(scope, args)?;
                op.execute(scope, args)
            }
            OperationHandle::Defined(op) => op.run(scope),
            OperationHandle::External(op) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    op.check(scope, args)?;
                    op.execute(scope, args)
                }));
                outcome.unwrap_or_else(|_| {
                    Err(PolicyError::OperationFailed {
                        name: op.name().to_string(),
                        reason: "operation panicked".into(),
                    })
                })
            }
        }
    }
}

/// Serialized body of a policy-defined operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineDefinition {
    pub steps: Vec<OperationCall>,
}

pub struct DefinedOperation {
    name: String,
    steps: Vec<OperationCall>,
}

impl DefinedOperation {
    pub fn parse(def: &OperationDef) -> Result<Self, PolicyError> {
        let routine: RoutineDefinition =
            serde_json::from_str(&def.definition).map_err(|err| PolicyError::OperationFailed {
                name: def.name.clone(),
                reason: format!("malformed definition: {err}"),
            })?;
        Ok(Self {
            name: def.name.clone(),
            steps: routine.steps,
        })
    }

    fn run(&self, scope: &mut OperationScope<'_>) -> Result<Value, PolicyError> {
        tracing::debug!("running defined operation {}", self.name);
        let mut last = Value::Null;
        for step in &self.steps {
            last = scope.invoke(step)?;
        }
        Ok(last)
    }
}

/// Resolves operation names for a process.
#[derive(Default)]
pub struct OperationRegistry {
    external: BTreeMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: Arc<dyn Operation>) -> Result<(), PolicyError> {
        let name = op.name().to_string();
        if self.is_reserved(&name) {
            return Err(PolicyError::DuplicateOperation(name));
        }
        self.external.insert(name, op);
        Ok(())
    }

    /// Whether `name` is taken by a builtin or a registered operation.
    pub fn is_reserved(&self, name: &str) -> bool {
        Builtin::from_name(name).is_some() || self.external.contains_key(name)
    }

    pub fn resolve(
        &self,
        name: &str,
        store: &dyn PolicyStore,
    ) -> Result<OperationHandle, PolicyError> {
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(OperationHandle::Builtin(builtin));
        }
        if let Some(op) = self.external.get(name) {
            return Ok(OperationHandle::External(Arc::clone(op)));
        }
        match store.operation(name) {
            Some(def) => DefinedOperation::parse(&def).map(OperationHandle::Defined),
            None => Err(PolicyError::UnknownOperation(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    CreatePolicyClass,
    CreateUserAttribute,
    CreateObjectAttribute,
    CreateUser,
    CreateObject,
    DeleteNode,
    Assign,
    Deassign,
    Associate,
    Dissociate,
    CreateProhibition,
    DeleteProhibition,
    CreateObligation,
    DeleteObligation,
    CreateOperation,
    DeleteOperation,
    SetResourceAccessRights,
}

impl Builtin {
    pub const ALL: [Builtin; 17] = [
        Builtin::CreatePolicyClass,
        Builtin::CreateUserAttribute,
        Builtin::CreateObjectAttribute,
        Builtin::CreateUser,
        Builtin::CreateObject,
        Builtin::DeleteNode,
        Builtin::Assign,
        Builtin::Deassign,
        Builtin::Associate,
        Builtin::Dissociate,
        Builtin::CreateProhibition,
        Builtin::DeleteProhibition,
        Builtin::CreateObligation,
        Builtin::DeleteObligation,
        Builtin::CreateOperation,
        Builtin::DeleteOperation,
        Builtin::SetResourceAccessRights,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.op_name() == name)
    }

    pub fn op_name(self) -> &'static str {
        match self {
            Builtin::CreatePolicyClass => "create_policy_class",
            Builtin::CreateUserAttribute => "create_user_attribute",
            Builtin::CreateObjectAttribute => "create_object_attribute",
            Builtin::CreateUser => "create_user",
            Builtin::CreateObject => "create_object",
            Builtin::DeleteNode => "delete_node",
            Builtin::Assign => "assign",
            Builtin::Deassign => "deassign",
            Builtin::Associate => "associate",
            Builtin::Dissociate => "dissociate",
            Builtin::CreateProhibition => "create_prohibition",
            Builtin::DeleteProhibition => "delete_prohibition",
            Builtin::CreateObligation => "create_obligation",
            Builtin::DeleteObligation => "delete_obligation",
            Builtin::CreateOperation => "create_operation",
            Builtin::DeleteOperation => "delete_operation",
            Builtin::SetResourceAccessRights => "set_resource_access_rights",
        }
    }
}

impl Operation for Builtin {
    fn name(&self) -> &str {
        self.op_name()
    }

    fn check(&self, scope: &OperationScope<'_>, args: &Args) -> Result<(), PolicyError> {
        use Builtin::*;

        match self {
            CreatePolicyClass => scope.require(ADMIN_BASE, &[rights::CREATE_POLICY_CLASS]),
            CreateUserAttribute | CreateObjectAttribute | CreateUser | CreateObject => {
                let parents = list_arg(args, "parents")?;
                if parents.is_empty() {
                    return Err(PolicyError::invalid("parents", "at least one parent is required"));
                }
                for parent in &parents {
                    scope.require(parent, &[rights::CREATE_NODE])?;
                }
                Ok(())
            }
            DeleteNode => scope.require(str_arg(args, "name")?, &[rights::DELETE_NODE]),
            Assign | Deassign => {
                let (on_child, on_parent) = if *self == Assign {
                    (rights::ASSIGN, rights::ASSIGN_TO)
                } else {
                    (rights::DEASSIGN, rights::DEASSIGN_FROM)
                };
                scope.require(str_arg(args, "child")?, &[on_child])?;
                for parent in list_arg(args, "parents")? {
                    scope.require(&parent, &[on_parent])?;
                }
                Ok(())
            }
            Associate => {
                scope.require(str_arg(args, "ua")?, &[rights::ASSOCIATE])?;
                scope.require(str_arg(args, "target")?, &[rights::ASSOCIATE_TO])
            }
            Dissociate => {
                scope.require(str_arg(args, "ua")?, &[rights::DISSOCIATE])?;
                scope.require(str_arg(args, "target")?, &[rights::DISSOCIATE_FROM])
            }
            CreateProhibition => scope.require(ADMIN_BASE, &[rights::CREATE_PROHIBITION]),
            DeleteProhibition => scope.require(ADMIN_BASE, &[rights::DELETE_PROHIBITION]),
            CreateObligation => scope.require(ADMIN_BASE, &[rights::CREATE_OBLIGATION]),
            DeleteObligation => scope.require(ADMIN_BASE, &[rights::DELETE_OBLIGATION]),
            CreateOperation => scope.require(ADMIN_BASE, &[rights::CREATE_OPERATION]),
            DeleteOperation => scope.require(ADMIN_BASE, &[rights::DELETE_OPERATION]),
            SetResourceAccessRights => {
                scope.require(ADMIN_BASE, &[rights::SET_RESOURCE_ACCESS_RIGHTS])
            }
        }
    }

    fn execute(&self, scope: &mut OperationScope<'_>, args: &Args) -> Result<Value, PolicyError> {
        use Builtin::*;

        match self {
            CreatePolicyClass => return create_node(scope, args, NodeKind::PolicyClass),
            CreateUserAttribute => return create_node(scope, args, NodeKind::UserAttribute),
            CreateObjectAttribute => return create_node(scope, args, NodeKind::ObjectAttribute),
            CreateUser => return create_node(scope, args, NodeKind::User),
            CreateObject => return create_node(scope, args, NodeKind::Object),
            DeleteNode => {
                let node = scope.store().node_named(str_arg(args, "name")?)?;
                scope.store_mut().delete_node(node.id)?;
            }
            Assign | Deassign => {
                let child = scope.store().node_named(str_arg(args, "child")?)?.id;
                for parent in list_arg(args, "parents")? {
                    let parent = scope.store().node_named(&parent)?.id;
                    if *self == Assign {
                        scope.store_mut().create_assignment(child, parent)?;
                    } else {
                        scope.store_mut().delete_assignment(child, parent)?;
                    }
                }
            }
            Associate => {
                let ua = scope.store().node_named(str_arg(args, "ua")?)?.id;
                let target = scope.store().node_named(str_arg(args, "target")?)?.id;
                let rights = rights_arg(scope.store(), args, "rights")?;
                scope
                    .store_mut()
                    .create_association(Association { ua, target, rights })?;
            }
            Dissociate => {
                let ua = scope.store().node_named(str_arg(args, "ua")?)?.id;
                let target = scope.store().node_named(str_arg(args, "target")?)?.id;
                scope.store_mut().delete_association(ua, target)?;
            }
            CreateProhibition => {
                let prohibition = prohibition_arg(scope.store(), args)?;
                scope.store_mut().create_prohibition(prohibition)?;
            }
            DeleteProhibition => scope.store_mut().delete_prohibition(str_arg(args, "name")?)?,
            CreateObligation => {
                let rules = args
                    .get("rules")
                    .ok_or_else(|| PolicyError::invalid("rules", "missing"))?;
                epp::parse_rules_value(rules)?;
                let author = scope
                    .store()
                    .node_by_name(&scope.user().user)
                    .ok_or_else(|| PolicyError::UnknownUser(scope.user().user.clone()))?;
                let obligation = Obligation {
                    name: str_arg(args, "name")?.to_string(),
                    author: author.id,
                    rules: rules.to_string(),
                };
                scope.store_mut().create_obligation(obligation)?;
            }
            DeleteObligation => scope.store_mut().delete_obligation(str_arg(args, "name")?)?,
            CreateOperation => {
                let name = str_arg(args, "name")?;
                if scope.registry.is_reserved(name) {
                    return Err(PolicyError::DuplicateOperation(name.to_string()));
                }
                let steps = args
                    .get("steps")
                    .cloned()
                    .ok_or_else(|| PolicyError::invalid("steps", "missing"))?;
                let steps: Vec<OperationCall> = serde_json::from_value(steps)
                    .map_err(|err| PolicyError::invalid("steps", err.to_string()))?;
                let definition = serde_json::to_string(&RoutineDefinition { steps })
                    .map_err(|err| PolicyError::invalid("steps", err.to_string()))?;
                scope.store_mut().create_operation(OperationDef {
                    name: name.to_string(),
                    definition,
                })?;
            }
            DeleteOperation => scope.store_mut().delete_operation(str_arg(args, "name")?)?,
            SetResourceAccessRights => {
                let requested: AccessRightSet = list_arg(args, "rights")?.into_iter().collect();
                if let Some(clash) = requested
                    .iter()
                    .find(|r| *r == ALL_ACCESS_RIGHTS || rights::ADMIN_RIGHTS.contains(&r.as_str()))
                {
                    return Err(PolicyError::invalid(
                        "rights",
                        format!("`{clash}` is reserved"),
                    ));
                }
                scope.store_mut().set_resource_access_rights(requested)?;
            }
        }

        Ok(Value::Null)
    }
}

fn create_node(
    scope: &mut OperationScope<'_>,
    args: &Args,
    kind: NodeKind,
) -> Result<Value, PolicyError> {
    let name = str_arg(args, "name")?;
    let parents = if kind == NodeKind::PolicyClass {
        Vec::new()
    } else {
        list_arg(args, "parents")?
    };
    let parents = parents
        .iter()
        .map(|parent| scope.store().node_named(parent).map(|node| node.id))
        .collect::<Result<Vec<_>, _>>()?;

    let id = scope.store().next_node_id();
    let store = scope.store_mut();
    store.create_node(Node {
        id,
        name: name.to_string(),
        kind,
    })?;
    for parent in parents {
        store.create_assignment(id, parent)?;
    }

    Ok(json!({ "id": id.0 }))
}

fn str_arg<'a>(args: &'a Args, name: &str) -> Result<&'a str, PolicyError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| PolicyError::invalid(name, "expected a string"))
}

fn list_arg(args: &Args, name: &str) -> Result<Vec<String>, PolicyError> {
    match args.get(name) {
        Some(Value::String(single)) => Ok(vec![single.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| PolicyError::invalid(name, "expected a list of strings"))
            })
            .collect(),
        _ => Err(PolicyError::invalid(name, "expected a list of strings")),
    }
}

fn rights_arg(store: &dyn PolicyStore, args: &Args, name: &str) -> Result<AccessRightSet, PolicyError> {
    let known = known_rights(store);
    let requested = list_arg(args, name)?;
    if let Some(unknown) = requested
        .iter()
        .find(|r| *r != ALL_ACCESS_RIGHTS && !known.contains(*r))
    {
        return Err(PolicyError::UnknownAccessRight(unknown.clone()));
    }
    Ok(requested.into_iter().collect())
}

#[derive(Deserialize)]
struct ContainerArg {
    name: String,
    #[serde(default)]
    complement: bool,
}

fn prohibition_arg(store: &dyn PolicyStore, args: &Args) -> Result<Prohibition, PolicyError> {
    let containers: Vec<ContainerArg> = serde_json::from_value(
        args.get("containers")
            .cloned()
            .ok_or_else(|| PolicyError::invalid("containers", "missing"))?,
    )
    .map_err(|err| PolicyError::invalid("containers", err.to_string()))?;

    let containers = containers
        .into_iter()
        .map(|c| {
            Ok(ContainerCondition {
                container: store.node_named(&c.name)?.id,
                complement: c.complement,
            })
        })
        .collect::<Result<Vec<_>, PolicyError>>()?;

    Ok(Prohibition {
        name: str_arg(args, "name")?.to_string(),
        subject: store.node_named(str_arg(args, "subject")?)?.id,
        rights: rights_arg(store, args, "rights")?,
        intersection: args
            .get("intersection")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        containers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixture_store;

    struct Panicking;

    impl Operation for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn check(&self, _scope: &OperationScope<'_>, _args: &Args) -> Result<(), PolicyError> {
            Ok(())
        }

        fn execute(&self, _scope: &mut OperationScope<'_>, _args: &Args) -> Result<Value, PolicyError> {
            panic!("plugin bug")
        }
    }

    #[test]
    fn builtin_creates_node_under_permitted_parent() {
        let mut store = fixture_store();
        let registry = OperationRegistry::new();
        let user = UserContext::new("admin");
        let mut scope = OperationScope::new(&user, &mut store, &registry);

        let value = scope
            .invoke(&OperationCall::new(
                "create_object",
                json!({ "name": "o9", "parents": ["oa1"] }),
            ))
            .unwrap();

        assert!(value["id"].as_u64().is_some());
        assert!(store.node_by_name("o9").is_some());
    }

    #[test]
    fn builtin_denies_without_rights() {
        let mut store = fixture_store();
        let registry = OperationRegistry::new();
        let user = UserContext::new("u1");
        let mut scope = OperationScope::new(&user, &mut store, &registry);

        let err = scope
            .invoke(&OperationCall::new(
                "assign",
                json!({ "child": "o1", "parents": ["oa2"] }),
            ))
            .unwrap_err();
        assert!(err.is_denial());
    }

    #[test]
    fn external_panics_become_policy_errors() {
        let mut store = fixture_store();
        let mut registry = OperationRegistry::new();
        registry.register(Arc::new(Panicking)).unwrap();
        assert!(registry.register(Arc::new(Panicking)).is_err());

        let user = UserContext::new("admin");
        let mut scope = OperationScope::new(&user, &mut store, &registry);
        let err = scope
            .invoke(&OperationCall::new("panicking", Value::Null))
            .unwrap_err();
        assert!(matches!(err, PolicyError::OperationFailed { .. }));
    }

    #[test]
    fn defined_operation_runs_its_steps_as_the_caller() {
        let mut store = fixture_store();
        let registry = OperationRegistry::new();
        let user = UserContext::new("admin");
        let mut scope = OperationScope::new(&user, &mut store, &registry);

        scope
            .invoke(&OperationCall::new(
                "create_operation",
                json!({
                    "name": "provision",
                    "steps": [
                        { "name": "create_object", "args": { "name": "o7", "parents": ["oa1"] } }
                    ]
                }),
            ))
            .unwrap();
        scope
            .invoke(&OperationCall::new("provision", Value::Null))
            .unwrap();

        assert!(store.node_by_name("o7").is_some());
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let store = fixture_store();
        let registry = OperationRegistry::new();
        assert!(matches!(
            registry.resolve("nope", &store),
            Err(PolicyError::UnknownOperation(_))
        ));
    }
}
