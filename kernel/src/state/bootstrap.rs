// Policy Bootstrap
//
// Applies an initial policy source to an empty store. The same source is
// applied twice in a node's life: once on the writer to allocate ids, and
// again on every replica with the ids recorded in the `Bootstrapped` event.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    AccessRightSet, Association, ContainerCondition, Node, NodeId, NodeKind, Obligation,
    PolicyStore, Prohibition, StoreError,
};

/// Policy class holding the administrative target.
pub const ADMIN_POLICY_CLASS: &str = "PM_ADMIN";

/// Target on which policy-wide administrative rights are checked.
pub const ADMIN_BASE: &str = "PM_ADMIN:base";

/// Declared format of a bootstrap source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Json,
    /// Structured policy-language text.
    Pml,
}

impl ContentType {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("pml") => ContentType::Pml,
            _ => ContentType::Json,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapPolicy {
    #[serde(default)]
    pub resource_access_rights: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<BootstrapNode>,
    #[serde(default)]
    pub associations: Vec<BootstrapAssociation>,
    #[serde(default)]
    pub prohibitions: Vec<BootstrapProhibition>,
    #[serde(default)]
    pub obligations: Vec<BootstrapObligation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapAssociation {
    pub ua: String,
    pub target: String,
    pub rights: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapProhibition {
    pub name: String,
    pub subject: String,
    pub rights: Vec<String>,
    #[serde(default)]
    pub intersection: bool,
    pub containers: Vec<BootstrapContainer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapContainer {
    pub name: String,
    #[serde(default)]
    pub complement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapObligation {
    pub name: String,
    pub author: String,
    pub rules: serde_json::Value,
}

/// Where node ids come from while applying a source.
pub enum NodeIds<'a> {
    /// Allocate fresh ids from the store (writer side).
    Allocate,
    /// Reuse ids recorded by the writer (replay side).
    Recorded(&'a BTreeMap<String, NodeId>),
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap source is not valid: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("content type {0:?} is not supported")]
    UnsupportedContentType(ContentType),

    #[error("policy is not empty, bootstrap refused")]
    NotEmpty,

    #[error("no recorded id for bootstrapped node `{0}`")]
    MissingNodeId(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn parse(source: &str, content_type: ContentType) -> Result<BootstrapPolicy, BootstrapError> {
    match content_type {
        ContentType::Json => Ok(serde_json::from_str(source)?),
        ContentType::Pml => Err(BootstrapError::UnsupportedContentType(content_type)),
    }
}

/// Apply a bootstrap source, returning the name→id map of created nodes.
pub fn apply(
    store: &mut dyn PolicyStore,
    source: &str,
    content_type: ContentType,
    ids: NodeIds<'_>,
) -> Result<BTreeMap<String, NodeId>, BootstrapError> {
    let policy = parse(source, content_type)?;
    if !store.is_empty() {
        return Err(BootstrapError::NotEmpty);
    }

    let mut nodes = NodeCreator {
        ids,
        created: BTreeMap::new(),
    };

    let admin_pc = nodes.create(store, ADMIN_POLICY_CLASS, NodeKind::PolicyClass)?;
    let admin_base = nodes.create(store, ADMIN_BASE, NodeKind::ObjectAttribute)?;
    store.create_assignment(admin_base, admin_pc)?;

    for node in &policy.nodes {
        let id = nodes.create(store, &node.name, node.kind)?;
        for parent in &node.parents {
            let parent = store.node_named(parent)?;
            store.create_assignment(id, parent.id)?;
        }
    }

    for association in &policy.associations {
        let ua = store.node_named(&association.ua)?.id;
        let target = store.node_named(&association.target)?.id;
        store.create_association(Association {
            ua,
            target,
            rights: rights(&association.rights),
        })?;
    }

    for prohibition in &policy.prohibitions {
        let subject = store.node_named(&prohibition.subject)?.id;
        let containers = prohibition
            .containers
            .iter()
            .map(|c| {
                Ok(ContainerCondition {
                    container: store.node_named(&c.name)?.id,
                    complement: c.complement,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        store.create_prohibition(Prohibition {
            name: prohibition.name.clone(),
            subject,
            rights: rights(&prohibition.rights),
            intersection: prohibition.intersection,
            containers,
        })?;
    }

    for obligation in &policy.obligations {
        let author = store.node_named(&obligation.author)?.id;
        store.create_obligation(Obligation {
            name: obligation.name.clone(),
            author,
            rules: serde_json::to_string(&obligation.rules)?,
        })?;
    }

    if !policy.resource_access_rights.is_empty() {
        store.set_resource_access_rights(rights(&policy.resource_access_rights))?;
    }

    Ok(nodes.created)
}

struct NodeCreator<'a> {
    ids: NodeIds<'a>,
    created: BTreeMap<String, NodeId>,
}

impl NodeCreator<'_> {
    fn create(
        &mut self,
        store: &mut dyn PolicyStore,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, BootstrapError> {
        let id = match &self.ids {
            NodeIds::Allocate => store.next_node_id(),
            NodeIds::Recorded(map) => *map
                .get(name)
                .ok_or_else(|| BootstrapError::MissingNodeId(name.to_string()))?,
        };
        store.create_node(Node {
            id,
            name: name.to_string(),
            kind,
        })?;
        self.created.insert(name.to_string(), id);
        Ok(id)
    }
}

fn rights(names: &[String]) -> AccessRightSet {
    names.iter().cloned().collect()
}
