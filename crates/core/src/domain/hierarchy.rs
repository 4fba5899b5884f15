use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::metric::EntityId;

/// Name of one hierarchical grouping of the leaf set, e.g. `by_product`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewName(pub String);

impl ViewName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Leaf node ids double as observation entity ids.
    pub fn as_entity(&self) -> EntityId {
        EntityId(self.0.clone())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Leaf,
    Group,
    Total,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub children: Vec<NodeId>,
}

impl HierarchyNode {
    pub fn leaf(id: impl Into<String>) -> Self {
        Self { id: NodeId(id.into()), kind: NodeKind::Leaf, children: Vec::new() }
    }

    pub fn group(id: impl Into<String>, children: &[&str]) -> Self {
        Self::internal(id, NodeKind::Group, children)
    }

    pub fn total(id: impl Into<String>, children: &[&str]) -> Self {
        Self::internal(id, NodeKind::Total, children)
    }

    fn internal(id: impl Into<String>, kind: NodeKind, children: &[&str]) -> Self {
        Self {
            id: NodeId(id.into()),
            kind,
            children: children.iter().map(|child| NodeId((*child).to_string())).collect(),
        }
    }
}

/// One named view: a parent→children adjacency list. The view name is carried
/// by the container rather than repeated on every node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyView {
    pub name: ViewName,
    pub nodes: Vec<HierarchyNode>,
}

impl HierarchyView {
    pub fn new(name: impl Into<String>, nodes: Vec<HierarchyNode>) -> Self {
        Self { name: ViewName(name.into()), nodes }
    }

    pub fn leaf_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().filter(|node| node.kind == NodeKind::Leaf).map(|node| &node.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HierarchyDefinition {
    pub views: Vec<HierarchyView>,
}

impl HierarchyDefinition {
    pub fn new(views: Vec<HierarchyView>) -> Self {
        Self { views }
    }

    pub fn view(&self, name: &ViewName) -> Option<&HierarchyView> {
        self.views.iter().find(|view| &view.name == name)
    }
}
