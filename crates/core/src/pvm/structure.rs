//! Structural validation of hierarchy views.
//!
//! A view is accepted only when it forms a single tree rooted at its `Total`
//! node. Any defect aborts that view alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::domain::hierarchy::{HierarchyNode, HierarchyView, NodeId, NodeKind, ViewName};
use crate::errors::HierarchyIntegrityError;

/// A view that passed structural validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewTree {
    name: ViewName,
    root: NodeId,
    nodes: BTreeMap<NodeId, HierarchyNode>,
    parents: BTreeMap<NodeId, NodeId>,
}

impl ViewTree {
    pub fn build(view: &HierarchyView) -> Result<Self, HierarchyIntegrityError> {
        if view.nodes.is_empty() {
            return Err(HierarchyIntegrityError::EmptyView);
        }

        let mut nodes = BTreeMap::new();
        for node in &view.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(HierarchyIntegrityError::DuplicateNode { node: node.id.clone() });
            }
            if node.kind == NodeKind::Leaf && !node.children.is_empty() {
                return Err(HierarchyIntegrityError::LeafWithChildren { node: node.id.clone() });
            }
        }

        let totals = view
            .nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Total)
            .map(|node| node.id.clone())
            .collect::<Vec<_>>();
        let root = match totals.as_slice() {
            [] => return Err(HierarchyIntegrityError::MissingTotal),
            [root] => root.clone(),
            _ => return Err(HierarchyIntegrityError::MultipleTotals { totals }),
        };

        let mut claimed_by: HashMap<&NodeId, Vec<NodeId>> = HashMap::new();
        for node in &view.nodes {
            for child in &node.children {
                if !nodes.contains_key(child) {
                    return Err(HierarchyIntegrityError::DanglingChild {
                        parent: node.id.clone(),
                        child: child.clone(),
                    });
                }
                claimed_by.entry(child).or_default().push(node.id.clone());
            }
        }

        let mut parents = BTreeMap::new();
        for node in &view.nodes {
            let Some(claims) = claimed_by.get(&node.id) else {
                continue;
            };
            if claims.len() > 1 {
                return Err(HierarchyIntegrityError::MultipleParents {
                    node: node.id.clone(),
                    parents: claims.clone(),
                });
            }
            if node.id == root {
                return Err(HierarchyIntegrityError::TotalHasParent {
                    node: root.clone(),
                    parent: claims[0].clone(),
                });
            }
            parents.insert(node.id.clone(), claims[0].clone());
        }

        let tree = Self { name: view.name.clone(), root, nodes, parents };
        tree.check_reachability(view)?;
        Ok(tree)
    }

    // Every non-root node has exactly one parent at this point, so a node the
    // root cannot reach either sits on a parent cycle or hangs off an orphan.
    fn check_reachability(&self, view: &HierarchyView) -> Result<(), HierarchyIntegrityError> {
        let reachable = self.post_order(&self.root).into_iter().collect::<BTreeSet<_>>();

        for node in &view.nodes {
            if reachable.contains(&node.id) {
                continue;
            }

            let mut seen = BTreeSet::new();
            let mut cursor = &node.id;
            loop {
                if !seen.insert(cursor.clone()) {
                    return Err(HierarchyIntegrityError::Cycle { node: cursor.clone() });
                }
                match self.parents.get(cursor) {
                    Some(parent) => cursor = parent,
                    None => {
                        return Err(HierarchyIntegrityError::Unreachable { node: node.id.clone() })
                    }
                }
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &ViewName {
        &self.name
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn node(&self, id: &NodeId) -> Option<&HierarchyNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes of the subtree under `start`, children before parents, siblings
    /// in declaration order.
    pub fn post_order(&self, start: &NodeId) -> Vec<NodeId> {
        let mut ordered = Vec::new();
        if !self.nodes.contains_key(start) {
            return ordered;
        }

        let mut visited = BTreeSet::new();
        let mut stack = vec![(start.clone(), false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                ordered.push(current);
                continue;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            stack.push((current.clone(), true));
            if let Some(node) = self.nodes.get(&current) {
                for child in node.children.iter().rev() {
                    stack.push((child.clone(), false));
                }
            }
        }

        ordered
    }

    /// Leaf ids under `start` in traversal order.
    pub fn leaves_under(&self, start: &NodeId) -> Vec<NodeId> {
        self.post_order(start)
            .into_iter()
            .filter(|id| self.nodes.get(id).is_some_and(|node| node.kind == NodeKind::Leaf))
            .collect()
    }

    pub fn ancestors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut cursor = id;
        while let Some(parent) = self.parents.get(cursor) {
            ancestors.push(parent.clone());
            cursor = parent;
        }
        ancestors
    }
}
