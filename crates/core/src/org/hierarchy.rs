use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::org::{DisplayNames, OrgNode, OrgNodeId, OrgNodeType, PickerMode};

/// Upper bound on parent hops for any upward walk.
pub const MAX_ANCESTOR_HOPS: usize = 200;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OrgError {
    #[error("org node {0} does not exist")]
    UnknownNode(OrgNodeId),
    #[error("node type `{0}` does not exist")]
    UnknownType(String),
    #[error("node {node_id} of type {type_code} cannot sit under a {parent_type_code} node")]
    ParentTypeNotAllowed { node_id: OrgNodeId, type_code: String, parent_type_code: String },
}

/// A node as handed to selection widgets, annotated for one consuming mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickerNode {
    pub id: OrgNodeId,
    pub type_code: String,
    pub names: DisplayNames,
    pub code: Option<String>,
    pub eligible: bool,
    pub children: Vec<PickerNode>,
}

/// Arena of org nodes with a parent index. Nodes whose parent is missing
/// from the arena are treated as roots.
#[derive(Clone, Debug, Default)]
pub struct OrgTree {
    nodes: Vec<OrgNode>,
    index: HashMap<OrgNodeId, usize>,
    children: HashMap<Option<OrgNodeId>, Vec<usize>>,
    types: BTreeMap<String, OrgNodeType>,
}

impl OrgTree {
    pub fn new(nodes: Vec<OrgNode>, types: Vec<OrgNodeType>) -> Self {
        let index: HashMap<OrgNodeId, usize> =
            nodes.iter().enumerate().map(|(position, node)| (node.id, position)).collect();

        let mut children: HashMap<Option<OrgNodeId>, Vec<usize>> = HashMap::new();
        for (position, node) in nodes.iter().enumerate() {
            let parent = node.parent_id.filter(|parent| index.contains_key(parent));
            children.entry(parent).or_default().push(position);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|&a, &b| {
                let (a, b) = (&nodes[a], &nodes[b]);
                (a.sort_order, &a.names.local, a.id).cmp(&(b.sort_order, &b.names.local, b.id))
            });
        }

        let types =
            types.into_iter().map(|node_type| (node_type.code.clone(), node_type)).collect();
        Self { nodes, index, children, types }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: OrgNodeId) -> Option<&OrgNode> {
        self.index.get(&id).map(|&position| &self.nodes[position])
    }

    pub fn node_type(&self, code: &str) -> Option<&OrgNodeType> {
        self.types.get(code)
    }

    /// `id` followed by its ancestors, nearest first. Stops at a missing
    /// node, a revisited node, or after `MAX_ANCESTOR_HOPS` entries.
    pub fn node_ancestor_ids(&self, id: OrgNodeId) -> Vec<OrgNodeId> {
        let mut ancestors = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(id);

        while let Some(node_id) = current {
            if ancestors.len() >= MAX_ANCESTOR_HOPS || !visited.insert(node_id) {
                break;
            }
            let Some(node) = self.node(node_id) else {
                break;
            };
            ancestors.push(node_id);
            current = node.parent_id;
        }

        ancestors
    }

    /// Checks that a node of `type_code` may sit under `parent_id`.
    pub fn check_parent(
        &self,
        node_id: OrgNodeId,
        type_code: &str,
        parent_id: Option<OrgNodeId>,
    ) -> Result<(), OrgError> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let node_type =
            self.node_type(type_code).ok_or_else(|| OrgError::UnknownType(type_code.to_string()))?;
        let parent = self.node(parent_id).ok_or(OrgError::UnknownNode(parent_id))?;

        if node_type.allows_parent(&parent.type_code) {
            Ok(())
        } else {
            Err(OrgError::ParentTypeNotAllowed {
                node_id,
                type_code: type_code.to_string(),
                parent_type_code: parent.type_code.clone(),
            })
        }
    }

    pub fn parent_type_violations(&self) -> Vec<OrgError> {
        self.nodes
            .iter()
            .filter_map(|node| self.check_parent(node.id, &node.type_code, node.parent_id).err())
            .collect()
    }

    /// Active nodes annotated with `eligible` for `mode`. Outside `All`,
    /// ineligible nodes without eligible descendants are pruned.
    pub fn picker_tree(&self, mode: PickerMode) -> Vec<PickerNode> {
        let mut visited = HashSet::new();
        self.picker_children(None, mode, &mut visited)
    }

    /// Active nodes whose type is shown in charts. Hidden nodes are lifted
    /// out and their children attach to the nearest visible ancestor.
    pub fn chart_tree(&self) -> Vec<PickerNode> {
        let mut visited = HashSet::new();
        self.chart_children(None, &mut visited)
    }

    fn children_of(&self, parent: Option<OrgNodeId>) -> impl Iterator<Item = &OrgNode> {
        self.children
            .get(&parent)
            .into_iter()
            .flatten()
            .map(move |&position| &self.nodes[position])
            .filter(|node| node.active)
    }

    fn picker_children(
        &self,
        parent: Option<OrgNodeId>,
        mode: PickerMode,
        visited: &mut HashSet<OrgNodeId>,
    ) -> Vec<PickerNode> {
        let mut out = Vec::new();
        for node in self.children_of(parent) {
            if !visited.insert(node.id) {
                continue;
            }
            let children = self.picker_children(Some(node.id), mode, visited);
            let eligible = mode.admits(self.node_type(&node.type_code));
            if mode != PickerMode::All && !eligible && children.is_empty() {
                continue;
            }
            out.push(picker_node(node, eligible, children));
        }
        out
    }

    fn chart_children(
        &self,
        parent: Option<OrgNodeId>,
        visited: &mut HashSet<OrgNodeId>,
    ) -> Vec<PickerNode> {
        let mut out = Vec::new();
        for node in self.children_of(parent) {
            if !visited.insert(node.id) {
                continue;
            }
            let children = self.chart_children(Some(node.id), visited);
            if PickerMode::Chart.admits(self.node_type(&node.type_code)) {
                out.push(picker_node(node, true, children));
            } else {
                out.extend(children);
            }
        }
        out
    }
}

fn picker_node(node: &OrgNode, eligible: bool, children: Vec<PickerNode>) -> PickerNode {
    PickerNode {
        id: node.id,
        type_code: node.type_code.clone(),
        names: node.names.clone(),
        code: node.code.clone(),
        eligible,
        children,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::{OrgError, OrgTree, PickerNode, MAX_ANCESTOR_HOPS};
    use crate::domain::org::{DisplayNames, OrgNode, OrgNodeId, OrgNodeType, PickerMode};

    fn node(id: i64, type_code: &str, parent: Option<i64>) -> OrgNode {
        OrgNode {
            id: OrgNodeId(id),
            type_code: type_code.to_string(),
            parent_id: parent.map(OrgNodeId),
            names: DisplayNames::new(format!("{type_code} {id}")),
            code: None,
            active: true,
            sort_order: 0,
            legacy: None,
        }
    }

    fn types() -> Vec<OrgNodeType> {
        let mut types = OrgNodeType::defaults();
        for node_type in &mut types {
            if node_type.code == "UNIT" {
                node_type.allow_in_approvals = false;
                node_type.show_in_chart = false;
            }
        }
        types
    }

    fn sample_tree() -> OrgTree {
        OrgTree::new(
            vec![
                node(1, "ORGANIZATION", None),
                node(2, "DIRECTORATE", Some(1)),
                node(3, "UNIT", Some(2)),
                node(4, "DEPARTMENT", Some(3)),
                node(5, "UNIT", Some(2)),
                OrgNode { active: false, ..node(6, "DEPARTMENT", Some(2)) },
            ],
            types(),
        )
    }

    fn ids(nodes: &[PickerNode]) -> Vec<i64> {
        nodes.iter().map(|node| node.id.0).collect()
    }

    #[test]
    fn ancestors_start_with_self_and_walk_up() {
        let tree = sample_tree();
        assert_eq!(
            tree.node_ancestor_ids(OrgNodeId(4)),
            vec![OrgNodeId(4), OrgNodeId(3), OrgNodeId(2), OrgNodeId(1)]
        );
        assert!(tree.node_ancestor_ids(OrgNodeId(99)).is_empty());
    }

    #[test]
    fn ancestor_walk_stops_on_cycle() {
        let tree = OrgTree::new(
            vec![node(1, "UNIT", Some(3)), node(2, "UNIT", Some(1)), node(3, "UNIT", Some(2))],
            types(),
        );
        assert_eq!(
            tree.node_ancestor_ids(OrgNodeId(1)),
            vec![OrgNodeId(1), OrgNodeId(3), OrgNodeId(2)]
        );
    }

    #[test]
    fn approvals_picker_prunes_ineligible_leaves_but_keeps_paths() {
        let tree = sample_tree();
        let picker = tree.picker_tree(PickerMode::Approvals);

        assert_eq!(ids(&picker), vec![1]);
        let directorate = &picker[0].children[0];
        assert_eq!(directorate.id, OrgNodeId(2));
        assert_eq!(ids(&directorate.children), vec![3]);
        assert!(!directorate.children[0].eligible);
        assert_eq!(ids(&directorate.children[0].children), vec![4]);
        assert!(directorate.children[0].children[0].eligible);
    }

    #[test]
    fn all_mode_keeps_every_active_node() {
        let tree = sample_tree();
        let picker = tree.picker_tree(PickerMode::All);
        let directorate = &picker[0].children[0];

        assert_eq!(ids(&directorate.children), vec![3, 5]);
        assert!(directorate.children.iter().all(|node| node.eligible));
    }

    #[test]
    fn chart_tree_lifts_hidden_types() {
        let tree = sample_tree();
        let chart = tree.chart_tree();
        let directorate = &chart[0].children[0];

        assert_eq!(ids(&directorate.children), vec![4]);
    }

    #[test]
    fn parent_type_violations_are_reported() {
        let tree = OrgTree::new(
            vec![node(1, "ORGANIZATION", None), node(2, "SECTION", Some(1))],
            OrgNodeType::defaults(),
        );

        assert_eq!(
            tree.parent_type_violations(),
            vec![OrgError::ParentTypeNotAllowed {
                node_id: OrgNodeId(2),
                type_code: "SECTION".to_string(),
                parent_type_code: "ORGANIZATION".to_string(),
            }]
        );
    }

    proptest! {
        #[test]
        fn ancestor_walk_is_bounded_for_arbitrary_parent_links(
            parents in prop::collection::vec(prop::option::of(0_i64..300), 1..300),
            start in 0_i64..300,
        ) {
            let nodes: Vec<OrgNode> = parents
                .iter()
                .enumerate()
                .map(|(id, parent)| node(id as i64, "UNIT", *parent))
                .collect();
            let tree = OrgTree::new(nodes, types());

            let walk = tree.node_ancestor_ids(OrgNodeId(start));
            prop_assert!(walk.len() <= MAX_ANCESTOR_HOPS);
            let unique: HashSet<OrgNodeId> = walk.iter().copied().collect();
            prop_assert_eq!(unique.len(), walk.len());
            if let Some(first) = walk.first() {
                prop_assert_eq!(*first, OrgNodeId(start));
            }
        }
    }
}
