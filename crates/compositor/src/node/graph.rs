//! Id-addressed node table and structural edits

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::device::PaintDevice;

use super::{GraphError, Node, NodeId};

/// A detached branch of the tree, owned outside the graph until it is
/// inserted again
#[derive(Debug, Clone)]
pub struct Subtree {
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
}

impl Subtree {
    /// Subtree made of one detached node
    pub fn single(mut node: Node) -> Self {
        node.parent = None;
        let root = node.id;
        let mut nodes = HashMap::new();
        nodes.insert(root, node);
        Self { root, nodes }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }
}

/// The layer tree: an id to node table plus the root id
#[derive(Clone)]
pub struct NodeGraph {
    pub(super) nodes: HashMap<NodeId, Node>,
    root: NodeId,
}

impl NodeGraph {
    /// Graph holding only `root`
    pub fn new(mut root: Node) -> Self {
        root.parent = None;
        root.children.clear();
        let id = root.id;
        let mut nodes = HashMap::new();
        nodes.insert(id, root);
        Self { nodes, root: id }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// True when `id` is reachable from the root through parent links
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == self.root {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|node| node.parent);
        }
        false
    }

    /// Position of `id` in its parent's child list
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes.get(&id)?.parent?;
        self.nodes
            .get(&parent)?
            .children
            .iter()
            .position(|child| *child == id)
    }

    /// `id` followed by its ancestors up to the root
    pub fn ancestors_or_self(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.nodes.get(&node_id) else {
                break;
            };
            chain.push(node_id);
            current = node.parent;
        }
        chain
    }

    /// `id` and everything below it, parents before children
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Visible and hidden effect masks of a layer, in child order
    pub fn effect_masks(&self, id: NodeId) -> Vec<NodeId> {
        self.children_where(id, |node| node.kind.is_effect_mask())
    }

    /// Effect masks that currently take part in the projection
    pub fn visible_effect_masks(&self, id: NodeId) -> Vec<NodeId> {
        self.children_where(id, |node| node.kind.is_effect_mask() && node.is_visible())
    }

    /// Child layers of `id`, bottom to top
    pub fn layer_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children_where(id, Node::is_layer)
    }

    fn children_where(&self, id: NodeId, predicate: impl Fn(&Node) -> bool) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(&id) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter(|child| self.nodes.get(child).is_some_and(&predicate))
            .copied()
            .collect()
    }

    pub fn original(&self, id: NodeId) -> Option<&PaintDevice> {
        self.nodes.get(&id)?.original()
    }

    pub fn original_mut(&mut self, id: NodeId) -> Option<&mut PaintDevice> {
        self.nodes.get_mut(&id)?.original_mut()
    }

    /// Composited output of `id` through its own masks and style
    pub fn projection(&self, id: NodeId) -> Option<&PaintDevice> {
        self.nodes.get(&id)?.projection()
    }

    /// Whether `parent` may hold `child`: groups hold layers and masks,
    /// other layers hold masks only, masks hold nothing.
    fn allows_child(parent: &Node, child: &Node) -> bool {
        if parent.is_mask() {
            return false;
        }
        child.is_mask() || parent.is_group()
    }

    /// Insert a single detached node under `parent` at `index`
    pub fn add_node(&mut self, node: Node, parent: NodeId, index: usize) -> Result<NodeId, GraphError> {
        self.insert(Subtree::single(node), parent, index)
    }

    /// Append a single detached node as the topmost child of `parent`
    pub fn push_node(&mut self, node: Node, parent: NodeId) -> Result<NodeId, GraphError> {
        let index = self
            .nodes
            .get(&parent)
            .map(|node| node.children.len())
            .ok_or(GraphError::NotFound(parent))?;
        self.add_node(node, parent, index)
    }

    /// Attach a detached subtree. Clone layers inside it are registered on
    /// their sources.
    pub fn insert(&mut self, mut subtree: Subtree, parent: NodeId, index: usize) -> Result<NodeId, GraphError> {
        let parent_node = self.nodes.get(&parent).ok_or(GraphError::NotFound(parent))?;
        let root = subtree
            .nodes
            .get(&subtree.root)
            .ok_or(GraphError::NotFound(subtree.root))?;
        if !Self::allows_child(parent_node, root) {
            return Err(GraphError::InvalidParent(parent));
        }
        let len = parent_node.children.len();
        if index > len {
            return Err(GraphError::IndexOutOfRange { index, len });
        }
        if let Some(id) = subtree.nodes.keys().find(|id| self.nodes.contains_key(id)) {
            return Err(GraphError::AlreadyPresent(*id));
        }
        self.check_clone_cycles(&subtree, parent)?;

        let root_id = subtree.root;
        if let Some(root) = subtree.nodes.get_mut(&root_id) {
            root.parent = Some(parent);
        }
        let clones: Vec<(NodeId, NodeId)> = subtree
            .nodes
            .values()
            .filter_map(|node| node.clone_source().map(|(source, _)| (source, node.id)))
            .collect();
        self.nodes.extend(subtree.nodes.drain());
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(index, root_id);
        }
        for (source, clone) in clones {
            self.register_clone(source, clone);
        }
        debug!("Inserted subtree {} under {} at {}", root_id, parent, index);
        Ok(root_id)
    }

    /// Move `id` and everything below it out of the graph
    pub fn detach(&mut self, id: NodeId) -> Result<Subtree, GraphError> {
        if id == self.root {
            return Err(GraphError::RootLocked);
        }
        let parent = self.nodes.get(&id).ok_or(GraphError::NotFound(id))?.parent;
        if let Some(parent_node) = parent.and_then(|parent| self.nodes.get_mut(&parent)) {
            parent_node.children.retain(|child| *child != id);
        }
        let mut nodes = HashMap::new();
        for node_id in self.descendants(id) {
            if let Some(node) = self.nodes.remove(&node_id) {
                nodes.insert(node_id, node);
            }
        }
        if let Some(root) = nodes.get_mut(&id) {
            root.parent = None;
        }
        trace!("Detached {} ({} nodes)", id, nodes.len());
        Ok(Subtree { root: id, nodes })
    }

    /// Reparent `id` under `new_parent` at `index` (counted after removal).
    /// On failure the graph is left as it was.
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, index: usize) -> Result<(), GraphError> {
        if id == self.root {
            return Err(GraphError::RootLocked);
        }
        if self.ancestors_or_self(new_parent).contains(&id) {
            return Err(GraphError::InvalidParent(new_parent));
        }
        let old_parent = self
            .nodes
            .get(&id)
            .and_then(|node| node.parent)
            .ok_or(GraphError::NotFound(id))?;
        let old_index = self.index_of(id).unwrap_or(0);
        let subtree = self.detach(id)?;
        let backup = subtree.clone();
        match self.insert(subtree, new_parent, index) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.insert(backup, old_parent, old_index)?;
                Err(err)
            }
        }
    }

    /// Node by id, looking into a pending subtree first
    pub(super) fn lookup<'a>(&'a self, pending: Option<&'a Subtree>, id: NodeId) -> Option<&'a Node> {
        pending
            .and_then(|subtree| subtree.nodes.get(&id))
            .or_else(|| self.nodes.get(&id))
    }
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorSpace;
    use crate::filter::Filter;
    use crate::node::NodeFactory;
    use crate::tiles::TilePool;

    fn setup() -> (NodeFactory, NodeGraph) {
        let factory = NodeFactory::new(ColorSpace::Rgba8, TilePool::unlimited());
        let graph = NodeGraph::new(factory.group_layer("root"));
        (factory, graph)
    }

    #[test]
    fn test_insert_and_order() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let a = graph.push_node(factory.paint_layer("a"), root).unwrap();
        let c = graph.push_node(factory.paint_layer("c"), root).unwrap();
        let b = graph.add_node(factory.paint_layer("b"), root, 1).unwrap();
        assert_eq!(graph.layer_children(root), vec![a, b, c]);
        assert_eq!(graph.index_of(c), Some(2));
        assert!(graph.is_attached(b));
    }

    #[test]
    fn test_child_rules() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let layer = graph.push_node(factory.paint_layer("layer"), root).unwrap();
        let mask = graph
            .push_node(factory.filter_mask("mask", Filter::Invert), layer)
            .unwrap();
        assert_eq!(graph.effect_masks(layer), vec![mask]);

        let err = graph.push_node(factory.paint_layer("x"), layer).unwrap_err();
        assert_eq!(err, GraphError::InvalidParent(layer));
        let err = graph
            .push_node(factory.filter_mask("m", Filter::Invert), mask)
            .unwrap_err();
        assert_eq!(err, GraphError::InvalidParent(mask));
        let err = graph.add_node(factory.paint_layer("y"), root, 5).unwrap_err();
        assert_eq!(err, GraphError::IndexOutOfRange { index: 5, len: 1 });
    }

    #[test]
    fn test_detach_and_reinsert_subtree() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let group = graph.push_node(factory.group_layer("group"), root).unwrap();
        let inner = graph.push_node(factory.paint_layer("inner"), group).unwrap();
        let mask = graph
            .push_node(factory.filter_mask("mask", Filter::Invert), inner)
            .unwrap();

        let subtree = graph.detach(group).unwrap();
        assert_eq!(subtree.len(), 3);
        assert!(!graph.contains(inner));
        assert!(!graph.is_attached(mask));
        assert!(graph.get(root).unwrap().children().is_empty());

        graph.insert(subtree, root, 0).unwrap();
        assert!(graph.is_attached(mask));
        assert_eq!(graph.descendants(group), vec![group, inner, mask]);
        assert_eq!(graph.detach(root).unwrap_err(), GraphError::RootLocked);
    }

    #[test]
    fn test_move_node() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let group = graph.push_node(factory.group_layer("group"), root).unwrap();
        let layer = graph.push_node(factory.paint_layer("layer"), root).unwrap();
        graph.move_node(layer, group, 0).unwrap();
        assert_eq!(graph.get(layer).unwrap().parent(), Some(group));
        assert_eq!(graph.layer_children(root), vec![group]);

        assert_eq!(
            graph.move_node(group, layer, 0).unwrap_err(),
            GraphError::InvalidParent(layer)
        );
        assert_eq!(graph.get(group).unwrap().parent(), Some(root));
        assert_eq!(
            graph.move_node(group, group, 0).unwrap_err(),
            GraphError::InvalidParent(group)
        );
    }
}
