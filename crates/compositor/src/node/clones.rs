//! Clone layer registry and reincarnation
//!
//! A source layer keeps the ids of its clones so it can fan out dirty
//! notifications. The list is a set of weak handles: ids of clones that left
//! the graph stay in it and are filtered out on lookup.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::graph::{NodeGraph, Subtree};
use super::{GraphError, NodeId, NodeKind};

impl NodeGraph {
    /// Add `clone` to the registry of `source`; no-op when already present
    pub fn register_clone(&mut self, source: NodeId, clone: NodeId) {
        let Some(node) = self.nodes.get_mut(&source) else {
            debug!("Clone {} refers to missing source {}", clone, source);
            return;
        };
        if !node.clones.contains(&clone) {
            node.clones.push(clone);
        }
    }

    pub fn unregister_clone(&mut self, source: NodeId, clone: NodeId) {
        if let Some(node) = self.nodes.get_mut(&source) {
            node.clones.retain(|id| *id != clone);
        }
    }

    /// Attached clone layers currently showing `source`
    pub fn clones_of(&self, source: NodeId) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(&source) else {
            return Vec::new();
        };
        node.clones
            .iter()
            .filter(|clone| {
                self.is_attached(**clone)
                    && self
                        .nodes
                        .get(clone)
                        .and_then(|node| node.clone_source())
                        .is_some_and(|(src, _)| src == source)
            })
            .copied()
            .collect()
    }

    /// True when the projection of `from` reads `target`, directly or through
    /// descendants and clone sources
    fn depends_on(&self, pending: Option<&Subtree>, from: NodeId, target: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            let Some(node) = self.lookup(pending, current) else {
                continue;
            };
            stack.extend(node.children.iter().copied());
            if let Some((source, _)) = node.clone_source() {
                stack.push(source);
            }
        }
        false
    }

    /// Reject a subtree whose clone layers would end up reading themselves
    /// once attached under `parent`
    pub(super) fn check_clone_cycles(&self, subtree: &Subtree, parent: NodeId) -> Result<(), GraphError> {
        let outer_ancestors = self.ancestors_or_self(parent);
        for clone in subtree.ids() {
            let Some((source, _)) = subtree.node(clone).and_then(|node| node.clone_source()) else {
                continue;
            };
            let mut ancestors = vec![clone];
            let mut current = subtree.node(clone).and_then(|node| node.parent);
            while let Some(id) = current {
                ancestors.push(id);
                current = subtree.node(id).and_then(|node| node.parent);
            }
            ancestors.extend(outer_ancestors.iter().copied());

            if ancestors
                .iter()
                .any(|ancestor| self.depends_on(Some(subtree), source, *ancestor))
            {
                warn!("Rejected clone {} of {}: cycle", clone, source);
                return Err(GraphError::CloneCycle {
                    original: source,
                    clone,
                });
            }
        }
        Ok(())
    }

    /// Turn a clone layer into a paint layer holding a snapshot of its
    /// source's projection. Returns the previous kind so the change can be
    /// reverted with [`restore_kind`](Self::restore_kind).
    pub fn reincarnate_clone(&mut self, clone: NodeId) -> Result<NodeKind, GraphError> {
        let node = self.nodes.get(&clone).ok_or(GraphError::NotFound(clone))?;
        let (source, offset) = node.clone_source().ok_or(GraphError::NotAClone(clone))?;

        let snapshot = match self.projection(source) {
            Some(projection) => {
                let mut device = projection.clone();
                device.move_to(device.offset() + offset);
                device
            }
            None => match node.original() {
                Some(original) => original.clone(),
                None => return Err(GraphError::NotAClone(clone)),
            },
        };

        self.unregister_clone(source, clone);
        let node = self.nodes.get_mut(&clone).ok_or(GraphError::NotFound(clone))?;
        let previous = std::mem::replace(&mut node.kind, NodeKind::PaintLayer { device: snapshot });
        node.projection = None;
        debug!("Reincarnated clone {} of {} as a paint layer", clone, source);
        Ok(previous)
    }

    /// Put back a kind returned by [`reincarnate_clone`](Self::reincarnate_clone)
    pub fn restore_kind(&mut self, id: NodeId, kind: NodeKind) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NotFound(id))?;
        let source = match &kind {
            NodeKind::CloneLayer { source, .. } => Some(*source),
            _ => None,
        };
        node.kind = kind;
        node.projection = None;
        if let Some(source) = source {
            self.register_clone(source, id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::IVec2;

    use crate::color::ColorSpace;
    use crate::geometry::Rect;
    use crate::node::{GraphError, NodeFactory, NodeGraph, NodeKind};
    use crate::tiles::TilePool;

    fn setup() -> (NodeFactory, NodeGraph) {
        let factory = NodeFactory::new(ColorSpace::Rgba8, TilePool::unlimited());
        let graph = NodeGraph::new(factory.group_layer("root"));
        (factory, graph)
    }

    #[test]
    fn test_registry_filters_detached_clones() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let source = graph.push_node(factory.paint_layer("source"), root).unwrap();
        let a = graph
            .push_node(factory.clone_layer("a", source, IVec2::new(5, 0)), root)
            .unwrap();
        let b = graph
            .push_node(factory.clone_layer("b", source, IVec2::new(0, 9)), root)
            .unwrap();
        assert_eq!(graph.clones_of(source), vec![a, b]);

        let detached = graph.detach(a).unwrap();
        assert_eq!(graph.clones_of(source), vec![b]);
        graph.insert(detached, root, 0).unwrap();
        assert_eq!(graph.clones_of(source).len(), 2);
    }

    #[test]
    fn test_clone_cycles_are_rejected() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let group = graph.push_node(factory.group_layer("group"), root).unwrap();

        let err = graph
            .push_node(factory.clone_layer("inside", group, IVec2::ZERO), group)
            .unwrap_err();
        assert!(matches!(err, GraphError::CloneCycle { .. }));
        let err = graph
            .push_node(factory.clone_layer("of root", root, IVec2::ZERO), root)
            .unwrap_err();
        assert!(matches!(err, GraphError::CloneCycle { .. }));

        let first = graph
            .push_node(factory.clone_layer("first", group, IVec2::ZERO), root)
            .unwrap();
        let err = graph
            .push_node(factory.clone_layer("second", first, IVec2::ZERO), group)
            .unwrap_err();
        assert!(matches!(err, GraphError::CloneCycle { .. }));
    }

    #[test]
    fn test_reincarnation_round_trip() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let mut source_node = factory.paint_layer("source");
        source_node
            .original_mut()
            .unwrap()
            .fill(Rect::new(0, 0, 4, 4), &[1, 2, 3, 255])
            .unwrap();
        let source = graph.push_node(source_node, root).unwrap();
        let clone = graph
            .push_node(factory.clone_layer("clone", source, IVec2::new(10, 0)), root)
            .unwrap();

        let previous = graph.reincarnate_clone(clone).unwrap();
        let node = graph.get(clone).unwrap();
        assert!(matches!(node.kind(), NodeKind::PaintLayer { .. }));
        assert_eq!(node.original().unwrap().pixel(11, 1), &[1, 2, 3, 255]);
        assert!(graph.clones_of(source).is_empty());

        graph.restore_kind(clone, previous).unwrap();
        assert_eq!(graph.clones_of(source), vec![clone]);
        assert_eq!(
            graph.reincarnate_clone(source).unwrap_err(),
            GraphError::NotAClone(source)
        );
    }
}
