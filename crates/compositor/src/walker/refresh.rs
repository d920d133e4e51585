//! Subtree refresh walkers
//!
//! Used when a whole subtree has to be recomposited: after a pass-through
//! toggle, a move between groups or a change of a group's composition
//! settings. Every layer under the start node is registered as filthy.

use tracing::{debug, warn};

use super::merge::start_trip;
use super::{NodePosition, RectsWalker, WalkGraph, WalkState};
use crate::geometry::Rect;
use crate::node::{NodeGraph, NodeId};
use crate::projection_leaf::ProjectionLeaf;

/// Recomposites the subtree of the start node without touching anything
/// above it. The start node itself is recalculated in place.
#[derive(Debug, Clone, Copy)]
pub struct RefreshSubtreeWalker {
    crop_rect: Rect,
}

impl RefreshSubtreeWalker {
    pub fn new(crop_rect: Rect) -> Self {
        Self { crop_rect }
    }
}

impl RectsWalker for RefreshSubtreeWalker {
    fn collect_rects(&self, graph: &NodeGraph, start: NodeId, requested: Rect) -> WalkGraph {
        if !graph.is_attached(start) {
            warn!("Subtree refresh requested for detached node {}", start);
            return WalkGraph::empty(start, requested, self.crop_rect);
        }
        let mut state = WalkState::new(graph, start, requested, self.crop_rect);
        state.set_explicit_change_rect(requested);
        let Some(leaf) = state.leaf(start) else {
            return state.finish();
        };

        let extra = if leaf.is_mask() { leaf.parent() } else { Some(leaf) };
        if let Some(extra) = extra {
            let position = NodePosition::EXTRA | WalkState::node_position(&extra);
            state.register_need_rect(extra, position);
            state.register_clone_notification(extra, position);
        }
        refresh_children(&mut state, leaf);

        let walk = state.finish();
        debug!("Subtree refresh of {}: {} jobs", start, walk.jobs().len());
        walk
    }
}

/// Merge walk from the start node followed by a refresh of its subtree,
/// so the node is both rebuilt and composited upwards
#[derive(Debug, Clone, Copy)]
pub struct FullRefreshWalker {
    crop_rect: Rect,
}

impl FullRefreshWalker {
    pub fn new(crop_rect: Rect) -> Self {
        Self { crop_rect }
    }
}

impl RectsWalker for FullRefreshWalker {
    fn collect_rects(&self, graph: &NodeGraph, start: NodeId, requested: Rect) -> WalkGraph {
        if !graph.is_attached(start) {
            warn!("Full refresh requested for detached node {}", start);
            return WalkGraph::empty(start, requested, self.crop_rect);
        }
        let mut state = WalkState::new(graph, start, requested, self.crop_rect);
        let Some(leaf) = state.leaf(start) else {
            return state.finish();
        };
        start_trip(&mut state, leaf);
        if !leaf.is_mask() {
            refresh_children(&mut state, leaf);
        }

        let walk = state.finish();
        debug!("Full refresh of {}: {} jobs", start, walk.jobs().len());
        walk
    }
}

/// Register every child of `leaf` as filthy, then descend into the children
/// that hold layers of their own. Both passes go top to bottom.
fn refresh_children<'a>(state: &mut WalkState<'a>, leaf: ProjectionLeaf<'a>) {
    let mut current = leaf.last_child();
    while let Some(child) = current {
        let position = NodePosition::FILTHY | WalkState::node_position(&child);
        state.register_need_rect(child, position);
        state.register_clone_notification(child, position);
        current = child.prev_sibling();
    }

    let mut current = leaf.last_child();
    while let Some(child) = current {
        if child.has_child_layers() {
            refresh_children(state, child);
        }
        current = child.prev_sibling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorSpace;
    use crate::node::NodeFactory;
    use crate::tiles::TilePool;

    const BOUNDS: Rect = Rect::new(0, 0, 256, 256);

    struct Tree {
        graph: NodeGraph,
        bottom: NodeId,
        group: NodeId,
        inner_a: NodeId,
        inner_b: NodeId,
        top: NodeId,
    }

    fn tree() -> Tree {
        let factory = NodeFactory::new(ColorSpace::Rgba8, TilePool::unlimited());
        let mut graph = NodeGraph::new(factory.group_layer("root"));
        let root = graph.root();
        let bottom = graph.push_node(factory.paint_layer("bottom"), root).unwrap();
        let group = graph.push_node(factory.group_layer("group"), root).unwrap();
        let inner_a = graph.push_node(factory.paint_layer("a"), group).unwrap();
        let inner_b = graph.push_node(factory.paint_layer("b"), group).unwrap();
        let top = graph.push_node(factory.paint_layer("top"), root).unwrap();
        Tree {
            graph,
            bottom,
            group,
            inner_a,
            inner_b,
            top,
        }
    }

    fn order(walk: &WalkGraph) -> Vec<NodeId> {
        walk.execution_order().map(|job| job.node).collect()
    }

    #[test]
    fn test_refresh_subtree_of_root() {
        let t = tree();
        let root = t.graph.root();
        let rect = Rect::new(0, 0, 32, 32);
        let walk = RefreshSubtreeWalker::new(BOUNDS).collect_rects(&t.graph, root, rect);

        assert_eq!(
            order(&walk),
            vec![t.inner_a, t.inner_b, t.bottom, t.group, t.top, root]
        );
        let root_job = walk.job_for(root).unwrap();
        assert!(root_job.position.contains(NodePosition::EXTRA));
        for id in [t.bottom, t.group, t.top, t.inner_a, t.inner_b] {
            let job = walk.job_for(id).unwrap();
            assert!(job.position.contains(NodePosition::FILTHY));
            assert_eq!(job.apply_rect, rect);
        }
        assert_eq!(walk.change_rect(), rect);
    }

    #[test]
    fn test_refresh_subtree_stays_inside() {
        let t = tree();
        let walk = RefreshSubtreeWalker::new(BOUNDS).collect_rects(
            &t.graph,
            t.group,
            Rect::new(0, 0, 16, 16),
        );
        assert_eq!(order(&walk), vec![t.inner_a, t.inner_b, t.group]);
        assert!(walk.job_for(t.graph.root()).is_none());
    }

    #[test]
    fn test_full_refresh_walks_up_and_down() {
        let t = tree();
        let root = t.graph.root();
        let walk = FullRefreshWalker::new(BOUNDS).collect_rects(
            &t.graph,
            t.group,
            Rect::new(0, 0, 16, 16),
        );
        assert_eq!(
            order(&walk),
            vec![t.inner_a, t.inner_b, t.bottom, t.group, t.top, root]
        );
        let group_job = walk.job_for(t.group).unwrap();
        assert!(group_job.position.contains(NodePosition::FILTHY));
        assert!(!group_job.position.contains(NodePosition::EXTRA));
    }

    #[test]
    fn test_detached_start_is_noop() {
        let mut t = tree();
        let _removed = t.graph.detach(t.group).unwrap();
        let walk = FullRefreshWalker::new(BOUNDS).collect_rects(
            &t.graph,
            t.inner_a,
            Rect::new(0, 0, 16, 16),
        );
        assert!(walk.is_empty());
    }
}
