//! Minimal-update walker
//!
//! Climbs from the filthy leaf through every higher sibling and ancestor,
//! then descends to the leaves below it, so that only what the change can
//! reach is recomposited.

use tracing::{debug, warn};

use super::{NodePosition, RectsWalker, WalkGraph, WalkState};
use crate::geometry::Rect;
use crate::node::{NodeGraph, NodeId};
use crate::projection_leaf::ProjectionLeaf;

/// Walker for a single filthy node
#[derive(Debug, Clone, Copy)]
pub struct MergeWalker {
    crop_rect: Rect,
}

impl MergeWalker {
    /// Every registered rect is clipped to `crop_rect`, normally the image
    /// bounds
    pub fn new(crop_rect: Rect) -> Self {
        Self { crop_rect }
    }

    #[inline]
    pub fn crop_rect(&self) -> Rect {
        self.crop_rect
    }
}

impl RectsWalker for MergeWalker {
    fn collect_rects(&self, graph: &NodeGraph, start: NodeId, requested: Rect) -> WalkGraph {
        if !graph.is_attached(start) {
            warn!("Merge walk requested for detached node {}", start);
            return WalkGraph::empty(start, requested, self.crop_rect);
        }
        let mut state = WalkState::new(graph, start, requested, self.crop_rect);
        if let Some(leaf) = state.leaf(start) {
            start_trip(&mut state, leaf);
        }
        let walk = state.finish();
        debug!(
            "Merge walk from {}: {} jobs, change {:?}",
            start,
            walk.jobs().len(),
            walk.change_rect()
        );
        walk
    }
}

pub(super) fn start_trip<'a>(state: &mut WalkState<'a>, leaf: ProjectionLeaf<'a>) {
    if leaf.is_mask() {
        start_trip_with_mask(state, leaf);
        return;
    }
    visit_higher_node(state, leaf, NodePosition::FILTHY);
    if let Some(prev) = leaf.prev_sibling() {
        visit_lower_node(state, prev);
    }
}

fn start_trip_with_mask<'a>(state: &mut WalkState<'a>, mask: ProjectionLeaf<'a>) {
    state.adjust_masks_change_rect(mask);

    let Some(parent) = mask.parent() else {
        warn!("Mask {} has no parent layer, nothing to update", mask.id());
        return;
    };

    let position = NodePosition::FILTHY_PROJECTION | WalkState::node_position(&parent);
    state.register_change_rect(parent, position);

    if let Some(next) = parent.next_sibling() {
        visit_higher_node(state, next, NodePosition::ABOVE_FILTHY);
    } else if let Some(grandparent) = parent.parent() {
        start_trip(state, grandparent);
    }

    state.register_need_rect(parent, position);

    if let Some(prev) = parent.prev_sibling() {
        visit_lower_node(state, prev);
    }
}

fn visit_higher_node<'a>(state: &mut WalkState<'a>, leaf: ProjectionLeaf<'a>, position: NodePosition) {
    let position = position | WalkState::node_position(&leaf);
    state.register_change_rect(leaf, position);

    if let Some(next) = leaf.next_sibling() {
        visit_higher_node(state, next, NodePosition::ABOVE_FILTHY);
    } else if let Some(parent) = leaf.parent() {
        start_trip(state, parent);
    }

    state.register_need_rect(leaf, position);
}

fn visit_lower_node<'a>(state: &mut WalkState<'a>, leaf: ProjectionLeaf<'a>) {
    let mut current = Some(leaf);
    while let Some(leaf) = current {
        let position = NodePosition::BELOW_FILTHY | WalkState::node_position(&leaf);
        state.register_need_rect(leaf, position);
        current = leaf.prev_sibling();
    }
}
