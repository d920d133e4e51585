//! Dirty-rect walkers
//!
//! Given a filthy node and a requested rect, a walker visits the leaves
//! whose output the change reaches and records, per leaf, the rect it must
//! be recomputed over. The result is a [`WalkGraph`] whose job stack the
//! merger executes from the top: the last job pushed runs first.
//!
//! Change rects are registered on the way up before recursing further, need
//! rects on the way back down after every higher leaf is done. A leaf's need
//! rect depends on the change rects of everything above it, so the order is
//! load-bearing.

mod merge;
mod refresh;

use std::ops::{BitOr, BitOrAssign};

use tracing::trace;

use crate::geometry::Rect;
use crate::node::{NodeGraph, NodeId};
use crate::projection_leaf::ProjectionLeaf;

pub use merge::MergeWalker;
pub use refresh::{FullRefreshWalker, RefreshSubtreeWalker};

/// Where a leaf sits relative to the filthy node, plus stack-edge markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodePosition(u32);

impl NodePosition {
    pub const NONE: NodePosition = NodePosition(0);
    pub const FILTHY: NodePosition = NodePosition(1);
    pub const ABOVE_FILTHY: NodePosition = NodePosition(1 << 1);
    pub const BELOW_FILTHY: NodePosition = NodePosition(1 << 2);
    /// The layer's own content is intact but its masks changed
    pub const FILTHY_PROJECTION: NodePosition = NodePosition(1 << 3);
    pub const TOPMOST: NodePosition = NodePosition(1 << 4);
    pub const BOTTOMMOST: NodePosition = NodePosition(1 << 5);
    /// Recalculated in place, never composited into a parent
    pub const EXTRA: NodePosition = NodePosition(1 << 6);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Every bit of `other` is set
    #[inline]
    pub const fn contains(self, other: NodePosition) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    #[inline]
    pub const fn intersects(self, other: NodePosition) -> bool {
        self.0 & other.0 != 0
    }

    /// Position relative to the filthy node only, as the projection plane
    /// rect functions expect it
    pub fn to_filthy(self) -> NodePosition {
        if self.contains(Self::EXTRA) {
            Self::FILTHY
        } else {
            NodePosition(self.0 & !(Self::TOPMOST.0 | Self::BOTTOMMOST.0))
        }
    }
}

impl BitOr for NodePosition {
    type Output = NodePosition;

    fn bitor(self, rhs: NodePosition) -> NodePosition {
        NodePosition(self.0 | rhs.0)
    }
}

impl BitOrAssign for NodePosition {
    fn bitor_assign(&mut self, rhs: NodePosition) {
        self.0 |= rhs.0;
    }
}

/// One entry of the merge stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobItem {
    pub node: NodeId,
    pub position: NodePosition,
    pub apply_rect: Rect,
}

/// A source whose clones must be told about a change of `rect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneNotification {
    pub source: NodeId,
    pub rect: Rect,
}

/// Registration events in the order the walker made them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Change(NodeId),
    Need(NodeId),
}

/// Result of one walker invocation
#[derive(Debug, Clone, Default)]
pub struct WalkGraph {
    start_node: Option<NodeId>,
    requested_rect: Rect,
    crop_rect: Rect,
    jobs: Vec<JobItem>,
    change_rect: Rect,
    uncropped_change_rect: Rect,
    need_rect: Rect,
    access_rect: Rect,
    change_rect_varies: bool,
    need_rect_varies: bool,
    clone_notifications: Vec<CloneNotification>,
    trace: Vec<Registration>,
}

impl WalkGraph {
    /// Walk with no jobs, used when the start node is stale
    pub fn empty(start: NodeId, requested: Rect, crop: Rect) -> Self {
        Self {
            start_node: Some(start),
            requested_rect: requested,
            crop_rect: crop,
            ..Self::default()
        }
    }

    #[inline]
    pub fn start_node(&self) -> Option<NodeId> {
        self.start_node
    }

    #[inline]
    pub fn requested_rect(&self) -> Rect {
        self.requested_rect
    }

    #[inline]
    pub fn crop_rect(&self) -> Rect {
        self.crop_rect
    }

    /// Job stack, bottom first. The merger pops from the end.
    pub fn jobs(&self) -> &[JobItem] {
        &self.jobs
    }

    /// Jobs in the order the merger executes them
    pub fn execution_order(&self) -> impl Iterator<Item = &JobItem> {
        self.jobs.iter().rev()
    }

    pub fn job_for(&self, node: NodeId) -> Option<&JobItem> {
        self.jobs.iter().find(|job| job.node == node)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Rect of the image projection that changes
    #[inline]
    pub fn change_rect(&self) -> Rect {
        self.change_rect
    }

    #[inline]
    pub fn uncropped_change_rect(&self) -> Rect {
        self.uncropped_change_rect
    }

    #[inline]
    pub fn need_rect(&self) -> Rect {
        self.need_rect
    }

    #[inline]
    pub fn access_rect(&self) -> Rect {
        self.access_rect
    }

    #[inline]
    pub fn change_rect_varies(&self) -> bool {
        self.change_rect_varies
    }

    #[inline]
    pub fn need_rect_varies(&self) -> bool {
        self.need_rect_varies
    }

    pub fn clone_notifications(&self) -> &[CloneNotification] {
        &self.clone_notifications
    }

    /// Change and need registrations in the order they happened
    pub fn trace(&self) -> &[Registration] {
        &self.trace
    }

    pub(crate) fn pop_job(&mut self) -> Option<JobItem> {
        self.jobs.pop()
    }
}

/// A walker strategy: fills a [`WalkGraph`] for a start node
pub trait RectsWalker {
    fn collect_rects(&self, graph: &NodeGraph, start: NodeId, requested: Rect) -> WalkGraph;
}

/// Mutable state shared by every walker variant during one walk
pub(crate) struct WalkState<'a> {
    graph: &'a NodeGraph,
    walk: WalkGraph,
    last_need_rect: Rect,
    child_need_rect: Rect,
}

impl<'a> WalkState<'a> {
    pub(crate) fn new(graph: &'a NodeGraph, start: NodeId, requested: Rect, crop: Rect) -> Self {
        let mut walk = WalkGraph::empty(start, requested, crop);
        walk.change_rect = requested;
        walk.uncropped_change_rect = requested;
        Self {
            graph,
            walk,
            last_need_rect: Rect::EMPTY,
            child_need_rect: Rect::EMPTY,
        }
    }

    pub(crate) fn leaf(&self, id: NodeId) -> Option<ProjectionLeaf<'a>> {
        ProjectionLeaf::new(self.graph, id)
    }

    #[inline]
    fn crop(&self, rect: Rect) -> Rect {
        rect & self.walk.crop_rect
    }

    /// Set both change rects explicitly, as the refresh walkers do
    pub(crate) fn set_explicit_change_rect(&mut self, rect: Rect) {
        self.walk.change_rect = self.crop(rect);
        self.walk.uncropped_change_rect = rect;
    }

    pub(crate) fn node_position(leaf: &ProjectionLeaf<'_>) -> NodePosition {
        let mut position = NodePosition::NONE;
        if leaf.next_sibling().is_none() {
            position |= NodePosition::TOPMOST;
        }
        if leaf.prev_sibling().is_none() {
            position |= NodePosition::BOTTOMMOST;
        }
        position
    }

    pub(crate) fn register_change_rect(&mut self, leaf: ProjectionLeaf<'a>, position: NodePosition) {
        if !leaf.is_layer() {
            return;
        }
        if !position.contains(NodePosition::FILTHY) && !leaf.visible() {
            return;
        }
        self.walk.trace.push(Registration::Change(leaf.id()));

        let filthy = position.to_filthy();
        let change = self.crop(self.graph.change_rect(leaf.id(), self.walk.change_rect, filthy));
        self.walk.change_rect_varies |= change != self.walk.change_rect;
        self.walk.change_rect = change;
        self.walk.uncropped_change_rect =
            self.graph
                .change_rect(leaf.id(), self.walk.uncropped_change_rect, filthy);
        trace!("Change rect of {} ({:?}) -> {:?}", leaf.id(), position, change);

        self.register_clone_notification(leaf, position);
    }

    /// Chain a filthy mask's change through the visible masks after it
    pub(crate) fn adjust_masks_change_rect(&mut self, first_mask: ProjectionLeaf<'a>) {
        let mut current = first_mask.next_sibling();
        while let Some(mask) = current {
            if mask.visible() {
                if let Some(node) = mask.node() {
                    let change = node.mask_change_rect(self.walk.change_rect);
                    self.walk.change_rect_varies |= change != self.walk.change_rect;
                    self.walk.change_rect = change;
                    self.walk.uncropped_change_rect = change;
                }
            }
            current = mask.next_sibling();
        }
        if let Some(parent) = first_mask.parent() {
            self.register_clone_notification(parent, NodePosition::FILTHY_PROJECTION);
        }
    }

    pub(crate) fn register_clone_notification(&mut self, leaf: ProjectionLeaf<'a>, position: NodePosition) {
        let notifies = NodePosition::FILTHY | NodePosition::FILTHY_PROJECTION | NodePosition::EXTRA;
        if !position.intersects(notifies) || !leaf.has_clones() {
            return;
        }
        let notification = CloneNotification {
            source: leaf.id(),
            rect: self.walk.uncropped_change_rect,
        };
        if !self.walk.clone_notifications.contains(&notification) {
            self.walk.clone_notifications.push(notification);
        }
    }

    fn push_job(&mut self, leaf: ProjectionLeaf<'a>, position: NodePosition, apply_rect: Rect) {
        trace!("Push {} {:?} apply {:?}", leaf.id(), position, apply_rect);
        self.walk.jobs.push(JobItem {
            node: leaf.id(),
            position,
            apply_rect,
        });
    }

    pub(crate) fn register_need_rect(&mut self, leaf: ProjectionLeaf<'a>, position: NodePosition) {
        if !leaf.is_layer() {
            return;
        }
        self.walk.trace.push(Registration::Need(leaf.id()));

        if self.walk.jobs.is_empty() {
            let change = self.walk.change_rect;
            self.walk.access_rect = change;
            self.walk.need_rect = change;
            self.child_need_rect = change;
            self.last_need_rect = change;
        }

        if position.contains(NodePosition::TOPMOST) {
            if let Some(parent) = leaf.parent() {
                let parent_job = self
                    .walk
                    .jobs
                    .iter()
                    .rev()
                    .find(|job| job.node == parent.id())
                    .copied();
                self.last_need_rect = match parent_job {
                    Some(job) => self.graph.need_rect_for_original(job.node, job.apply_rect),
                    None => self.child_need_rect,
                };
            }
        }

        let filthy = position.to_filthy();
        if !leaf.should_be_rendered() {
            if !self.last_need_rect.is_empty() {
                self.push_job(leaf, position, self.last_need_rect);
            }
        } else if position.intersects(NodePosition::FILTHY | NodePosition::ABOVE_FILTHY | NodePosition::EXTRA) {
            if !self.last_need_rect.is_empty() {
                self.push_job(leaf, position, self.last_need_rect);
            }
            self.walk.access_rect |= self.graph.access_rect(leaf.id(), self.last_need_rect, filthy);
            self.last_need_rect = self.crop(self.graph.need_rect(leaf.id(), self.last_need_rect, filthy));
            self.child_need_rect = self.last_need_rect;
        } else if !self.last_need_rect.is_empty() {
            self.push_job(leaf, position, self.last_need_rect);
            self.walk.access_rect |= self.graph.access_rect(leaf.id(), self.last_need_rect, filthy);
            self.last_need_rect = self.crop(self.graph.need_rect(leaf.id(), self.last_need_rect, filthy));
        }

        self.walk.need_rect_varies |= self.walk.need_rect != self.last_need_rect;
        self.walk.need_rect |= self.last_need_rect;
    }

    pub(crate) fn finish(self) -> WalkGraph {
        self.walk
    }
}
