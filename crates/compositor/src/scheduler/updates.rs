//! Pending dirty-region requests
//!
//! Requests for the same node and walker kind whose rects overlap collapse
//! into one request covering their union, so a burst of small edits costs a
//! single walk.

use std::collections::VecDeque;

use tracing::trace;

use crate::geometry::Rect;
use crate::node::NodeId;

/// Which walker serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Minimal update upwards from the node
    Merge,
    /// Recomposite the node's subtree in place
    RefreshSubtree,
    /// Recomposite the subtree, then propagate upwards
    FullRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub node: NodeId,
    pub rect: Rect,
    pub kind: UpdateKind,
}

impl UpdateRequest {
    pub fn new(node: NodeId, rect: Rect, kind: UpdateKind) -> Self {
        Self { node, rect, kind }
    }

    fn absorbs(&self, other: &UpdateRequest) -> bool {
        self.node == other.node && self.kind == other.kind && self.rect.intersects(&other.rect)
    }
}

/// FIFO of update requests with overlap merging
#[derive(Debug, Clone, Default)]
pub struct UpdateQueue {
    requests: VecDeque<UpdateRequest>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request, folding in every queued request it overlaps.
    /// Requests with empty rects are dropped.
    pub fn push(&mut self, request: UpdateRequest) {
        if request.rect.is_empty() {
            return;
        }
        let mut merged = request;
        while let Some(index) = self.requests.iter().position(|queued| merged.absorbs(queued)) {
            if let Some(queued) = self.requests.remove(index) {
                trace!("Merging update {:?} into {:?}", queued.rect, merged.rect);
                merged.rect |= queued.rect;
            }
        }
        self.requests.push_back(merged);
    }

    pub fn pop(&mut self) -> Option<UpdateRequest> {
        self.requests.pop_front()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateRequest> {
        self.requests.iter()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_requests_merge() {
        let node = NodeId::next();
        let other = NodeId::next();
        let mut queue = UpdateQueue::new();
        queue.push(UpdateRequest::new(node, Rect::new(0, 0, 10, 10), UpdateKind::Merge));
        queue.push(UpdateRequest::new(node, Rect::new(20, 0, 10, 10), UpdateKind::Merge));
        queue.push(UpdateRequest::new(other, Rect::new(5, 5, 10, 10), UpdateKind::Merge));
        queue.push(UpdateRequest::new(node, Rect::new(5, 5, 10, 10), UpdateKind::FullRefresh));
        assert_eq!(queue.len(), 4);

        // bridges the first two
        queue.push(UpdateRequest::new(node, Rect::new(5, 0, 20, 5), UpdateKind::Merge));
        assert_eq!(queue.len(), 3);
        let merged = queue
            .iter()
            .find(|r| r.node == node && r.kind == UpdateKind::Merge)
            .unwrap();
        assert_eq!(merged.rect, Rect::new(0, 0, 30, 10));
    }

    #[test]
    fn test_empty_requests_are_dropped() {
        let mut queue = UpdateQueue::new();
        queue.push(UpdateRequest::new(NodeId::next(), Rect::EMPTY, UpdateKind::Merge));
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
