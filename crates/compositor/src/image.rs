//! The image: layer graph, pending updates, signals and undo history
//!
//! Everything that edits an image goes through `&mut Image`; the scheduler
//! keeps it behind an `RwLock` and runs all edits on its worker thread.

use impasto_config::ImageConfig;
use tracing::{debug, trace, warn};

use crate::color::ColorSpace;
use crate::commands::{CommandError, UndoStack};
use crate::device::PaintDevice;
use crate::geometry::Rect;
use crate::merger::{MergeError, MergeReport, Merger};
use crate::node::{Node, NodeFactory, NodeGraph, NodeId, NodeKind};
use crate::projection_leaf::ProjectionLeaf;
use crate::scheduler::{UpdateKind, UpdateQueue, UpdateRequest};
use crate::signals::ImageSignal;
use crate::tiles::TilePool;
use crate::walker::{FullRefreshWalker, MergeWalker, RectsWalker, RefreshSubtreeWalker};

/// A layered image
///
/// Owns the node graph and everything needed to keep its projection
/// current:
/// 1. Edits mark nodes dirty with `set_dirty` and friends
/// 2. Requests collect in an update queue, overlapping ones merged
/// 3. `process_next_update` walks and merges one request at a time
/// 4. Observers drain the signal queue with `take_signals`
pub struct Image {
    /// Layer tree, rooted at a group layer
    graph: NodeGraph,
    /// Image rect; every walk is cropped to it
    bounds: Rect,
    /// Builds nodes sharing this image's color space and tile pool
    factory: NodeFactory,
    /// Dirty regions waiting for a merge
    pending: UpdateQueue,
    /// Signals not yet delivered to listeners
    signals: Vec<ImageSignal>,
    /// Committed strokes and commands
    undo_stack: UndoStack,
    /// Nesting depth of disabled projection notifications
    ui_updates_disabled: usize,
    /// Projection rect merged while notifications were disabled
    suppressed_rect: Rect,
}

impl Image {
    /// Empty RGBA image as described by `config`
    pub fn new(config: &ImageConfig) -> Self {
        Self::with_color_space(config, ColorSpace::Rgba8)
    }

    pub fn with_color_space(config: &ImageConfig, color_space: ColorSpace) -> Self {
        let pool = TilePool::new(config.tile_memory_limit);
        let factory = NodeFactory::new(color_space, pool);
        let graph = NodeGraph::new(factory.group_layer("root"));
        let bounds = Rect::new(0, 0, config.width_i32(), config.height_i32());
        debug!(
            "Created {}x{} image, tile limit {:?}",
            config.width, config.height, config.tile_memory_limit
        );
        Self {
            graph,
            bounds,
            factory,
            pending: UpdateQueue::new(),
            signals: Vec::new(),
            undo_stack: UndoStack::new(config.undo_limit),
            ui_updates_disabled: 0,
            suppressed_rect: Rect::EMPTY,
        }
    }

    #[inline]
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    #[inline]
    pub fn color_space(&self) -> ColorSpace {
        self.factory.color_space()
    }

    #[inline]
    pub fn factory(&self) -> &NodeFactory {
        &self.factory
    }

    #[inline]
    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    /// Direct graph access. Structural edits made here are neither undoable
    /// nor announced; commands are the normal route.
    #[inline]
    pub fn graph_mut(&mut self) -> &mut NodeGraph {
        &mut self.graph
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.graph.root()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.get(id)
    }

    /// Composited image
    pub fn projection(&self) -> Option<&PaintDevice> {
        self.graph.projection(self.graph.root())
    }

    /// Rect a node and its subtree can occupy in the image, including
    /// what its layer styles and masks spill over
    pub fn node_extent(&self, id: NodeId) -> Rect {
        let mut rect = Rect::EMPTY;
        for node_id in self.graph.descendants(id) {
            let Some(node) = self.graph.get(node_id).filter(|node| node.is_layer()) else {
                continue;
            };
            let mut own = node.original().map_or(Rect::EMPTY, PaintDevice::extent);
            if let Some(projection) = node.projection() {
                own |= projection.extent();
            }
            rect |= self
                .graph
                .outgoing_change_rect(node_id, self.graph.masks_change_rect(node_id, own));
        }
        rect & self.bounds
    }

    fn request(&mut self, node: NodeId, rect: Rect, kind: UpdateKind) {
        let rect = rect & self.bounds;
        if rect.is_empty() {
            return;
        }
        trace!("Dirty {} {:?} ({:?})", node, rect, kind);
        self.pending.push(UpdateRequest::new(node, rect, kind));
    }

    /// Mark `rect` of a node's content as changed
    pub fn set_dirty(&mut self, node: NodeId, rect: Rect) {
        self.request(node, rect, UpdateKind::Merge);
    }

    /// Mark the whole node as changed. A mask covers its layer's extent.
    pub fn set_dirty_node(&mut self, node: NodeId) {
        let layer = match self.graph.get(node) {
            Some(mask) if mask.is_mask() => mask.parent().unwrap_or(node),
            _ => node,
        };
        let rect = self.node_extent(layer);
        self.set_dirty(node, rect);
    }

    /// Tell a clone layer that `source_rect` of its source changed. The
    /// clone is dirtied over the same rect moved into its own position.
    pub fn set_dirty_original(&mut self, clone: NodeId, source_rect: Rect) {
        let Some(node) = self.graph.get(clone) else {
            warn!("Clone update for missing node {}", clone);
            return;
        };
        let Some((_, offset)) = node.clone_source() else {
            warn!("Node {} is not a clone layer", clone);
            return;
        };
        if !node.is_visible() {
            return;
        }
        self.set_dirty(clone, source_rect.translated_by(offset));
    }

    /// Recomposite a node's subtree in place
    pub fn refresh_subtree(&mut self, node: NodeId, rect: Rect) {
        self.request(node, rect, UpdateKind::RefreshSubtree);
    }

    /// Recomposite a node's subtree and everything above it
    pub fn full_refresh(&mut self, node: NodeId, rect: Rect) {
        self.request(node, rect, UpdateKind::FullRefresh);
    }

    /// Recomposite the whole image
    pub fn full_refresh_all(&mut self) {
        let root = self.root();
        self.full_refresh(root, self.bounds);
    }

    pub fn has_pending_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_updates(&self) -> impl Iterator<Item = &UpdateRequest> {
        self.pending.iter()
    }

    /// Walk and merge the oldest pending request
    pub fn process_next_update(&mut self) -> Result<Option<MergeReport>, MergeError> {
        let Some(request) = self.pending.pop() else {
            return Ok(None);
        };
        self.process_update(request).map(Some)
    }

    /// Drain the update queue, including the clone updates it produces
    pub fn process_all_updates(&mut self) -> Result<usize, MergeError> {
        let mut count = 0;
        while self.process_next_update()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    fn process_update(&mut self, request: UpdateRequest) -> Result<MergeReport, MergeError> {
        let UpdateRequest { node, rect, kind } = request;
        let (start, kind) = match ProjectionLeaf::new(&self.graph, node) {
            // a pass-through group has no projection of its own: its
            // children are recomposited into the nearest real parent
            Some(leaf) if leaf.node().is_some_and(Node::is_pass_through) => {
                match leaf.parent() {
                    Some(parent) => (parent.id(), UpdateKind::FullRefresh),
                    None => (node, kind),
                }
            }
            _ => (node, kind),
        };

        let walk = match kind {
            UpdateKind::Merge => MergeWalker::new(self.bounds).collect_rects(&self.graph, start, rect),
            UpdateKind::RefreshSubtree => {
                RefreshSubtreeWalker::new(self.bounds).collect_rects(&self.graph, start, rect)
            }
            UpdateKind::FullRefresh => {
                FullRefreshWalker::new(self.bounds).collect_rects(&self.graph, start, rect)
            }
        };
        let notifications = walk.clone_notifications().to_vec();
        let report = Merger::new().merge(&mut self.graph, walk)?;

        for notification in notifications {
            for clone in self.graph.clones_of(notification.source) {
                self.set_dirty_original(clone, notification.rect);
            }
        }

        if !report.root_rect.is_empty() {
            if self.ui_updates_enabled() {
                self.emit(ImageSignal::ProjectionUpdated {
                    rect: report.root_rect,
                });
            } else {
                self.suppressed_rect |= report.root_rect;
            }
        }
        Ok(report)
    }

    pub fn disable_ui_updates(&mut self) {
        self.ui_updates_disabled += 1;
    }

    /// Re-enable projection notifications. The last matching call reports
    /// everything merged in the meantime as one update.
    pub fn enable_ui_updates(&mut self) {
        if self.ui_updates_disabled == 0 {
            warn!("UI updates enabled more often than disabled");
            return;
        }
        self.ui_updates_disabled -= 1;
        if self.ui_updates_disabled == 0 && !self.suppressed_rect.is_empty() {
            let rect = std::mem::replace(&mut self.suppressed_rect, Rect::EMPTY);
            self.emit(ImageSignal::ProjectionUpdated { rect });
        }
    }

    pub fn ui_updates_enabled(&self) -> bool {
        self.ui_updates_disabled == 0
    }

    /// Queue a signal for the listeners
    pub fn emit(&mut self, signal: ImageSignal) {
        self.signals.push(signal);
    }

    pub fn take_signals(&mut self) -> Vec<ImageSignal> {
        std::mem::take(&mut self.signals)
    }

    #[inline]
    pub fn undo_stack(&self) -> &UndoStack {
        &self.undo_stack
    }

    #[inline]
    pub fn undo_stack_mut(&mut self) -> &mut UndoStack {
        &mut self.undo_stack
    }

    /// Revert the newest committed command. Returns false when there was
    /// nothing to undo.
    pub fn undo(&mut self) -> Result<bool, CommandError> {
        let Some(mut command) = self.undo_stack.take_undo() else {
            debug!("Undo: no entries available");
            return Ok(false);
        };
        debug!("Undoing '{}'", command.text());
        command.undo(self)?;
        self.undo_stack.push_undone(command);
        self.announce_history();
        Ok(true)
    }

    /// Re-apply the newest undone command
    pub fn redo(&mut self) -> Result<bool, CommandError> {
        let Some(mut command) = self.undo_stack.take_redo() else {
            debug!("Redo: no entries available");
            return Ok(false);
        };
        debug!("Redoing '{}'", command.text());
        command.redo(self)?;
        self.undo_stack.push_redone(command);
        self.announce_history();
        Ok(true)
    }

    pub(crate) fn announce_history(&mut self) {
        self.emit(ImageSignal::Modified);
        self.emit(ImageSignal::UndoStackChanged {
            undo_count: self.undo_stack.undo_count(),
            redo_count: self.undo_stack.redo_count(),
        });
    }

    /// Copy of the layer tree for later comparison. Devices are shared
    /// copy-on-write, so this is cheap.
    pub fn snapshot(&self) -> ImageSnapshot {
        ImageSnapshot {
            graph: self.graph.clone(),
        }
    }

    /// Deep comparison of the current tree against a snapshot
    pub fn matches_snapshot(&self, snapshot: &ImageSnapshot) -> bool {
        graphs_equal(&self.graph, &snapshot.graph)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("bounds", &self.bounds)
            .field("nodes", &self.graph.len())
            .field("pending_updates", &self.pending.len())
            .field("undo_count", &self.undo_stack.undo_count())
            .finish()
    }
}

/// Frozen copy of an image's layer tree
#[derive(Debug, Clone)]
pub struct ImageSnapshot {
    graph: NodeGraph,
}

impl ImageSnapshot {
    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn content_eq(&self, other: &ImageSnapshot) -> bool {
        graphs_equal(&self.graph, &other.graph)
    }
}

fn devices_equal(a: Option<&PaintDevice>, b: Option<&PaintDevice>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.offset() == b.offset() && a.content_eq(b),
        (None, None) => true,
        _ => false,
    }
}

fn kinds_equal(a: &NodeKind, b: &NodeKind) -> bool {
    use NodeKind::*;
    match (a, b) {
        (PaintLayer { device: a }, PaintLayer { device: b })
        | (ShapeLayer { device: a }, ShapeLayer { device: b }) => devices_equal(Some(a), Some(b)),
        (
            GroupLayer {
                original: a,
                pass_through: pa,
            },
            GroupLayer {
                original: b,
                pass_through: pb,
            },
        ) => pa == pb && devices_equal(Some(a), Some(b)),
        (
            AdjustmentLayer {
                filter: fa,
                original: a,
                selection: sa,
            },
            AdjustmentLayer {
                filter: fb,
                original: b,
                selection: sb,
            },
        ) => fa == fb && devices_equal(Some(a), Some(b)) && devices_equal(sa.as_ref(), sb.as_ref()),
        (
            GeneratorLayer {
                generator: ga,
                original: a,
                selection: sa,
            },
            GeneratorLayer {
                generator: gb,
                original: b,
                selection: sb,
            },
        ) => ga == gb && devices_equal(Some(a), Some(b)) && devices_equal(sa.as_ref(), sb.as_ref()),
        (
            CloneLayer {
                source: sa,
                offset: oa,
                original: a,
            },
            CloneLayer {
                source: sb,
                offset: ob,
                original: b,
            },
        ) => sa == sb && oa == ob && devices_equal(Some(a), Some(b)),
        (
            FilterMask {
                filter: fa,
                selection: sa,
            },
            FilterMask {
                filter: fb,
                selection: sb,
            },
        ) => fa == fb && devices_equal(sa.as_ref(), sb.as_ref()),
        (TransparencyMask { selection: a }, TransparencyMask { selection: b }) => {
            devices_equal(Some(a), Some(b))
        }
        (
            SelectionMask {
                selection: a,
                active: aa,
            },
            SelectionMask {
                selection: b,
                active: ab,
            },
        ) => aa == ab && devices_equal(Some(a), Some(b)),
        (TransformMask { offset: a }, TransformMask { offset: b }) => a == b,
        (
            ColorizeMask {
                color: ca,
                amount: aa,
            },
            ColorizeMask {
                color: cb,
                amount: ab,
            },
        ) => ca == cb && aa == ab,
        _ => false,
    }
}

fn graphs_equal(a: &NodeGraph, b: &NodeGraph) -> bool {
    if a.root() != b.root() || a.len() != b.len() {
        return false;
    }
    a.ids().all(|id| {
        let (Some(x), Some(y)) = (a.get(id), b.get(id)) else {
            return false;
        };
        x.parent() == y.parent()
            && x.children() == y.children()
            && x.properties() == y.properties()
            && x.layer_style() == y.layer_style()
            && kinds_equal(x.kind(), y.kind())
            && devices_equal(x.separate_projection(), y.separate_projection())
    })
}
