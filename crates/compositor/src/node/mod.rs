//! Layer and mask nodes
//!
//! Nodes live in a [`NodeGraph`] keyed by [`NodeId`]. Parents own their
//! children by id; a clone layer refers to its source by id only, and the
//! source keeps a list of clone ids that is never an ownership edge.
//!
//! The variant set is closed: every algorithm matches on [`NodeKind`]
//! exhaustively instead of dispatching through a type hierarchy.

mod clones;
mod graph;
mod projection_plane;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::IVec2;
use thiserror::Error;

use crate::color::{ChannelFlags, ColorSpace};
use crate::composite::CompositeOp;
use crate::constants::OPACITY_OPAQUE;
use crate::device::PaintDevice;
use crate::filter::Filter;
use crate::generator::Generator;
use crate::tiles::TilePool;

pub use graph::{NodeGraph, Subtree};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identifier. Ids are never reused, so an id that
/// outlived its node simply resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors raised by structural edits of the node graph
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    NotFound(NodeId),

    #[error("node {0} is already in the graph")]
    AlreadyPresent(NodeId),

    #[error("node {0} cannot hold this child")]
    InvalidParent(NodeId),

    #[error("the root node cannot be detached or moved")]
    RootLocked,

    #[error("index {index} out of range for {len} children")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cloning {original} into {clone} would create a cycle")]
    CloneCycle { original: NodeId, clone: NodeId },

    #[error("node {0} is not a clone layer")]
    NotAClone(NodeId),
}

/// Properties every node carries
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProperties {
    pub name: String,
    pub visible: bool,
    pub opacity: u8,
    pub composite_op: CompositeOp,
    pub channel_flags: ChannelFlags,
}

impl NodeProperties {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            opacity: OPACITY_OPAQUE,
            composite_op: CompositeOp::Over,
            channel_flags: ChannelFlags::ALL,
        }
    }
}

/// Drop shadow rendered behind a layer's projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerStyle {
    pub shadow_offset: IVec2,
    pub shadow_color: [u8; 4],
    pub shadow_opacity: u8,
}

/// Variant-specific node data
#[derive(Debug, Clone)]
pub enum NodeKind {
    PaintLayer {
        device: PaintDevice,
    },
    GroupLayer {
        original: PaintDevice,
        pass_through: bool,
    },
    /// Filters the composite of everything below it
    AdjustmentLayer {
        filter: Filter,
        original: PaintDevice,
        selection: Option<PaintDevice>,
    },
    GeneratorLayer {
        generator: Generator,
        original: PaintDevice,
        selection: Option<PaintDevice>,
    },
    /// Shows the projection of `source` shifted by `offset`
    CloneLayer {
        source: NodeId,
        offset: IVec2,
        original: PaintDevice,
    },
    /// Rasterized output of an external vector engine
    ShapeLayer {
        device: PaintDevice,
    },
    FilterMask {
        filter: Filter,
        selection: Option<PaintDevice>,
    },
    TransparencyMask {
        selection: PaintDevice,
    },
    /// Global selection holder; not part of the projection
    SelectionMask {
        selection: PaintDevice,
        active: bool,
    },
    TransformMask {
        offset: IVec2,
    },
    ColorizeMask {
        color: [u8; 4],
        amount: u8,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::PaintLayer { .. } => "paint_layer",
            NodeKind::GroupLayer { .. } => "group_layer",
            NodeKind::AdjustmentLayer { .. } => "adjustment_layer",
            NodeKind::GeneratorLayer { .. } => "generator_layer",
            NodeKind::CloneLayer { .. } => "clone_layer",
            NodeKind::ShapeLayer { .. } => "shape_layer",
            NodeKind::FilterMask { .. } => "filter_mask",
            NodeKind::TransparencyMask { .. } => "transparency_mask",
            NodeKind::SelectionMask { .. } => "selection_mask",
            NodeKind::TransformMask { .. } => "transform_mask",
            NodeKind::ColorizeMask { .. } => "colorize_mask",
        }
    }

    pub fn is_mask(&self) -> bool {
        matches!(
            self,
            NodeKind::FilterMask { .. }
                | NodeKind::TransparencyMask { .. }
                | NodeKind::SelectionMask { .. }
                | NodeKind::TransformMask { .. }
                | NodeKind::ColorizeMask { .. }
        )
    }

    /// Masks that take part in the owning layer's projection
    pub fn is_effect_mask(&self) -> bool {
        self.is_mask() && !matches!(self, NodeKind::SelectionMask { .. })
    }
}

/// One layer or mask
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    props: NodeProperties,
    kind: NodeKind,
    clones: Vec<NodeId>,
    layer_style: Option<LayerStyle>,
    projection: Option<PaintDevice>,
}

impl Node {
    /// Detached node with a fresh id
    pub fn new(props: NodeProperties, kind: NodeKind) -> Self {
        Self {
            id: NodeId::next(),
            parent: None,
            children: Vec::new(),
            props,
            kind,
            clones: Vec::new(),
            layer_style: None,
            projection: None,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[inline]
    pub fn properties(&self) -> &NodeProperties {
        &self.props
    }

    pub fn properties_mut(&mut self) -> &mut NodeProperties {
        &mut self.props
    }

    #[inline]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.props.name
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.props.visible
    }

    #[inline]
    pub fn opacity(&self) -> u8 {
        self.props.opacity
    }

    #[inline]
    pub fn composite_op(&self) -> CompositeOp {
        self.props.composite_op
    }

    #[inline]
    pub fn channel_flags(&self) -> &ChannelFlags {
        &self.props.channel_flags
    }

    #[inline]
    pub fn layer_style(&self) -> Option<&LayerStyle> {
        self.layer_style.as_ref()
    }

    pub fn set_layer_style(&mut self, style: Option<LayerStyle>) {
        self.layer_style = style;
    }

    pub fn is_mask(&self) -> bool {
        self.kind.is_mask()
    }

    pub fn is_layer(&self) -> bool {
        !self.kind.is_mask()
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::GroupLayer { .. })
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self.kind, NodeKind::GroupLayer { pass_through: true, .. })
    }

    /// Adjustment layers read the composite of the nodes under them
    pub fn depends_on_lower_nodes(&self) -> bool {
        matches!(self.kind, NodeKind::AdjustmentLayer { .. })
    }

    /// Unprocessed content; masks have none
    pub fn original(&self) -> Option<&PaintDevice> {
        match &self.kind {
            NodeKind::PaintLayer { device } | NodeKind::ShapeLayer { device } => Some(device),
            NodeKind::GroupLayer { original, .. }
            | NodeKind::AdjustmentLayer { original, .. }
            | NodeKind::GeneratorLayer { original, .. }
            | NodeKind::CloneLayer { original, .. } => Some(original),
            _ => None,
        }
    }

    pub fn original_mut(&mut self) -> Option<&mut PaintDevice> {
        match &mut self.kind {
            NodeKind::PaintLayer { device } | NodeKind::ShapeLayer { device } => Some(device),
            NodeKind::GroupLayer { original, .. }
            | NodeKind::AdjustmentLayer { original, .. }
            | NodeKind::GeneratorLayer { original, .. }
            | NodeKind::CloneLayer { original, .. } => Some(original),
            _ => None,
        }
    }

    /// Selection restricting where an adjustment or generator layer applies
    pub fn internal_selection(&self) -> Option<&PaintDevice> {
        match &self.kind {
            NodeKind::AdjustmentLayer { selection, .. }
            | NodeKind::GeneratorLayer { selection, .. } => selection.as_ref(),
            _ => None,
        }
    }

    /// True when the projection must be a separate device even without masks
    pub fn needs_projection(&self) -> bool {
        self.internal_selection().is_some() || self.layer_style.is_some()
    }

    /// Separate projection device, if one has been produced
    pub fn separate_projection(&self) -> Option<&PaintDevice> {
        self.projection.as_ref()
    }

    /// Composited output: the separate projection, or the original itself
    pub fn projection(&self) -> Option<&PaintDevice> {
        self.projection.as_ref().or_else(|| self.original())
    }

    /// Source and offset of a clone layer
    pub fn clone_source(&self) -> Option<(NodeId, IVec2)> {
        match &self.kind {
            NodeKind::CloneLayer { source, offset, .. } => Some((*source, *offset)),
            _ => None,
        }
    }

    /// Ids of clone layers registered on this node
    #[inline]
    pub fn registered_clones(&self) -> &[NodeId] {
        &self.clones
    }

    pub(crate) fn set_projection(&mut self, projection: Option<PaintDevice>) {
        self.projection = projection;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.props.name)
            .field("kind", &self.kind.name())
            .field("parent", &self.parent)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Builds detached nodes whose devices share an image's color space and
/// tile pool
#[derive(Debug, Clone)]
pub struct NodeFactory {
    color_space: ColorSpace,
    pool: TilePool,
}

impl NodeFactory {
    pub fn new(color_space: ColorSpace, pool: TilePool) -> Self {
        Self { color_space, pool }
    }

    #[inline]
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// Empty device in the image color space
    pub fn device(&self) -> PaintDevice {
        PaintDevice::with_pool(self.color_space, self.pool.clone())
    }

    /// Empty alpha device for selections
    pub fn selection(&self) -> PaintDevice {
        PaintDevice::with_pool(ColorSpace::Alpha8, self.pool.clone())
    }

    pub fn paint_layer(&self, name: &str) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::PaintLayer {
                device: self.device(),
            },
        )
    }

    /// Paint layer around existing content
    pub fn paint_layer_with(&self, name: &str, device: PaintDevice) -> Node {
        Node::new(NodeProperties::named(name), NodeKind::PaintLayer { device })
    }

    pub fn group_layer(&self, name: &str) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::GroupLayer {
                original: self.device(),
                pass_through: false,
            },
        )
    }

    pub fn pass_through_group(&self, name: &str) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::GroupLayer {
                original: self.device(),
                pass_through: true,
            },
        )
    }

    pub fn adjustment_layer(&self, name: &str, filter: Filter) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::AdjustmentLayer {
                filter,
                original: self.device(),
                selection: None,
            },
        )
    }

    pub fn generator_layer(&self, name: &str, generator: Generator) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::GeneratorLayer {
                generator,
                original: self.device(),
                selection: None,
            },
        )
    }

    /// Clone layer; inserting it registers it with its source
    pub fn clone_layer(&self, name: &str, source: NodeId, offset: IVec2) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::CloneLayer {
                source,
                offset,
                original: self.device(),
            },
        )
    }

    pub fn shape_layer(&self, name: &str) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::ShapeLayer {
                device: self.device(),
            },
        )
    }

    pub fn filter_mask(&self, name: &str, filter: Filter) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::FilterMask {
                filter,
                selection: None,
            },
        )
    }

    /// Transparency mask; an empty selection hides the whole layer
    pub fn transparency_mask(&self, name: &str, selection: PaintDevice) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::TransparencyMask { selection },
        )
    }

    pub fn selection_mask(&self, name: &str) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::SelectionMask {
                selection: self.selection(),
                active: true,
            },
        )
    }

    pub fn transform_mask(&self, name: &str, offset: IVec2) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::TransformMask { offset },
        )
    }

    pub fn colorize_mask(&self, name: &str, color: [u8; 4], amount: u8) -> Node {
        Node::new(
            NodeProperties::named(name),
            NodeKind::ColorizeMask { color, amount },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = NodeId::next();
        let b = NodeId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_kind_classification() {
        let factory = NodeFactory::new(ColorSpace::Rgba8, TilePool::unlimited());
        let layer = factory.paint_layer("paint");
        let selection = factory.selection_mask("selection");
        let filter = factory.filter_mask("blur", Filter::BoxBlur { radius: 2 });

        assert!(layer.is_layer());
        assert!(layer.original().is_some());
        assert!(selection.is_mask() && !selection.kind().is_effect_mask());
        assert!(filter.kind().is_effect_mask());
        assert!(filter.original().is_none());
        assert!(factory.pass_through_group("pt").is_pass_through());
        assert!(!factory.group_layer("g").is_pass_through());
    }

    #[test]
    fn test_projection_falls_back_to_original() {
        let factory = NodeFactory::new(ColorSpace::Rgba8, TilePool::unlimited());
        let mut layer = factory.adjustment_layer("adj", Filter::Invert);
        assert!(layer.separate_projection().is_none());
        assert!(layer.projection().is_some());
        assert!(layer.depends_on_lower_nodes());
        assert!(!layer.needs_projection());

        if let NodeKind::AdjustmentLayer { selection, .. } = layer.kind_mut() {
            *selection = Some(factory.selection());
        }
        assert!(layer.needs_projection());
    }
}
