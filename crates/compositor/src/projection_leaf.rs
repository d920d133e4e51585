//! Pass-through aware view over the node graph
//!
//! A [`ProjectionLeaf`] answers parent, child and sibling queries as the
//! walkers need them: pass-through groups disappear and their children
//! behave as children of the nearest ancestor that really composites. The
//! view holds no state of its own, so toggling pass-through mode never
//! invalidates anything.

use crate::color::ChannelFlags;
use crate::composite::{CompositeOp, mul_u8};
use crate::device::PaintDevice;
use crate::node::{Node, NodeGraph, NodeId};

#[derive(Clone, Copy)]
pub struct ProjectionLeaf<'a> {
    graph: &'a NodeGraph,
    id: NodeId,
}

impl<'a> ProjectionLeaf<'a> {
    /// Leaf for `id`, or `None` when the node is not in the graph
    pub fn new(graph: &'a NodeGraph, id: NodeId) -> Option<Self> {
        graph.contains(id).then_some(Self { graph, id })
    }

    fn wrap(&self, id: NodeId) -> Option<Self> {
        Self::new(self.graph, id)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Wrapped node. Leaves are only created for ids present in the graph.
    pub fn node(&self) -> Option<&'a Node> {
        self.graph.get(self.id)
    }

    pub fn is_root(&self) -> bool {
        self.id == self.graph.root()
    }

    pub fn is_layer(&self) -> bool {
        self.node().is_some_and(Node::is_layer)
    }

    pub fn is_mask(&self) -> bool {
        self.node().is_some_and(Node::is_mask)
    }

    fn is_pass_through(&self) -> bool {
        self.node().is_some_and(Node::is_pass_through)
    }

    /// Parent for compositing purposes. Masks report their layer; layers
    /// skip pass-through groups.
    pub fn parent(&self) -> Option<Self> {
        let node = self.node()?;
        let mut parent = self.wrap(node.parent()?)?;
        if node.is_mask() {
            return Some(parent);
        }
        while parent.is_pass_through() {
            parent = parent.wrap(parent.node()?.parent()?)?;
        }
        Some(parent)
    }

    /// Layer children with pass-through groups replaced by their contents,
    /// bottom to top
    pub fn children(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_children(self.id, &mut out);
        out
    }

    fn collect_children(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for child in self.graph.layer_children(id) {
            if self.graph.get(child).is_some_and(Node::is_pass_through) {
                self.collect_children(child, out);
            } else {
                out.push(child);
            }
        }
    }

    pub fn first_child(&self) -> Option<Self> {
        self.children().first().and_then(|id| self.wrap(*id))
    }

    pub fn last_child(&self) -> Option<Self> {
        self.children().last().and_then(|id| self.wrap(*id))
    }

    pub fn has_child_layers(&self) -> bool {
        !self.children().is_empty()
    }

    /// Siblings this leaf is ordered among: the effect masks of the layer
    /// for a mask, the flattened children of the parent for a layer
    fn siblings(&self) -> Vec<NodeId> {
        let Some(parent) = self.parent() else {
            return Vec::new();
        };
        if self.is_mask() {
            self.graph.effect_masks(parent.id)
        } else {
            parent.children()
        }
    }

    fn sibling_at(&self, delta: isize) -> Option<Self> {
        let siblings = self.siblings();
        let index = siblings.iter().position(|id| *id == self.id)?;
        let target = index.checked_add_signed(delta)?;
        siblings.get(target).and_then(|id| self.wrap(*id))
    }

    /// Next leaf below this one
    pub fn prev_sibling(&self) -> Option<Self> {
        self.sibling_at(-1)
    }

    /// Next leaf above this one
    pub fn next_sibling(&self) -> Option<Self> {
        self.sibling_at(1)
    }

    /// Pass-through groups between this node and its compositing parent
    fn pass_through_chain(&self) -> Vec<&'a Node> {
        let mut chain = Vec::new();
        let Some(node) = self.node() else {
            return chain;
        };
        if node.is_mask() {
            return chain;
        }
        let mut current = node.parent().and_then(|id| self.graph.get(id));
        while let Some(parent) = current {
            if !parent.is_pass_through() {
                break;
            }
            chain.push(parent);
            current = parent.parent().and_then(|id| self.graph.get(id));
        }
        chain
    }

    /// An invisible pass-through ancestor hides this leaf
    pub fn is_hidden_by_pass_through(&self) -> bool {
        self.pass_through_chain().iter().any(|group| !group.is_visible())
    }

    /// Visible for compositing. Pass-through groups themselves never are:
    /// their children composite in their place.
    pub fn visible(&self) -> bool {
        self.node()
            .is_some_and(|node| node.is_visible() && !node.is_pass_through())
            && !self.is_hidden_by_pass_through()
    }

    pub fn should_be_rendered(&self) -> bool {
        self.visible()
    }

    /// Own opacity multiplied by every pass-through ancestor's opacity
    pub fn opacity(&self) -> u8 {
        let own = self.node().map_or(0, Node::opacity);
        self.pass_through_chain()
            .iter()
            .fold(own, |acc, group| mul_u8(acc, group.opacity()))
    }

    /// Own channel flags intersected with every pass-through ancestor's
    pub fn channel_flags(&self) -> ChannelFlags {
        let own = self
            .node()
            .map_or(ChannelFlags::ALL, |node| *node.channel_flags());
        self.pass_through_chain()
            .iter()
            .fold(own, |acc, group| acc.merged(group.channel_flags()))
    }

    pub fn composite_op(&self) -> CompositeOp {
        self.node().map_or(CompositeOp::Over, Node::composite_op)
    }

    pub fn depends_on_lower_nodes(&self) -> bool {
        self.node().is_some_and(Node::depends_on_lower_nodes)
    }

    pub fn has_clones(&self) -> bool {
        !self.graph.clones_of(self.id).is_empty()
    }

    pub fn original(&self) -> Option<&'a PaintDevice> {
        self.graph.original(self.id)
    }

    pub fn projection(&self) -> Option<&'a PaintDevice> {
        self.graph.projection(self.id)
    }
}

impl std::fmt::Debug for ProjectionLeaf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionLeaf").field("id", &self.id).finish()
    }
}
