//! Structural and content edits of the layer tree
//!
//! Each command dirties what it touched, so the projection catches up once
//! the scheduler processes the update queue.

use glam::IVec2;
use tracing::{debug, trace};

use super::{CommandError, UndoCommand};
use crate::filter::Filter;
use crate::geometry::Rect;
use crate::image::Image;
use crate::node::{GraphError, Node, NodeId, NodeKind, NodeProperties, Subtree};
use crate::signals::ImageSignal;
use crate::tiles::Memento;

/// Adds a detached node, or a whole detached branch, to the tree
pub struct AddNodeCommand {
    text: String,
    node: NodeId,
    parent: NodeId,
    /// Child index; `None` puts the node on top
    index: Option<usize>,
    /// The branch while it is out of the graph
    pending: Option<Subtree>,
}

impl AddNodeCommand {
    pub fn new(node: Node, parent: NodeId, index: Option<usize>) -> Self {
        Self::with_subtree(Subtree::single(node), parent, index)
    }

    pub fn with_subtree(subtree: Subtree, parent: NodeId, index: Option<usize>) -> Self {
        Self {
            text: "Add node".to_string(),
            node: subtree.root(),
            parent,
            index,
            pending: Some(subtree),
        }
    }

    /// Id the node keeps once added
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl UndoCommand for AddNodeCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let subtree = self
            .pending
            .clone()
            .ok_or_else(|| CommandError::NotApplied(self.text.clone()))?;
        let index = match self.index {
            Some(index) => index,
            None => image
                .node(self.parent)
                .map(|parent| parent.children().len())
                .ok_or(CommandError::NotFound(self.parent))?,
        };
        image.graph_mut().insert(subtree, self.parent, index)?;
        self.pending = None;

        image.emit(ImageSignal::NodeAdded { node: self.node });
        let rect = image.node_extent(self.node);
        image.full_refresh(self.node, rect);
        Ok(())
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let rect = image.node_extent(self.node);
        let subtree = image.graph_mut().detach(self.node)?;
        self.pending = Some(subtree);

        image.emit(ImageSignal::NodeRemoved { node: self.node });
        image.full_refresh(self.parent, rect);
        Ok(())
    }
}

/// Removes a node and everything below it
///
/// Clone layers outside the removed branch that show a removed node are
/// turned into independent paint layers first, and turned back on undo.
pub struct RemoveNodeCommand {
    text: String,
    node: NodeId,
    /// Parent and child index recorded by the first redo
    position: Option<(NodeId, usize)>,
    pending: Option<Subtree>,
    reincarnated: Vec<(NodeId, NodeKind)>,
}

impl RemoveNodeCommand {
    pub fn new(node: NodeId) -> Self {
        Self {
            text: "Remove node".to_string(),
            node,
            position: None,
            pending: None,
            reincarnated: Vec::new(),
        }
    }

    fn reincarnate_external_clones(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let removed = image.graph().descendants(self.node);
        let mut orphans = Vec::new();
        for id in &removed {
            for clone in image.graph().clones_of(*id) {
                if !removed.contains(&clone) && !orphans.contains(&clone) {
                    orphans.push(clone);
                }
            }
        }
        for clone in orphans {
            let previous = image.graph_mut().reincarnate_clone(clone)?;
            self.reincarnated.push((clone, previous));
            image.set_dirty_node(clone);
        }
        Ok(())
    }
}

impl UndoCommand for RemoveNodeCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let graph = image.graph();
        let parent = graph
            .get(self.node)
            .ok_or(CommandError::NotFound(self.node))?
            .parent()
            .ok_or(GraphError::RootLocked)?;
        let index = graph.index_of(self.node).ok_or(CommandError::NotFound(self.node))?;
        let rect = image.node_extent(self.node);

        self.reincarnate_external_clones(image)?;
        let subtree = match image.graph_mut().detach(self.node) {
            Ok(subtree) => subtree,
            Err(err) => {
                self.restore_clones(image)?;
                return Err(err.into());
            }
        };
        debug!("Removed {} ({} nodes)", self.node, subtree.len());
        self.pending = Some(subtree);
        self.position = Some((parent, index));

        image.emit(ImageSignal::NodeRemoved { node: self.node });
        image.emit(ImageSignal::ComplexNodeReselection { node: Some(parent) });
        image.full_refresh(parent, rect);
        Ok(())
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let (parent, index) = self
            .position
            .ok_or_else(|| CommandError::NotApplied(self.text.clone()))?;
        let subtree = self
            .pending
            .clone()
            .ok_or_else(|| CommandError::NotApplied(self.text.clone()))?;
        image.graph_mut().insert(subtree, parent, index)?;
        self.pending = None;
        self.restore_clones(image)?;

        image.emit(ImageSignal::NodeAdded { node: self.node });
        image.emit(ImageSignal::ComplexNodeReselection { node: Some(self.node) });
        let rect = image.node_extent(self.node);
        image.full_refresh(self.node, rect);
        Ok(())
    }
}

impl RemoveNodeCommand {
    fn restore_clones(&mut self, image: &mut Image) -> Result<(), CommandError> {
        while let Some((clone, kind)) = self.reincarnated.pop() {
            image.graph_mut().restore_kind(clone, kind)?;
            image.set_dirty_node(clone);
        }
        Ok(())
    }
}

/// Moves a node to another parent or position
pub struct MoveNodeCommand {
    text: String,
    node: NodeId,
    target: (NodeId, usize),
    /// Where the node was before the first redo
    origin: Option<(NodeId, usize)>,
}

impl MoveNodeCommand {
    /// `index` is counted after the node left its current place
    pub fn new(node: NodeId, new_parent: NodeId, index: usize) -> Self {
        Self {
            text: "Move node".to_string(),
            node,
            target: (new_parent, index),
            origin: None,
        }
    }

    fn move_to(image: &mut Image, node: NodeId, from: NodeId, (parent, index): (NodeId, usize)) -> Result<(), CommandError> {
        let rect = image.node_extent(node);
        image.graph_mut().move_node(node, parent, index)?;
        image.emit(ImageSignal::NodeChanged { node });
        image.full_refresh(from, rect);
        let rect = image.node_extent(node);
        image.full_refresh(node, rect);
        Ok(())
    }
}

impl UndoCommand for MoveNodeCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let graph = image.graph();
        let parent = graph
            .get(self.node)
            .ok_or(CommandError::NotFound(self.node))?
            .parent()
            .ok_or(GraphError::RootLocked)?;
        let index = graph.index_of(self.node).ok_or(CommandError::NotFound(self.node))?;
        Self::move_to(image, self.node, parent, self.target)?;
        self.origin = Some((parent, index));
        Ok(())
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let origin = self
            .origin
            .ok_or_else(|| CommandError::NotApplied(self.text.clone()))?;
        Self::move_to(image, self.node, self.target.0, origin)
    }
}

/// Replaces the shared properties of a node; redo and undo swap them back
/// and forth
pub struct NodePropertyCommand {
    text: String,
    node: NodeId,
    properties: NodeProperties,
}

impl NodePropertyCommand {
    pub fn new(node: NodeId, properties: NodeProperties) -> Self {
        Self {
            text: "Change node properties".to_string(),
            node,
            properties,
        }
    }

    fn swap(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let node = image
            .graph_mut()
            .get_mut(self.node)
            .ok_or(CommandError::NotFound(self.node))?;
        std::mem::swap(node.properties_mut(), &mut self.properties);
        trace!("Swapped properties of {}", self.node);
        image.emit(ImageSignal::NodeChanged { node: self.node });
        image.set_dirty_node(self.node);
        Ok(())
    }
}

impl UndoCommand for NodePropertyCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.swap(image)
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.swap(image)
    }
}

/// Switches a group layer in or out of pass-through mode
pub struct PassThroughCommand {
    text: String,
    node: NodeId,
    pass_through: bool,
}

impl PassThroughCommand {
    pub fn new(node: NodeId, pass_through: bool) -> Self {
        Self {
            text: "Toggle pass-through".to_string(),
            node,
            pass_through,
        }
    }

    fn swap(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let node = image
            .graph_mut()
            .get_mut(self.node)
            .ok_or(CommandError::NotFound(self.node))?;
        let NodeKind::GroupLayer { pass_through, .. } = node.kind_mut() else {
            return Err(CommandError::Failed(format!("node {} is not a group", self.node)));
        };
        std::mem::swap(pass_through, &mut self.pass_through);
        let parent = node.parent();

        image.emit(ImageSignal::NodeChanged { node: self.node });
        let rect = image.node_extent(self.node);
        image.full_refresh(parent.unwrap_or(self.node), rect);
        Ok(())
    }
}

impl UndoCommand for PassThroughCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.swap(image)
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.swap(image)
    }
}

/// Replaces the filter of an adjustment layer or filter mask
pub struct ChangeFilterCommand {
    text: String,
    node: NodeId,
    filter: Filter,
}

impl ChangeFilterCommand {
    pub fn new(node: NodeId, filter: Filter) -> Self {
        Self {
            text: format!("Change filter to {}", filter.name()),
            node,
            filter,
        }
    }

    fn swap(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let node = image
            .graph_mut()
            .get_mut(self.node)
            .ok_or(CommandError::NotFound(self.node))?;
        match node.kind_mut() {
            NodeKind::AdjustmentLayer { filter, .. } | NodeKind::FilterMask { filter, .. } => {
                std::mem::swap(filter, &mut self.filter);
            }
            _ => return Err(CommandError::Failed(format!("node {} has no filter", self.node))),
        }
        image.emit(ImageSignal::NodeChanged { node: self.node });
        let bounds = image.bounds();
        image.set_dirty(self.node, bounds);
        Ok(())
    }
}

impl UndoCommand for ChangeFilterCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.swap(image)
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.swap(image)
    }
}

/// Moves the pixel content of a layer and its descendants
///
/// Paint and shape devices and mask selections are shifted; clone layers
/// change their offset instead. Derived originals are regenerated by the
/// refresh.
pub struct TranslateLayerCommand {
    text: String,
    node: NodeId,
    delta: IVec2,
}

impl TranslateLayerCommand {
    pub fn new(node: NodeId, delta: IVec2) -> Self {
        Self {
            text: "Move layer".to_string(),
            node,
            delta,
        }
    }

    fn apply(&self, image: &mut Image, delta: IVec2) -> Result<(), CommandError> {
        if image.node(self.node).is_none() {
            return Err(CommandError::NotFound(self.node));
        }
        let before = image.node_extent(self.node);
        for id in image.graph().descendants(self.node) {
            let Some(node) = image.graph_mut().get_mut(id) else {
                continue;
            };
            match node.kind_mut() {
                NodeKind::PaintLayer { device }
                | NodeKind::ShapeLayer { device }
                | NodeKind::TransparencyMask { selection: device }
                | NodeKind::SelectionMask {
                    selection: device, ..
                }
                | NodeKind::AdjustmentLayer {
                    selection: Some(device),
                    ..
                }
                | NodeKind::GeneratorLayer {
                    selection: Some(device),
                    ..
                }
                | NodeKind::FilterMask {
                    selection: Some(device),
                    ..
                } => device.move_to(device.offset() + delta),
                NodeKind::CloneLayer { offset, .. } => *offset += delta,
                _ => {}
            }
        }
        debug!("Translated {} by {:?}", self.node, delta);

        image.emit(ImageSignal::NodeChanged { node: self.node });
        let rect = before | before.translated_by(delta);
        let target = image
            .node(self.node)
            .and_then(Node::parent)
            .unwrap_or(self.node);
        image.full_refresh(target, rect);
        Ok(())
    }
}

impl UndoCommand for TranslateLayerCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.apply(image, self.delta)
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.apply(image, -self.delta)
    }
}

/// Tile-level diff recorded while a stroke job painted on a layer
pub struct DeviceTransactionCommand {
    text: String,
    node: NodeId,
    memento: Memento,
    /// The paint already happened when the command was recorded
    skip_next_redo: bool,
}

impl DeviceTransactionCommand {
    /// Command for a transaction whose changes are already on the device
    pub fn applied(node: NodeId, memento: Memento) -> Self {
        Self {
            text: "Paint".to_string(),
            node,
            memento,
            skip_next_redo: true,
        }
    }

    #[inline]
    pub fn memento(&self) -> &Memento {
        &self.memento
    }

    fn changed_rect(&self, image: &mut Image, forward: bool) -> Result<Rect, CommandError> {
        let device = image
            .graph_mut()
            .original_mut(self.node)
            .ok_or(CommandError::NotFound(self.node))?;
        if forward {
            device.rollforward(&self.memento);
        } else {
            device.rollback(&self.memento);
        }
        Ok(device.memento_rect(&self.memento))
    }
}

impl UndoCommand for DeviceTransactionCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        if std::mem::take(&mut self.skip_next_redo) {
            return Ok(());
        }
        let rect = self.changed_rect(image, true)?;
        image.set_dirty(self.node, rect);
        Ok(())
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        self.skip_next_redo = false;
        let rect = self.changed_rect(image, false)?;
        image.set_dirty(self.node, rect);
        Ok(())
    }
}

impl std::fmt::Debug for DeviceTransactionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTransactionCommand")
            .field("node", &self.node)
            .field("tiles", &self.memento.tile_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use impasto_config::ImageConfig;

    use super::*;
    use crate::composite::CompositeOp;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    fn image() -> Image {
        let mut image = Image::new(&ImageConfig::new(128, 128));
        image.full_refresh_all();
        settle(&mut image);
        image
    }

    fn painted(image: &Image, name: &str, rect: Rect, color: [u8; 4]) -> Node {
        let mut node = image.factory().paint_layer(name);
        node.original_mut().unwrap().fill(rect, &color).unwrap();
        node
    }

    fn settle(image: &mut Image) {
        image.process_all_updates().unwrap();
        image.take_signals();
    }

    #[test]
    fn test_add_node_round_trip() {
        let mut image = image();
        let root = image.root();
        let before = image.snapshot();
        let mut add = AddNodeCommand::new(painted(&image, "layer", Rect::new(0, 0, 8, 8), RED), root, None);
        let layer = add.node();

        add.redo(&mut image).unwrap();
        assert_eq!(image.take_signals(), vec![ImageSignal::NodeAdded { node: layer }]);
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &RED);

        add.undo(&mut image).unwrap();
        settle(&mut image);
        assert!(image.node(layer).is_none());
        assert_eq!(image.projection().unwrap().pixel(2, 2)[3], 0);
        assert!(image.matches_snapshot(&before));

        add.redo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &RED);
    }

    #[test]
    fn test_remove_node_reincarnates_clones() {
        let mut image = image();
        let root = image.root();
        let source = painted(&image, "source", Rect::new(0, 0, 4, 4), RED);
        let source = image.graph_mut().push_node(source, root).unwrap();
        let clone = image
            .factory()
            .clone_layer("clone", source, IVec2::new(10, 0));
        let clone = image.graph_mut().push_node(clone, root).unwrap();
        image.full_refresh_all();
        settle(&mut image);
        let before = image.snapshot();
        assert_eq!(image.projection().unwrap().pixel(11, 1), &RED);

        let mut remove = RemoveNodeCommand::new(source);
        remove.redo(&mut image).unwrap();
        settle(&mut image);
        assert!(image.node(clone).unwrap().clone_source().is_none());
        assert_eq!(image.projection().unwrap().pixel(1, 1)[3], 0);
        assert_eq!(image.projection().unwrap().pixel(11, 1), &RED);

        remove.undo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.node(clone).unwrap().clone_source(), Some((source, IVec2::new(10, 0))));
        assert_eq!(image.graph().clones_of(source), vec![clone]);
        assert!(image.matches_snapshot(&before));
    }

    #[test]
    fn test_remove_last_layer_clears_projection() {
        let mut image = image();
        let root = image.root();
        let layer = painted(&image, "layer", Rect::new(0, 0, 8, 8), RED);
        let layer = image.graph_mut().push_node(layer, root).unwrap();
        image.full_refresh_all();
        settle(&mut image);

        RemoveNodeCommand::new(layer).redo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2)[3], 0);
        assert!(RemoveNodeCommand::new(root).redo(&mut image).is_err());
    }

    #[test]
    fn test_move_node_reorders() {
        let mut image = image();
        let root = image.root();
        let bottom = painted(&image, "bottom", Rect::new(0, 0, 8, 8), RED);
        let bottom = image.graph_mut().push_node(bottom, root).unwrap();
        let top = painted(&image, "top", Rect::new(0, 0, 8, 8), BLUE);
        let top = image.graph_mut().push_node(top, root).unwrap();
        image.full_refresh_all();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &BLUE);

        let mut raise = MoveNodeCommand::new(bottom, root, 1);
        raise.redo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.graph().layer_children(root), vec![top, bottom]);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &RED);

        raise.undo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.graph().layer_children(root), vec![bottom, top]);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &BLUE);
    }

    #[test]
    fn test_property_swap() {
        let mut image = image();
        let root = image.root();
        let layer = painted(&image, "layer", Rect::new(0, 0, 8, 8), RED);
        let layer = image.graph_mut().push_node(layer, root).unwrap();
        image.full_refresh_all();
        settle(&mut image);

        let mut props = image.node(layer).unwrap().properties().clone();
        props.visible = false;
        props.composite_op = CompositeOp::Erase;
        let mut hide = NodePropertyCommand::new(layer, props);
        hide.redo(&mut image).unwrap();
        settle(&mut image);
        assert!(!image.node(layer).unwrap().is_visible());
        assert_eq!(image.projection().unwrap().pixel(2, 2)[3], 0);

        hide.undo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.node(layer).unwrap().composite_op(), CompositeOp::Over);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &RED);
    }

    #[test]
    fn test_change_filter_and_pass_through() {
        let mut image = image();
        let root = image.root();
        let layer = painted(&image, "layer", Rect::new(0, 0, 8, 8), RED);
        image.graph_mut().push_node(layer, root).unwrap();
        let adjustment = image.factory().adjustment_layer("adjust", Filter::Invert);
        let adjustment = image.graph_mut().push_node(adjustment, root).unwrap();
        image.full_refresh_all();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &[0, 255, 255, 255]);

        let mut change = ChangeFilterCommand::new(adjustment, Filter::Brightness { delta: 0 });
        change.redo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &RED);
        change.undo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(2, 2), &[0, 255, 255, 255]);

        let mut toggle = PassThroughCommand::new(adjustment, true);
        assert!(toggle.redo(&mut image).is_err());
    }

    #[test]
    fn test_translate_layer() {
        let mut image = image();
        let root = image.root();
        let layer = painted(&image, "layer", Rect::new(0, 0, 4, 4), RED);
        let layer = image.graph_mut().push_node(layer, root).unwrap();
        image.full_refresh_all();
        settle(&mut image);

        let mut translate = TranslateLayerCommand::new(layer, IVec2::new(70, 0));
        translate.redo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(1, 1)[3], 0);
        assert_eq!(image.projection().unwrap().pixel(71, 1), &RED);

        translate.undo(&mut image).unwrap();
        settle(&mut image);
        assert_eq!(image.projection().unwrap().pixel(1, 1), &RED);
        assert_eq!(image.projection().unwrap().pixel(71, 1)[3], 0);
    }

    #[test]
    fn test_device_transaction_undo_redo() {
        let mut image = image();
        let root = image.root();
        let layer = image.factory().paint_layer("layer");
        let layer = image.graph_mut().push_node(layer, root).unwrap();

        let device = image.graph_mut().original_mut(layer).unwrap();
        device.begin_transaction();
        device.fill(Rect::new(0, 0, 8, 8), &RED).unwrap();
        let memento = device.end_transaction().unwrap();
        let mut command = DeviceTransactionCommand::applied(layer, memento);

        command.redo(&mut image).unwrap();
        assert_eq!(image.graph().original(layer).unwrap().pixel(1, 1), &RED);
        assert!(!image.has_pending_updates());

        command.undo(&mut image).unwrap();
        assert_eq!(image.graph().original(layer).unwrap().pixel(1, 1)[3], 0);
        assert!(image.has_pending_updates());
        command.redo(&mut image).unwrap();
        assert_eq!(image.graph().original(layer).unwrap().pixel(1, 1), &RED);
    }
}
