//! Rect arithmetic and projection updates of a node's projection plane
//!
//! A layer's projection is its original passed through the internal
//! selection, the visible effect masks in child order and the layer style.
//! When none of those apply the original doubles as the projection and the
//! separate device is dropped.

use tracing::trace;

use crate::color::{ChannelFlags, ColorSpace};
use crate::composite::{CompositeOp, compose_pixel, lerp_u8, mul_u8};
use crate::device::PaintDevice;
use crate::geometry::Rect;
use crate::tiles::TileError;
use crate::walker::NodePosition;

use super::graph::NodeGraph;
use super::{LayerStyle, Node, NodeId, NodeKind};

impl LayerStyle {
    /// Output grows by the shadow cast from `rect`
    pub fn change_rect(&self, rect: Rect) -> Rect {
        rect | rect.translated_by(self.shadow_offset)
    }

    /// The shadow at `rect` is cast by content at `rect - offset`
    pub fn need_rect(&self, rect: Rect) -> Rect {
        rect | rect.translated_by(-self.shadow_offset)
    }

    /// Draw the shadow of `device` behind it over `rect`
    fn apply(&self, device: &mut PaintDevice, rect: Rect) -> Result<(), TileError> {
        let snapshot = device.clone();
        let color_space = device.color_space();
        let alpha = color_space.alpha_pos();
        let strength = mul_u8(self.shadow_color[3], self.shadow_opacity);
        let offset = self.shadow_offset;
        let [r, g, b, _] = self.shadow_color;

        device.for_each_pixel_mut(rect, |x, y, px| {
            let caster = snapshot.pixel(x.saturating_sub(offset.x), y.saturating_sub(offset.y));
            let shadow_alpha = mul_u8(caster[alpha], strength);
            if shadow_alpha == 0 {
                return;
            }
            let shadow = [r, g, b, shadow_alpha];
            let src: &[u8] = match color_space {
                ColorSpace::Rgba8 => &shadow,
                ColorSpace::Alpha8 => &shadow[3..],
            };
            compose_pixel(color_space, CompositeOp::Behind, px, src, 255, &ChannelFlags::ALL);
        })
    }
}

impl Node {
    /// Output rect of an effect mask for input changed in `rect`
    pub fn mask_change_rect(&self, rect: Rect) -> Rect {
        match &self.kind {
            NodeKind::FilterMask { filter, .. } => filter.change_rect(rect),
            NodeKind::TransformMask { offset } => rect.translated_by(*offset),
            _ => rect,
        }
    }

    /// Input rect an effect mask reads to produce `rect`
    pub fn mask_need_rect(&self, rect: Rect) -> Rect {
        match &self.kind {
            NodeKind::FilterMask { filter, .. } => filter.need_rect(rect),
            NodeKind::TransformMask { offset } => rect.translated_by(-*offset),
            _ => rect,
        }
    }

    /// Run this effect mask in place over `rect`
    fn apply_mask(&self, device: &mut PaintDevice, rect: Rect) -> Result<(), TileError> {
        match &self.kind {
            NodeKind::FilterMask { filter, selection } => {
                let snapshot = device.clone();
                filter.process(&snapshot, device, rect)?;
                if let Some(selection) = selection {
                    device.for_each_pixel_mut(rect, |x, y, px| {
                        let coverage = selection.pixel(x, y)[0];
                        if coverage != 255 {
                            for (value, old) in px.iter_mut().zip(snapshot.pixel(x, y)) {
                                *value = lerp_u8(*old, *value, coverage);
                            }
                        }
                    })?;
                }
                Ok(())
            }
            NodeKind::TransparencyMask { selection } => device.apply_selection(selection, rect),
            NodeKind::TransformMask { offset } => {
                let snapshot = device.clone();
                device.copy_translated_from(&snapshot, rect, *offset)
            }
            NodeKind::ColorizeMask { color, amount } => {
                if device.color_space() != ColorSpace::Rgba8 {
                    return Ok(());
                }
                device.for_each_pixel_mut(rect, |_, _, px| {
                    if px[3] != 0 {
                        for c in 0..3 {
                            px[c] = lerp_u8(px[c], color[c], *amount);
                        }
                    }
                })
            }
            _ => Ok(()),
        }
    }
}

impl NodeGraph {
    /// Chain `rect` through the change rects of the visible effect masks
    pub fn masks_change_rect(&self, id: NodeId, rect: Rect) -> Rect {
        self.visible_effect_masks(id)
            .iter()
            .filter_map(|mask| self.get(*mask))
            .fold(rect, |acc, mask| mask.mask_change_rect(acc))
    }

    /// Chain `rect` backwards through the need rects of the visible effect
    /// masks. Also returns, in mask order, the rect each mask has to
    /// produce.
    pub fn masks_need_rect(&self, id: NodeId, rect: Rect) -> (Rect, Vec<Rect>) {
        let masks = self.visible_effect_masks(id);
        let mut apply_rects = Vec::with_capacity(masks.len());
        let mut need = rect;
        for mask in masks.iter().rev() {
            apply_rects.push(need);
            if let Some(node) = self.get(*mask) {
                need = node.mask_need_rect(need);
            }
        }
        apply_rects.reverse();
        (need, apply_rects)
    }

    /// Rect affected in a layer's output by a change of its input
    pub fn incoming_change_rect(&self, id: NodeId, rect: Rect) -> Rect {
        match self.get(id).map(Node::kind) {
            Some(NodeKind::AdjustmentLayer { filter, .. }) => filter.change_rect(rect) | rect,
            _ => rect,
        }
    }

    /// Rect affected in the parent by a change of the layer's projection
    pub fn outgoing_change_rect(&self, id: NodeId, rect: Rect) -> Rect {
        match self.get(id).and_then(Node::layer_style) {
            Some(style) => style.change_rect(rect),
            None => rect,
        }
    }

    pub fn change_rect(&self, id: NodeId, rect: Rect, position: NodePosition) -> Rect {
        let Some(node) = self.get(id) else {
            return rect;
        };
        if node.is_mask() {
            return node.mask_change_rect(rect);
        }
        let mut change = self.incoming_change_rect(id, rect);
        if position.contains(NodePosition::FILTHY) {
            change = self.masks_change_rect(id, change);
        }
        if !position.intersects(NodePosition::FILTHY | NodePosition::FILTHY_PROJECTION)
            && node.composite_op() != CompositeOp::Copy
        {
            change |= rect;
        }
        self.outgoing_change_rect(id, change)
    }

    /// Rect of the original needed to produce `rect` of the projection
    pub fn need_rect_for_original(&self, id: NodeId, rect: Rect) -> Rect {
        let styled = match self.get(id).and_then(Node::layer_style) {
            Some(style) => style.need_rect(rect),
            None => rect,
        };
        self.masks_need_rect(id, styled).0
    }

    /// Rect the layer reads from the nodes below it to produce `rect`
    pub fn need_rect(&self, id: NodeId, rect: Rect, _position: NodePosition) -> Rect {
        match self.get(id).map(Node::kind) {
            Some(NodeKind::AdjustmentLayer { filter, .. }) => {
                filter.need_rect(self.need_rect_for_original(id, rect)) | rect
            }
            _ => rect,
        }
    }

    /// Rect read from devices outside the walked stack
    pub fn access_rect(&self, id: NodeId, rect: Rect, position: NodePosition) -> Rect {
        match self.get(id).and_then(Node::clone_source) {
            Some((_, offset))
                if position.intersects(NodePosition::FILTHY | NodePosition::FILTHY_PROJECTION) =>
            {
                rect | rect.translated_by(-offset)
            }
            _ => rect,
        }
    }

    /// Rebuild the separate projection of `id` over `rect`.
    ///
    /// The work happens on a copy-on-write temporary of the original, so a
    /// failed allocation leaves the current projection untouched.
    pub fn recalculate(&mut self, id: NodeId, rect: Rect) -> Result<(), TileError> {
        let Some(node) = self.get(id) else {
            return Ok(());
        };
        let Some(original) = node.original() else {
            return Ok(());
        };
        let masks = self.visible_effect_masks(id);
        let selection = node.internal_selection();
        let style = node.layer_style;

        if masks.is_empty() && !node.needs_projection() {
            if node.projection.is_some() {
                trace!("Dropping separate projection of {}", id);
                if let Some(node) = self.get_mut(id) {
                    node.projection = None;
                }
            }
            return Ok(());
        }

        let rect = match node.projection {
            Some(_) => rect,
            None => rect | self.outgoing_change_rect(id, self.masks_change_rect(id, original.extent())),
        };
        if rect.is_empty() {
            return Ok(());
        }

        let styled = style.map_or(rect, |style| style.need_rect(rect));
        let (need, apply_rects) = self.masks_need_rect(id, styled);

        let mut temp = original.clone();
        if let Some(selection) = selection {
            temp.apply_selection(selection, need)?;
        }
        for (mask, apply) in masks.iter().zip(&apply_rects) {
            if let Some(mask) = self.get(*mask) {
                mask.apply_mask(&mut temp, *apply)?;
            }
        }
        if let Some(style) = style {
            style.apply(&mut temp, rect)?;
        }

        let mut projection = node.projection.clone().unwrap_or_else(|| original.clone());
        projection.copy_rect_from(&temp, rect)?;
        trace!("Recalculated projection of {} over {:?}", id, rect);
        if let Some(node) = self.get_mut(id) {
            node.projection = Some(projection);
        }
        Ok(())
    }
}
