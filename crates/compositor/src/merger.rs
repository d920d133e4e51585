//! Executes a walk graph
//!
//! Jobs are popped from the top of the stack. Siblings are composited
//! bottom-up into a temporary device sized like their parent's original;
//! when the topmost sibling is done the temporary is written back to the
//! parent over the rect that sibling was asked for. A failure therefore
//! never leaves a half-composited parent behind.

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::device::PaintDevice;
use crate::geometry::Rect;
use crate::node::{Node, NodeGraph, NodeId, NodeKind};
use crate::projection_leaf::ProjectionLeaf;
use crate::tiles::TileError;
use crate::walker::{JobItem, NodePosition, WalkGraph};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error(transparent)]
    Tile(#[from] TileError),

    #[error("layer {0} has no parent to composite into")]
    Orphan(NodeId),
}

/// What one merge pass touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Nodes in the order their jobs ran
    pub visited: Vec<NodeId>,
    /// Rect of the root projection that was rewritten
    pub root_rect: Rect,
}

/// Composites a walk graph into the node graph
#[derive(Default)]
pub struct Merger {
    temp: Option<(NodeId, PaintDevice)>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every job of `walk` against `graph`
    pub fn merge(&mut self, graph: &mut NodeGraph, mut walk: WalkGraph) -> Result<MergeReport, MergeError> {
        self.temp = None;
        let mut report = MergeReport::default();
        while let Some(job) = walk.pop_job() {
            self.process(graph, job, &mut report)?;
        }
        if self.temp.take().is_some() {
            warn!("Walk ended with an unfinished sibling stack");
        }
        debug!("Merged {} jobs", report.visited.len());
        Ok(report)
    }

    fn process(&mut self, graph: &mut NodeGraph, job: JobItem, report: &mut MergeReport) -> Result<(), MergeError> {
        let JobItem {
            node: id,
            position,
            apply_rect: rect,
        } = job;
        if graph.get(id).is_some_and(Node::is_group) && graph.layer_children(id).is_empty() {
            // no child writes back into it anymore
            if let Some(original) = graph.original_mut(id) {
                original.clear_rect(rect)?;
            }
        }
        let Some(leaf) = ProjectionLeaf::new(graph, id) else {
            warn!("Skipping job for removed node {}", id);
            return Ok(());
        };
        trace!("Merge {} {:?} over {:?}", id, position, rect);
        report.visited.push(id);

        if leaf.is_root() {
            graph.recalculate(id, rect)?;
            report.root_rect |= rect;
            return Ok(());
        }
        if position.contains(NodePosition::EXTRA) {
            graph.recalculate(id, rect)?;
            return Ok(());
        }

        let parent = leaf.parent().ok_or(MergeError::Orphan(id))?.id();
        let visible = leaf.visible();
        let op = leaf.composite_op();
        let opacity = leaf.opacity();
        let flags = leaf.channel_flags();
        let depends_on_lower = leaf.depends_on_lower_nodes();

        let mut temp = match self.temp.take() {
            Some((owner, temp)) if owner == parent => temp,
            stale => {
                if let Some((owner, _)) = stale {
                    warn!("Discarding unfinished composite of {}", owner);
                }
                graph
                    .original(parent)
                    .map(PaintDevice::empty_like)
                    .ok_or(MergeError::Orphan(id))?
            }
        };

        if visible {
            if position.contains(NodePosition::FILTHY)
                || (position.contains(NodePosition::ABOVE_FILTHY) && depends_on_lower)
            {
                update_original(graph, id, &temp, rect)?;
                graph.recalculate(id, rect)?;
            } else if position.contains(NodePosition::FILTHY_PROJECTION) {
                graph.recalculate(id, rect)?;
            }
            if let Some(projection) = graph.projection(id) {
                temp.composite_rect(projection, rect, op, opacity, &flags)?;
            }
        }

        if position.contains(NodePosition::TOPMOST) {
            let original = graph.original_mut(parent).ok_or(MergeError::Orphan(id))?;
            original.copy_rect_from(&temp, rect)?;
            trace!("Wrote {:?} back into {}", rect, parent);
        } else {
            self.temp = Some((parent, temp));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Merger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merger")
            .field("pending_parent", &self.temp.as_ref().map(|(owner, _)| *owner))
            .finish()
    }
}

/// Refresh the original of layers whose content derives from something
/// else. Paint, shape and group layers are left as they are.
fn update_original(graph: &mut NodeGraph, id: NodeId, below: &PaintDevice, rect: Rect) -> Result<(), TileError> {
    let clone_source = graph
        .get(id)
        .and_then(|node| node.clone_source())
        .and_then(|(source, offset)| graph.projection(source).map(|p| (p.clone(), offset)));

    let Some(node) = graph.get_mut(id) else {
        return Ok(());
    };
    match node.kind_mut() {
        NodeKind::AdjustmentLayer { filter, original, .. } => filter.process(below, original, rect),
        NodeKind::GeneratorLayer {
            generator,
            original,
            ..
        } => generator.generate(original, rect),
        NodeKind::CloneLayer { original, .. } => match clone_source {
            Some((source, offset)) => original.copy_translated_from(&source, rect, offset),
            None => original.clear_rect(rect),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use glam::IVec2;

    use super::*;
    use crate::color::ColorSpace;
    use crate::composite::CompositeOp;
    use crate::filter::Filter;
    use crate::generator::Generator;
    use crate::node::NodeFactory;
    use crate::tiles::TilePool;
    use crate::walker::{FullRefreshWalker, MergeWalker, RectsWalker};

    const BOUNDS: Rect = Rect::new(0, 0, 128, 128);
    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    fn setup() -> (NodeFactory, NodeGraph) {
        let factory = NodeFactory::new(ColorSpace::Rgba8, TilePool::unlimited());
        let graph = NodeGraph::new(factory.group_layer("root"));
        (factory, graph)
    }

    fn paint(factory: &NodeFactory, name: &str, rect: Rect, color: [u8; 4]) -> crate::node::Node {
        let mut node = factory.paint_layer(name);
        node.original_mut().unwrap().fill(rect, &color).unwrap();
        node
    }

    fn run(graph: &mut NodeGraph, start: NodeId, rect: Rect) -> MergeReport {
        let walk = MergeWalker::new(BOUNDS).collect_rects(graph, start, rect);
        Merger::new().merge(graph, walk).unwrap()
    }

    #[test]
    fn test_adjustment_filters_layers_below() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let a = graph
            .push_node(paint(&factory, "A", Rect::new(0, 0, 10, 10), RED), root)
            .unwrap();
        let b = graph
            .push_node(factory.adjustment_layer("B", Filter::Invert), root)
            .unwrap();
        let c = graph.push_node(factory.paint_layer("C"), root).unwrap();

        let report = run(&mut graph, a, Rect::new(0, 0, 10, 10));
        assert_eq!(report.visited, vec![a, b, c, root]);
        assert_eq!(report.root_rect, Rect::new(0, 0, 10, 10));

        let projection = graph.projection(root).unwrap();
        assert_eq!(projection.pixel(5, 5), &[0, 255, 255, 255]);
        assert_eq!(projection.pixel(20, 20)[3], 0);
    }

    #[test]
    fn test_upper_layer_covers_lower() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let bottom = graph
            .push_node(paint(&factory, "bottom", Rect::new(0, 0, 20, 20), RED), root)
            .unwrap();
        graph
            .push_node(paint(&factory, "top", Rect::new(10, 10, 20, 20), BLUE), root)
            .unwrap();

        run(&mut graph, bottom, Rect::new(0, 0, 30, 30));
        let projection = graph.projection(root).unwrap();
        assert_eq!(projection.pixel(5, 5), &RED);
        assert_eq!(projection.pixel(15, 15), &BLUE);
        assert_eq!(projection.pixel(25, 25), &BLUE);
        assert_eq!(projection.pixel(25, 5)[3], 0);
    }

    #[test]
    fn test_hidden_and_erasing_layers() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let bottom = graph
            .push_node(paint(&factory, "bottom", Rect::new(0, 0, 20, 20), RED), root)
            .unwrap();
        let mut eraser = paint(&factory, "eraser", Rect::new(0, 0, 10, 20), BLUE);
        eraser.properties_mut().composite_op = CompositeOp::Erase;
        graph.push_node(eraser, root).unwrap();
        let mut hidden = paint(&factory, "hidden", Rect::new(0, 0, 20, 20), BLUE);
        hidden.properties_mut().visible = false;
        graph.push_node(hidden, root).unwrap();

        run(&mut graph, bottom, Rect::new(0, 0, 20, 20));
        let projection = graph.projection(root).unwrap();
        assert_eq!(projection.pixel(5, 5)[3], 0);
        assert_eq!(projection.pixel(15, 5), &RED);
    }

    #[test]
    fn test_nested_group_and_generator() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let group = graph.push_node(factory.group_layer("group"), root).unwrap();
        let fill = graph
            .push_node(
                factory.generator_layer("fill", Generator::SolidColor { color: BLUE }),
                group,
            )
            .unwrap();
        graph
            .push_node(paint(&factory, "half", Rect::new(0, 0, 4, 8), RED), group)
            .unwrap();

        run(&mut graph, fill, Rect::new(0, 0, 8, 8));
        assert_eq!(graph.original(group).unwrap().pixel(6, 6), &BLUE);
        let projection = graph.projection(root).unwrap();
        assert_eq!(projection.pixel(2, 2), &RED);
        assert_eq!(projection.pixel(6, 6), &BLUE);
        assert_eq!(projection.pixel(9, 9)[3], 0);
    }

    #[test]
    fn test_clone_follows_source_projection() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let source = graph
            .push_node(paint(&factory, "source", Rect::new(0, 0, 4, 4), RED), root)
            .unwrap();
        let clone = graph
            .push_node(factory.clone_layer("clone", source, IVec2::new(20, 0)), root)
            .unwrap();

        run(&mut graph, clone, Rect::new(20, 0, 4, 4));
        assert_eq!(graph.original(clone).unwrap().pixel(21, 1), &RED);
        assert_eq!(graph.projection(root).unwrap().pixel(21, 1), &RED);
    }

    #[test]
    fn test_pass_through_children_composite_into_grandparent() {
        let (factory, mut graph) = setup();
        let root = graph.root();
        let pass = graph.push_node(factory.pass_through_group("pass"), root).unwrap();
        graph.get_mut(pass).unwrap().properties_mut().opacity = 128;
        let inner = graph
            .push_node(paint(&factory, "inner", Rect::new(0, 0, 4, 4), RED), pass)
            .unwrap();

        let walk = FullRefreshWalker::new(BOUNDS).collect_rects(&graph, root, Rect::new(0, 0, 4, 4));
        let report = Merger::new().merge(&mut graph, walk).unwrap();
        assert!(report.visited.contains(&inner));
        assert!(!report.visited.contains(&pass));
        assert_eq!(graph.projection(root).unwrap().pixel(1, 1)[3], 128);
        assert_eq!(graph.original(pass).unwrap().pixel(1, 1)[3], 0);
    }
}
