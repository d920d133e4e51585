//! Processing applicator
//!
//! Wraps a stroke around edits of one node: the node is refreshed and the
//! requested signals are emitted once all edits ran, both on commit and
//! when the stroke is undone or redone later.

use tracing::{debug, warn};

use crate::commands::{
    AggregateCommand, CommandError, DisableUiUpdatesCommand, EmitSignalsCommand, UndoCommand,
    UpdateNodeCommand,
};
use crate::image::Image;
use crate::node::NodeId;
use crate::scheduler::{
    Exclusivity, Sequentiality, StrokeError, StrokeId, StrokeJob, StrokeScheduler, UndoCommandStrategy,
};
use crate::signals::ImageSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplicatorFlags {
    /// Refresh the node's whole subtree at the end instead of its own rect
    pub recursive: bool,
    /// Hold back projection notifications until the stroke is done
    pub no_ui_updates: bool,
}

/// Produces the commands for one node of a visited branch
pub trait NodeVisitor: Send + Sync {
    fn visit(&mut self, image: &Image, node: NodeId) -> Result<Vec<Box<dyn UndoCommand>>, CommandError>;
}

/// Builds a stroke from commands and node visitors
///
/// Dropping an applicator without calling [`end`](Self::end) cancels its
/// stroke.
pub struct ProcessingApplicator<'a> {
    scheduler: &'a StrokeScheduler,
    stroke: StrokeId,
    node: Option<NodeId>,
    flags: ApplicatorFlags,
    signals: Vec<ImageSignal>,
    finished: bool,
}

impl<'a> ProcessingApplicator<'a> {
    pub fn new(
        scheduler: &'a StrokeScheduler,
        node: Option<NodeId>,
        flags: ApplicatorFlags,
        signals: Vec<ImageSignal>,
        name: &str,
    ) -> Result<Self, StrokeError> {
        let stroke = scheduler.start_stroke(Box::new(UndoCommandStrategy::new(name)))?;
        let applicator = Self {
            scheduler,
            stroke,
            node,
            flags,
            signals,
            finished: false,
        };
        applicator.bracket(false)?;
        debug!("Applicator '{}' opened {}", name, stroke);
        Ok(applicator)
    }

    #[inline]
    pub fn stroke(&self) -> StrokeId {
        self.stroke
    }

    /// Queue the opening or closing bracket commands. The closing bracket
    /// dirties the node while UI updates are still held back, so the
    /// merged result is announced once.
    fn bracket(&self, finalizing: bool) -> Result<(), StrokeError> {
        let disable = self
            .flags
            .no_ui_updates
            .then(|| Box::new(DisableUiUpdatesCommand::new(finalizing)) as Box<dyn UndoCommand>);
        let update = self.node.map(|node| {
            Box::new(UpdateNodeCommand::new(node, self.flags.recursive, finalizing)) as Box<dyn UndoCommand>
        });
        let emit = (!self.signals.is_empty())
            .then(|| Box::new(EmitSignalsCommand::new(self.signals.clone(), finalizing)) as Box<dyn UndoCommand>);

        let ordered = if finalizing {
            [update, disable, emit]
        } else {
            [disable, update, emit]
        };
        for command in ordered.into_iter().flatten() {
            self.apply_command(command, Sequentiality::Barrier, Exclusivity::Normal)?;
        }
        Ok(())
    }

    /// Queue one command as a job of the stroke
    pub fn apply_command(
        &self,
        command: Box<dyn UndoCommand>,
        sequentiality: Sequentiality,
        exclusivity: Exclusivity,
    ) -> Result<(), StrokeError> {
        let job = StrokeJob::new(move |context| context.execute(command))
            .with_sequentiality(sequentiality)
            .with_exclusivity(exclusivity);
        self.scheduler.add_job(self.stroke, job)
    }

    /// Queue a visitor over the target node, or over its whole branch when
    /// the applicator is recursive. The branch is walked when the job runs,
    /// not when it is queued.
    pub fn apply_visitor<V>(
        &self,
        visitor: V,
        sequentiality: Sequentiality,
        exclusivity: Exclusivity,
    ) -> Result<(), StrokeError>
    where
        V: NodeVisitor + 'static,
    {
        let node = self.node.ok_or(StrokeError::NoTarget)?;
        let recursive = self.flags.recursive;
        let mut visitor = visitor;
        let command = AggregateCommand::new("Visit nodes", move |image: &mut Image| {
            let nodes = if recursive {
                image.graph().descendants(node)
            } else {
                vec![node]
            };
            let mut commands = Vec::new();
            for id in nodes {
                commands.extend(visitor.visit(image, id)?);
            }
            Ok(commands)
        });
        self.apply_command(Box::new(command), sequentiality, exclusivity)
    }

    /// Close the bracket and commit the stroke
    pub fn end(mut self) -> Result<(), StrokeError> {
        self.finished = true;
        self.bracket(true)?;
        self.scheduler.end_stroke(self.stroke)
    }

    pub fn cancel(mut self) -> Result<(), StrokeError> {
        self.finished = true;
        self.scheduler.cancel_stroke(self.stroke)
    }
}

impl Drop for ProcessingApplicator<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Applicator for {} dropped without end, cancelling", self.stroke);
            let _ = self.scheduler.cancel_stroke(self.stroke);
        }
    }
}

#[cfg(test)]
mod tests {
    use impasto_config::{ImageConfig, SchedulerConfig};

    use super::*;
    use crate::commands::NodePropertyCommand;
    use crate::geometry::Rect;

    struct HalfOpacity;

    impl NodeVisitor for HalfOpacity {
        fn visit(&mut self, image: &Image, node: NodeId) -> Result<Vec<Box<dyn UndoCommand>>, CommandError> {
            let current = image.node(node).ok_or(CommandError::NotFound(node))?;
            if !current.is_layer() || node == image.root() {
                return Ok(Vec::new());
            }
            let mut properties = current.properties().clone();
            properties.opacity /= 2;
            Ok(vec![Box::new(NodePropertyCommand::new(node, properties))])
        }
    }

    fn setup() -> (StrokeScheduler, NodeId, NodeId) {
        let mut image = Image::new(&ImageConfig::new(64, 64));
        let root = image.root();
        let group = image.factory().group_layer("group");
        let group = image.graph_mut().push_node(group, root).unwrap();
        let mut layer = image.factory().paint_layer("layer");
        layer
            .original_mut()
            .unwrap()
            .fill(Rect::new(0, 0, 16, 16), &[200, 0, 0, 255])
            .unwrap();
        let layer = image.graph_mut().push_node(layer, group).unwrap();
        let scheduler = StrokeScheduler::new(image, &SchedulerConfig::default()).unwrap();
        scheduler.request_full_refresh();
        scheduler.wait_for_done();
        (scheduler, group, layer)
    }

    fn opacity(scheduler: &StrokeScheduler, node: NodeId) -> u8 {
        scheduler.with_image(|image| image.node(node).unwrap().opacity())
    }

    #[test]
    fn test_recursive_visitor_is_one_undo_step() {
        let (scheduler, group, layer) = setup();
        let flags = ApplicatorFlags {
            recursive: true,
            no_ui_updates: true,
        };
        let applicator = ProcessingApplicator::new(
            &scheduler,
            Some(group),
            flags,
            vec![ImageSignal::Modified],
            "Halve opacity",
        )
        .unwrap();
        applicator
            .apply_visitor(HalfOpacity, Sequentiality::Sequential, Exclusivity::Normal)
            .unwrap();
        applicator.end().unwrap();
        scheduler.wait_for_done();

        assert_eq!(opacity(&scheduler, group), 127);
        assert_eq!(opacity(&scheduler, layer), 127);
        scheduler.with_image(|image| {
            assert_eq!(image.undo_stack().undo_count(), 1);
            assert_eq!(image.undo_stack().undo_text(), Some("Halve opacity"));
            assert!(image.ui_updates_enabled());
            assert!(image.projection().unwrap().pixel(4, 4)[3] < 255);
        });

        scheduler.undo().unwrap();
        scheduler.wait_for_done();
        assert_eq!(opacity(&scheduler, group), 255);
        assert_eq!(opacity(&scheduler, layer), 255);
        scheduler.with_image(|image| {
            assert!(image.ui_updates_enabled());
            assert_eq!(image.projection().unwrap().pixel(4, 4), &[200, 0, 0, 255]);
        });
    }

    #[test]
    fn test_visitor_needs_target() {
        let (scheduler, _, _) = setup();
        let applicator =
            ProcessingApplicator::new(&scheduler, None, ApplicatorFlags::default(), Vec::new(), "nothing")
                .unwrap();
        assert!(matches!(
            applicator.apply_visitor(HalfOpacity, Sequentiality::Sequential, Exclusivity::Normal),
            Err(StrokeError::NoTarget)
        ));
        applicator.end().unwrap();
        scheduler.wait_for_done();
        scheduler.with_image(|image| assert_eq!(image.undo_stack().undo_count(), 0));
    }

    #[test]
    fn test_drop_cancels() {
        let (scheduler, group, layer) = setup();
        let stroke = {
            let applicator =
                ProcessingApplicator::new(&scheduler, Some(layer), ApplicatorFlags::default(), Vec::new(), "drop")
                    .unwrap();
            applicator
                .apply_visitor(HalfOpacity, Sequentiality::Barrier, Exclusivity::Exclusive)
                .unwrap();
            applicator.stroke()
        };
        scheduler.wait_for_done();

        assert_eq!(
            scheduler.stroke_state(stroke),
            Some(crate::scheduler::StrokeState::Cancelled)
        );
        assert_eq!(opacity(&scheduler, layer), 255);
        assert_eq!(opacity(&scheduler, group), 255);
        scheduler.with_image(|image| assert!(!image.undo_stack().can_undo()));
    }
}
