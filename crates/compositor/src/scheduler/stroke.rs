//! Strokes, jobs and stroke strategies

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::commands::{CommandError, DeviceTransactionCommand, UndoCommand};
use crate::device::PaintDevice;
use crate::image::Image;
use crate::node::NodeId;
use crate::tiles::TileError;

static NEXT_STROKE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stroke identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrokeId(u64);

impl StrokeId {
    pub fn next() -> Self {
        Self(NEXT_STROKE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StrokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stroke {}", self.0)
    }
}

/// Where a stroke is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokeState {
    /// Started; jobs may be added
    Accepting,
    /// Ended by the caller, finish step not run yet
    Ending,
    /// Finished and recorded in the undo history
    Committed,
    /// Rolled back or about to be
    Cancelled,
}

/// Ordering of a job relative to its neighbours
///
/// With a single worker every job already runs alone in FIFO order;
/// `Concurrent` is accepted so callers can state that a job would tolerate
/// running in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sequentiality {
    #[default]
    Sequential,
    Concurrent,
    /// All earlier work, including pending updates, completes first
    Barrier,
    UniquelyConcurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exclusivity {
    #[default]
    Normal,
    /// Nothing else, not even an update, runs alongside
    Exclusive,
}

type Work = Box<dyn FnOnce(&mut StrokeContext<'_>) -> Result<(), CommandError> + Send>;

/// One unit of work of a stroke
pub struct StrokeJob {
    sequentiality: Sequentiality,
    exclusivity: Exclusivity,
    work: Work,
}

impl StrokeJob {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&mut StrokeContext<'_>) -> Result<(), CommandError> + Send + 'static,
    {
        Self {
            sequentiality: Sequentiality::Sequential,
            exclusivity: Exclusivity::Normal,
            work: Box::new(work),
        }
    }

    /// Job that runs only after everything queued before it
    pub fn barrier<F>(work: F) -> Self
    where
        F: FnOnce(&mut StrokeContext<'_>) -> Result<(), CommandError> + Send + 'static,
    {
        Self::new(work).with_sequentiality(Sequentiality::Barrier)
    }

    pub fn with_sequentiality(mut self, sequentiality: Sequentiality) -> Self {
        self.sequentiality = sequentiality;
        self
    }

    pub fn with_exclusivity(mut self, exclusivity: Exclusivity) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    #[inline]
    pub fn sequentiality(&self) -> Sequentiality {
        self.sequentiality
    }

    #[inline]
    pub fn exclusivity(&self) -> Exclusivity {
        self.exclusivity
    }

    /// Pending updates must be merged before this job starts
    pub fn flushes_updates(&self) -> bool {
        self.sequentiality == Sequentiality::Barrier || self.exclusivity == Exclusivity::Exclusive
    }

    pub fn run(self, context: &mut StrokeContext<'_>) -> Result<(), CommandError> {
        (self.work)(context)
    }
}

impl fmt::Debug for StrokeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrokeJob")
            .field("sequentiality", &self.sequentiality)
            .field("exclusivity", &self.exclusivity)
            .finish()
    }
}

/// What a running job sees: the locked image and the stroke's command log
pub struct StrokeContext<'a> {
    stroke: StrokeId,
    image: &'a mut Image,
    executed: &'a mut Vec<Box<dyn UndoCommand>>,
}

impl<'a> StrokeContext<'a> {
    pub(crate) fn new(stroke: StrokeId, image: &'a mut Image, executed: &'a mut Vec<Box<dyn UndoCommand>>) -> Self {
        Self {
            stroke,
            image,
            executed,
        }
    }

    #[inline]
    pub fn stroke(&self) -> StrokeId {
        self.stroke
    }

    pub fn image(&self) -> &Image {
        &*self.image
    }

    /// Raw image access. Changes made here bypass the stroke's undo log and
    /// are not rolled back on cancel.
    pub fn image_mut(&mut self) -> &mut Image {
        &mut *self.image
    }

    /// Apply a command and record it for commit or rollback
    pub fn execute(&mut self, mut command: Box<dyn UndoCommand>) -> Result<(), CommandError> {
        command.redo(&mut *self.image)?;
        trace!("{} executed '{}'", self.stroke, command.text());
        self.executed.push(command);
        Ok(())
    }

    /// Paint on a layer's original inside a tile transaction. The change is
    /// dirtied and logged as one undoable command; a failing closure leaves
    /// the device as it was.
    pub fn paint<F>(&mut self, node: NodeId, paint: F) -> Result<(), CommandError>
    where
        F: FnOnce(&mut PaintDevice) -> Result<(), TileError>,
    {
        let device = self
            .image
            .graph_mut()
            .original_mut(node)
            .ok_or(CommandError::NotFound(node))?;
        device.begin_transaction();
        let result = paint(device);
        let memento = device.end_transaction();
        if let Err(err) = result {
            if let Some(memento) = &memento {
                device.rollback(memento);
            }
            return Err(err.into());
        }
        let Some(memento) = memento.filter(|memento| !memento.is_empty()) else {
            return Ok(());
        };
        let rect = device.memento_rect(&memento);
        self.image.set_dirty(node, rect);
        self.execute(Box::new(DeviceTransactionCommand::applied(node, memento)))
    }

    /// Number of commands executed so far
    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }
}

/// Behaviour of a stroke around its jobs
///
/// Every hook runs on the scheduler worker with the image locked. Commands
/// executed through the context end up in the stroke's undo entry, or are
/// undone in reverse order if the stroke is cancelled.
pub trait StrokeStrategy: Send {
    fn name(&self) -> &str;

    /// Whether a committed stroke leaves an undo entry
    fn is_undoable(&self) -> bool {
        true
    }

    fn init(&mut self, _context: &mut StrokeContext<'_>) -> Result<(), CommandError> {
        Ok(())
    }

    fn do_job(&mut self, context: &mut StrokeContext<'_>, job: StrokeJob) -> Result<(), CommandError> {
        job.run(context)
    }

    fn finish(&mut self, _context: &mut StrokeContext<'_>) -> Result<(), CommandError> {
        Ok(())
    }

    /// Runs before the executed commands are undone
    fn cancel(&mut self, _context: &mut StrokeContext<'_>) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Standard strategy: optional commands at init and finish, jobs run as
/// given
pub struct UndoCommandStrategy {
    name: String,
    init_command: Option<Box<dyn UndoCommand>>,
    finish_command: Option<Box<dyn UndoCommand>>,
    undoable: bool,
}

impl UndoCommandStrategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init_command: None,
            finish_command: None,
            undoable: true,
        }
    }

    pub fn with_init_command(mut self, command: Box<dyn UndoCommand>) -> Self {
        self.init_command = Some(command);
        self
    }

    pub fn with_finish_command(mut self, command: Box<dyn UndoCommand>) -> Self {
        self.finish_command = Some(command);
        self
    }

    /// Committed strokes of this strategy leave no undo entry
    pub fn not_undoable(mut self) -> Self {
        self.undoable = false;
        self
    }
}

impl StrokeStrategy for UndoCommandStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_undoable(&self) -> bool {
        self.undoable
    }

    fn init(&mut self, context: &mut StrokeContext<'_>) -> Result<(), CommandError> {
        match self.init_command.take() {
            Some(command) => context.execute(command),
            None => Ok(()),
        }
    }

    fn finish(&mut self, context: &mut StrokeContext<'_>) -> Result<(), CommandError> {
        match self.finish_command.take() {
            Some(command) => context.execute(command),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for UndoCommandStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoCommandStrategy")
            .field("name", &self.name)
            .field("undoable", &self.undoable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use impasto_config::ImageConfig;

    use super::*;
    use crate::geometry::Rect;

    #[test]
    fn test_job_flags() {
        let job = StrokeJob::new(|_| Ok(()));
        assert_eq!(job.sequentiality(), Sequentiality::Sequential);
        assert!(!job.flushes_updates());
        assert!(StrokeJob::barrier(|_| Ok(())).flushes_updates());
        let exclusive = StrokeJob::new(|_| Ok(())).with_exclusivity(Exclusivity::Exclusive);
        assert!(exclusive.flushes_updates());
    }

    #[test]
    fn test_paint_records_transaction() {
        let mut image = Image::new(&ImageConfig::new(64, 64));
        let root = image.root();
        let layer = image.factory().paint_layer("layer");
        let layer = image.graph_mut().push_node(layer, root).unwrap();
        let mut executed = Vec::new();
        let mut context = StrokeContext::new(StrokeId::next(), &mut image, &mut executed);

        context
            .paint(layer, |device| device.fill(Rect::new(0, 0, 4, 4), &[9, 9, 9, 255]))
            .unwrap();
        // untouched devices record nothing
        context.paint(layer, |_| Ok(())).unwrap();
        assert_eq!(context.executed_count(), 1);

        let err = context.paint(layer, |device| {
            device.fill(Rect::new(0, 0, 4, 4), &[1, 1, 1, 255])?;
            Err(TileError::OutOfMemory {
                requested: 1,
                available: 0,
            })
        });
        assert!(err.is_err());
        assert_eq!(context.executed_count(), 1);
        assert_eq!(image.graph().original(layer).unwrap().pixel(1, 1), &[9, 9, 9, 255]);
        assert!(image.has_pending_updates());

        executed[0].undo(&mut image).unwrap();
        assert_eq!(image.graph().original(layer).unwrap().pixel(1, 1)[3], 0);
    }
}
