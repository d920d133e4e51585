//! Undoable commands
//!
//! Every edit that should survive in the history is an [`UndoCommand`]. The
//! building blocks here compose commands into strokes:
//! - [`CompositeCommand`]: ordered children, undone in reverse
//! - [`AggregateCommand`]: children built lazily on the worker at first redo
//! - [`FlipFlopCommand`]: begin/end brackets around a stroke
//! - [`LambdaCommand`]: ad-hoc redo/undo closures

mod node_commands;
mod undo_stack;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::image::Image;
use crate::merger::MergeError;
use crate::node::{GraphError, NodeId};
use crate::signals::ImageSignal;
use crate::tiles::TileError;

pub use node_commands::{
    AddNodeCommand, ChangeFilterCommand, DeviceTransactionCommand, MoveNodeCommand, NodePropertyCommand,
    PassThroughCommand, RemoveNodeCommand, TranslateLayerCommand,
};
pub use undo_stack::UndoStack;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("node {0} does not exist")]
    NotFound(NodeId),

    #[error("command '{0}' has not been applied")]
    NotApplied(String),

    #[error("{0}")]
    Failed(String),
}

/// A reversible edit of an image
///
/// `redo` is called once to apply the command and again after every undo.
/// Both directions either succeed completely or leave the image as it was.
pub trait UndoCommand: Send + Sync {
    /// Human readable label for the undo history
    fn text(&self) -> &str;

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError>;

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError>;
}

/// Ordered group of commands applied as one
pub struct CompositeCommand {
    text: String,
    children: Vec<Box<dyn UndoCommand>>,
}

impl CompositeCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            children: Vec::new(),
        }
    }

    pub fn push(&mut self, command: Box<dyn UndoCommand>) {
        self.children.push(command);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl UndoCommand for CompositeCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        for index in 0..self.children.len() {
            if let Err(err) = self.children[index].redo(image) {
                warn!("'{}' failed at child {}: {}", self.text, index, err);
                for done in self.children[..index].iter_mut().rev() {
                    if let Err(rollback) = done.undo(image) {
                        error!("Rollback of '{}' failed: {}", done.text(), rollback);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        let len = self.children.len();
        for index in (0..len).rev() {
            if let Err(err) = self.children[index].undo(image) {
                warn!("Undo of '{}' failed at child {}: {}", self.text, index, err);
                for undone in self.children[index + 1..].iter_mut() {
                    if let Err(rollback) = undone.redo(image) {
                        error!("Re-applying '{}' failed: {}", undone.text(), rollback);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompositeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeCommand")
            .field("text", &self.text)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Lifecycle of an [`AggregateCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePhase {
    /// Children not built yet
    Planned,
    /// Children built, currently not applied
    Populated,
    Applied,
}

type Populate = Box<dyn FnMut(&mut Image) -> Result<Vec<Box<dyn UndoCommand>>, CommandError> + Send + Sync>;

/// Command whose children are built by the first successful redo
///
/// The populate closure runs inside the worker with the image locked, so it
/// may inspect the graph as it is at that point of the stroke. It runs
/// exactly once; later redos replay the children it produced.
pub struct AggregateCommand {
    children: CompositeCommand,
    populate: Option<Populate>,
    phase: AggregatePhase,
}

impl AggregateCommand {
    pub fn new<F>(text: impl Into<String>, populate: F) -> Self
    where
        F: FnMut(&mut Image) -> Result<Vec<Box<dyn UndoCommand>>, CommandError> + Send + Sync + 'static,
    {
        Self {
            children: CompositeCommand::new(text),
            populate: Some(Box::new(populate)),
            phase: AggregatePhase::Planned,
        }
    }

    #[inline]
    pub fn phase(&self) -> AggregatePhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl UndoCommand for AggregateCommand {
    fn text(&self) -> &str {
        self.children.text()
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        if self.phase == AggregatePhase::Planned {
            if let Some(populate) = self.populate.as_mut() {
                let commands = populate(image)?;
                debug!("'{}' populated with {} commands", self.children.text(), commands.len());
                for command in commands {
                    self.children.push(command);
                }
            }
            self.populate = None;
            self.phase = AggregatePhase::Populated;
        }
        self.children.redo(image)?;
        self.phase = AggregatePhase::Applied;
        Ok(())
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        if self.phase != AggregatePhase::Applied {
            return Err(CommandError::NotApplied(self.children.text().to_string()));
        }
        self.children.undo(image)?;
        self.phase = AggregatePhase::Populated;
        Ok(())
    }
}

impl std::fmt::Debug for AggregateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateCommand")
            .field("text", &self.children.text())
            .field("phase", &self.phase)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Paired side effects bracketing a stroke
pub trait FlipFlopAction: Send + Sync {
    /// Runs when entering the bracket
    fn init(&mut self, image: &mut Image) -> Result<(), CommandError>;

    /// Runs when leaving the bracket
    fn end(&mut self, image: &mut Image) -> Result<(), CommandError>;
}

/// One half of a begin/end bracket
///
/// The initializing half runs `init` on redo and `end` on undo; the
/// finalizing half does the opposite. A stroke starts with the initializing
/// command and closes with the finalizing one, so each side effect runs
/// exactly once in either direction.
pub struct FlipFlopCommand<A> {
    text: String,
    finalizing: bool,
    action: A,
}

impl<A: FlipFlopAction> FlipFlopCommand<A> {
    pub fn with_action(text: impl Into<String>, finalizing: bool, action: A) -> Self {
        Self {
            text: text.into(),
            finalizing,
            action,
        }
    }

    #[inline]
    pub fn is_finalizing(&self) -> bool {
        self.finalizing
    }

    pub fn action(&self) -> &A {
        &self.action
    }
}

impl<A: FlipFlopAction> UndoCommand for FlipFlopCommand<A> {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        if self.finalizing {
            self.action.end(image)
        } else {
            self.action.init(image)
        }
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        if self.finalizing {
            self.action.init(image)
        } else {
            self.action.end(image)
        }
    }
}

impl<A> std::fmt::Debug for FlipFlopCommand<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlipFlopCommand")
            .field("text", &self.text)
            .field("finalizing", &self.finalizing)
            .finish()
    }
}

/// Suppresses projection notifications for the duration of a stroke
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableUiUpdates;

impl FlipFlopAction for DisableUiUpdates {
    fn init(&mut self, image: &mut Image) -> Result<(), CommandError> {
        image.disable_ui_updates();
        Ok(())
    }

    fn end(&mut self, image: &mut Image) -> Result<(), CommandError> {
        image.enable_ui_updates();
        Ok(())
    }
}

pub type DisableUiUpdatesCommand = FlipFlopCommand<DisableUiUpdates>;

impl FlipFlopCommand<DisableUiUpdates> {
    pub fn new(finalizing: bool) -> Self {
        Self::with_action("Disable UI updates", finalizing, DisableUiUpdates)
    }
}

/// Dirties a node once the bracketed edits are done
#[derive(Debug, Clone, Copy)]
pub struct UpdateNode {
    pub node: NodeId,
    /// Refresh the whole subtree instead of merging the node's rect
    pub recursive: bool,
}

impl FlipFlopAction for UpdateNode {
    fn init(&mut self, _image: &mut Image) -> Result<(), CommandError> {
        Ok(())
    }

    fn end(&mut self, image: &mut Image) -> Result<(), CommandError> {
        if image.node(self.node).is_none() {
            warn!("Update requested for missing node {}", self.node);
            return Ok(());
        }
        if self.recursive {
            let rect = image.node_extent(self.node);
            image.full_refresh(self.node, rect);
        } else {
            image.set_dirty_node(self.node);
        }
        Ok(())
    }
}

pub type UpdateNodeCommand = FlipFlopCommand<UpdateNode>;

impl FlipFlopCommand<UpdateNode> {
    pub fn new(node: NodeId, recursive: bool, finalizing: bool) -> Self {
        Self::with_action("Update node", finalizing, UpdateNode { node, recursive })
    }
}

/// Emits a fixed set of signals when leaving the bracket
#[derive(Debug, Clone, Default)]
pub struct EmitSignals {
    pub signals: Vec<ImageSignal>,
}

impl FlipFlopAction for EmitSignals {
    fn init(&mut self, _image: &mut Image) -> Result<(), CommandError> {
        Ok(())
    }

    fn end(&mut self, image: &mut Image) -> Result<(), CommandError> {
        for signal in &self.signals {
            image.emit(signal.clone());
        }
        Ok(())
    }
}

pub type EmitSignalsCommand = FlipFlopCommand<EmitSignals>;

impl FlipFlopCommand<EmitSignals> {
    pub fn new(signals: Vec<ImageSignal>, finalizing: bool) -> Self {
        Self::with_action("Emit signals", finalizing, EmitSignals { signals })
    }
}

type Step = Box<dyn FnMut(&mut Image) -> Result<(), CommandError> + Send + Sync>;

/// Command built from a pair of closures
pub struct LambdaCommand {
    text: String,
    redo: Step,
    undo: Step,
}

impl LambdaCommand {
    pub fn new<R, U>(text: impl Into<String>, redo: R, undo: U) -> Self
    where
        R: FnMut(&mut Image) -> Result<(), CommandError> + Send + Sync + 'static,
        U: FnMut(&mut Image) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            text: text.into(),
            redo: Box::new(redo),
            undo: Box::new(undo),
        }
    }
}

impl UndoCommand for LambdaCommand {
    fn text(&self) -> &str {
        &self.text
    }

    fn redo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        (self.redo)(image)
    }

    fn undo(&mut self, image: &mut Image) -> Result<(), CommandError> {
        (self.undo)(image)
    }
}

impl std::fmt::Debug for LambdaCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaCommand").field("text", &self.text).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use impasto_config::ImageConfig;

    use super::*;

    fn image() -> Image {
        Image::new(&ImageConfig::new(64, 64))
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn logged(log: &Log, name: &'static str) -> Box<dyn UndoCommand> {
        let redo_log = Arc::clone(log);
        let undo_log = Arc::clone(log);
        Box::new(LambdaCommand::new(
            name,
            move |_| {
                redo_log.lock().unwrap().push(format!("redo {name}"));
                Ok(())
            },
            move |_| {
                undo_log.lock().unwrap().push(format!("undo {name}"));
                Ok(())
            },
        ))
    }

    fn failing() -> Box<dyn UndoCommand> {
        Box::new(LambdaCommand::new(
            "failing",
            |_| Err(CommandError::Failed("boom".into())),
            |_| Ok(()),
        ))
    }

    #[test]
    fn test_composite_order_and_rollback() {
        let mut image = image();
        let log: Log = Arc::default();
        let mut composite = CompositeCommand::new("both");
        composite.push(logged(&log, "a"));
        composite.push(logged(&log, "b"));
        composite.redo(&mut image).unwrap();
        composite.undo(&mut image).unwrap();
        assert_eq!(*log.lock().unwrap(), ["redo a", "redo b", "undo b", "undo a"]);

        log.lock().unwrap().clear();
        let mut broken = CompositeCommand::new("broken");
        broken.push(logged(&log, "a"));
        broken.push(failing());
        broken.push(logged(&log, "c"));
        assert_eq!(
            broken.redo(&mut image).unwrap_err(),
            CommandError::Failed("boom".into())
        );
        assert_eq!(*log.lock().unwrap(), ["redo a", "undo a"]);
    }

    #[test]
    fn test_aggregate_populates_once() {
        let mut image = image();
        let log: Log = Arc::default();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let inner = Arc::clone(&log);
        let mut aggregate = AggregateCommand::new("lazy", move |_image: &mut Image| {
            *counter.lock().unwrap() += 1;
            Ok(vec![logged(&inner, "child")])
        });
        assert_eq!(aggregate.phase(), AggregatePhase::Planned);
        assert!(aggregate.undo(&mut image).is_err());

        aggregate.redo(&mut image).unwrap();
        assert_eq!(aggregate.phase(), AggregatePhase::Applied);
        aggregate.undo(&mut image).unwrap();
        assert_eq!(aggregate.phase(), AggregatePhase::Populated);
        aggregate.redo(&mut image).unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(aggregate.len(), 1);
        assert_eq!(*log.lock().unwrap(), ["redo child", "undo child", "redo child"]);
    }

    #[test]
    fn test_flip_flop_brackets() {
        let mut image = image();
        let mut begin = DisableUiUpdatesCommand::new(false);
        let mut finish = DisableUiUpdatesCommand::new(true);

        begin.redo(&mut image).unwrap();
        assert!(!image.ui_updates_enabled());
        finish.redo(&mut image).unwrap();
        assert!(image.ui_updates_enabled());

        // undo walks the bracket backwards
        finish.undo(&mut image).unwrap();
        assert!(!image.ui_updates_enabled());
        begin.undo(&mut image).unwrap();
        assert!(image.ui_updates_enabled());
    }

    #[test]
    fn test_emit_signals_on_both_directions() {
        let mut image = image();
        let signals = vec![ImageSignal::Modified];
        let mut begin = EmitSignalsCommand::new(signals.clone(), false);
        let mut finish = EmitSignalsCommand::new(signals, true);

        begin.redo(&mut image).unwrap();
        assert!(image.take_signals().is_empty());
        finish.redo(&mut image).unwrap();
        assert_eq!(image.take_signals(), vec![ImageSignal::Modified]);

        finish.undo(&mut image).unwrap();
        assert!(image.take_signals().is_empty());
        begin.undo(&mut image).unwrap();
        assert_eq!(image.take_signals(), vec![ImageSignal::Modified]);
    }

    #[test]
    fn test_update_node_dirties_on_end() {
        let mut image = image();
        let root = image.root();
        let mut layer = image.factory().paint_layer("layer");
        layer
            .original_mut()
            .unwrap()
            .fill(crate::geometry::Rect::new(0, 0, 4, 4), &[255, 0, 0, 255])
            .unwrap();
        let layer = image.graph_mut().push_node(layer, root).unwrap();

        let mut begin = UpdateNodeCommand::new(layer, false, false);
        begin.redo(&mut image).unwrap();
        assert!(!image.has_pending_updates());
        let mut finish = UpdateNodeCommand::new(layer, false, true);
        finish.redo(&mut image).unwrap();
        assert!(image.has_pending_updates());
    }
}
