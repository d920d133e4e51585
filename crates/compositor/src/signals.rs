//! Image notifications for the outside world
//!
//! The image queues [`ImageSignal`]s while it is locked; the scheduler
//! drains the queue once the lock is released and hands every signal to the
//! listeners of a [`SignalRouter`]. Listeners therefore never run with the
//! image locked and may read it freely.

use std::sync::{PoisonError, RwLock};

use tracing::trace;

use crate::geometry::Rect;
use crate::node::NodeId;
use crate::scheduler::StrokeId;

/// Signal kinds observed by canvases, layer docks and the undo view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSignal {
    /// Content changed in a way that marks the document as modified
    Modified,
    /// `rect` of the image projection was recomposited
    ProjectionUpdated { rect: Rect },
    NodeAdded { node: NodeId },
    NodeRemoved { node: NodeId },
    /// Properties or content of a node changed
    NodeChanged { node: NodeId },
    /// The current node should be re-selected, e.g. after a structural undo
    ComplexNodeReselection { node: Option<NodeId> },
    StrokeStarted { stroke: StrokeId },
    StrokeEnded { stroke: StrokeId },
    StrokeCancelled { stroke: StrokeId },
    UndoStackChanged { undo_count: usize, redo_count: usize },
}

/// Fan-out of image signals to registered listeners
pub struct SignalRouter {
    #[allow(clippy::type_complexity)]
    listeners: RwLock<Vec<Box<dyn Fn(ImageSignal) + Send + Sync>>>,
}

impl std::fmt::Debug for SignalRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRouter")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Each listener receives its own clone of every
    /// signal, in emission order.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(ImageSignal) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.push(Box::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Deliver one signal
    pub fn notify(&self, signal: ImageSignal) {
        trace!("Signal {:?}", signal);
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(signal.clone());
        }
    }

    /// Deliver a batch in order
    pub fn notify_all(&self, signals: impl IntoIterator<Item = ImageSignal>) {
        for signal in signals {
            self.notify(signal);
        }
    }
}
