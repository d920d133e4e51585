//! Stroke scheduler
//!
//! Runs strokes and dirty-region updates on one background worker. Callers
//! queue work and return immediately; only [`StrokeScheduler::wait_for_done`]
//! blocks.
//!
//! Two kinds of work share the worker:
//! - Stroke steps: init, jobs, finish and cancel of user edits
//! - Updates: the image's pending dirty regions, merged one at a time
//!
//! Updates are preferred until `balancing_ratio` of them ran back to back,
//! then one stroke step is let through. Barrier and exclusive jobs, and all
//! init, finish, cancel, undo and redo steps, wait until no update is
//! pending.

mod stroke;
mod updates;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use impasto_config::SchedulerConfig;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::commands::{CommandError, CompositeCommand, UndoCommand};
use crate::geometry::Rect;
use crate::image::Image;
use crate::node::NodeId;
use crate::signals::{ImageSignal, SignalRouter};

pub use stroke::{
    Exclusivity, Sequentiality, StrokeContext, StrokeId, StrokeJob, StrokeState, StrokeStrategy,
    UndoCommandStrategy,
};
pub use updates::{UpdateKind, UpdateQueue, UpdateRequest};

#[derive(Debug, Error)]
pub enum StrokeError {
    #[error("{0} does not accept jobs anymore")]
    NotAccepting(StrokeId),

    #[error("{0} is unknown")]
    UnknownStroke(StrokeId),

    #[error("{0} is still accepting jobs")]
    AlreadyActive(StrokeId),

    #[error("no target node to apply to")]
    NoTarget,

    #[error("failed to spawn the scheduler worker: {0}")]
    Spawn(#[from] std::io::Error),
}

enum Task {
    Init {
        stroke: StrokeId,
        strategy: Box<dyn StrokeStrategy>,
    },
    Job {
        stroke: StrokeId,
        job: StrokeJob,
    },
    Finish {
        stroke: StrokeId,
    },
    Cancel {
        stroke: StrokeId,
    },
    Undo,
    Redo,
}

impl Task {
    fn stroke(&self) -> Option<StrokeId> {
        match self {
            Task::Init { stroke, .. } | Task::Job { stroke, .. } | Task::Finish { stroke } | Task::Cancel { stroke } => {
                Some(*stroke)
            }
            Task::Undo | Task::Redo => None,
        }
    }

    fn flushes_updates(&self) -> bool {
        match self {
            Task::Job { job, .. } => job.flushes_updates(),
            _ => true,
        }
    }
}

enum Step {
    Update,
    Task(Task),
}

struct State {
    tasks: VecDeque<Task>,
    strokes: HashMap<StrokeId, StrokeState>,
    /// The image had pending updates when last checked
    updates_pending: bool,
    consecutive_updates: u32,
    /// The worker is running a step
    busy: bool,
    shutdown: bool,
}

impl State {
    fn new(updates_pending: bool) -> Self {
        Self {
            tasks: VecDeque::new(),
            strokes: HashMap::new(),
            updates_pending,
            consecutive_updates: 0,
            busy: false,
            shutdown: false,
        }
    }

    /// Pick the next step, or `None` when there is nothing to do
    fn next_step(&mut self, balancing_ratio: u32) -> Option<Step> {
        let task_first = match self.tasks.front() {
            Some(task) => {
                !self.updates_pending
                    || (!task.flushes_updates() && self.consecutive_updates >= balancing_ratio)
            }
            None => false,
        };
        if task_first {
            self.consecutive_updates = 0;
            return self.tasks.pop_front().map(Step::Task);
        }
        if self.updates_pending {
            self.consecutive_updates = self.consecutive_updates.saturating_add(1);
            return Some(Step::Update);
        }
        None
    }

    fn accepting_stroke(&self) -> Option<StrokeId> {
        self.strokes
            .iter()
            .find(|(_, state)| **state == StrokeState::Accepting)
            .map(|(stroke, _)| *stroke)
    }

    fn is_done(&self) -> bool {
        !self.busy && self.tasks.is_empty() && !self.updates_pending
    }
}

struct Shared {
    state: Mutex<State>,
    /// Wakes the worker
    work: Condvar,
    /// Wakes callers of `wait_for_done`
    idle: Condvar,
    balancing_ratio: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a stroke cancelled, drop its queued steps and put its rollback
    /// in front of everything else
    fn cancel(&self, stroke: StrokeId) -> Result<(), StrokeError> {
        let mut state = self.lock();
        match state.strokes.get(&stroke).copied() {
            None => Err(StrokeError::UnknownStroke(stroke)),
            Some(StrokeState::Committed | StrokeState::Cancelled) => Err(StrokeError::NotAccepting(stroke)),
            Some(StrokeState::Accepting | StrokeState::Ending) => {
                state.strokes.insert(stroke, StrokeState::Cancelled);
                state.tasks.retain(|task| task.stroke() != Some(stroke));
                state.tasks.push_front(Task::Cancel { stroke });
                self.work.notify_all();
                debug!("Cancelling {}", stroke);
                Ok(())
            }
        }
    }
}

struct ActiveStroke {
    strategy: Box<dyn StrokeStrategy>,
    /// Commands executed so far, oldest first
    executed: Vec<Box<dyn UndoCommand>>,
}

/// State owned by the worker thread
struct Worker {
    image: Arc<RwLock<Image>>,
    signals: Arc<SignalRouter>,
    shared: Arc<Shared>,
    active: HashMap<StrokeId, ActiveStroke>,
}

impl Worker {
    fn run(mut self) {
        debug!("Scheduler worker started");
        while let Some(step) = self.next_step() {
            match step {
                Step::Update => self.process_update(),
                Step::Task(task) => self.run_task(task),
            }
            self.finish_step();
        }
        debug!("Scheduler worker stopped");
    }

    fn next_step(&self) -> Option<Step> {
        let mut state = self.shared.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(step) = state.next_step(self.shared.balancing_ratio) {
                state.busy = true;
                return Some(step);
            }
            self.shared.idle.notify_all();
            state = self
                .shared
                .work
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish_step(&self) {
        let mut state = self.shared.lock();
        state.busy = false;
        state.updates_pending = self
            .image
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has_pending_updates();
    }

    /// Run `f` with the image locked, then deliver the signals it queued
    fn with_image<R>(&self, f: impl FnOnce(&mut Image) -> R) -> R {
        let (result, signals) = {
            let mut image = self.image.write().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut image);
            (result, image.take_signals())
        };
        self.signals.notify_all(signals);
        result
    }

    fn process_update(&self) {
        if let Err(err) = self.with_image(Image::process_next_update) {
            warn!("Update dropped: {}", err);
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Init { stroke, strategy } => self.init_stroke(stroke, strategy),
            Task::Job { stroke, job } => self.run_job(stroke, job),
            Task::Finish { stroke } => self.finish_stroke(stroke),
            Task::Cancel { stroke } => self.cancel_stroke(stroke),
            Task::Undo => self.history(true),
            Task::Redo => self.history(false),
        }
    }

    /// Run a strategy hook of an active stroke
    fn with_stroke<R>(
        &mut self,
        stroke: StrokeId,
        f: impl FnOnce(&mut Box<dyn StrokeStrategy>, &mut StrokeContext<'_>) -> R,
    ) -> Option<R> {
        let active = self.active.get_mut(&stroke)?;
        let (result, signals) = {
            let mut image = self.image.write().unwrap_or_else(PoisonError::into_inner);
            let mut context = StrokeContext::new(stroke, &mut image, &mut active.executed);
            let result = f(&mut active.strategy, &mut context);
            (result, image.take_signals())
        };
        self.signals.notify_all(signals);
        Some(result)
    }

    fn abort(&self, stroke: StrokeId, err: CommandError) {
        warn!("{} failed, rolling back: {}", stroke, err);
        if let Err(cancel) = self.shared.cancel(stroke) {
            debug!("{} already settled: {}", stroke, cancel);
        }
    }

    fn init_stroke(&mut self, stroke: StrokeId, strategy: Box<dyn StrokeStrategy>) {
        trace!("Init {} ({})", stroke, strategy.name());
        self.active.insert(
            stroke,
            ActiveStroke {
                strategy,
                executed: Vec::new(),
            },
        );
        if let Some(Err(err)) = self.with_stroke(stroke, |strategy, context| strategy.init(context)) {
            self.abort(stroke, err);
        }
    }

    fn run_job(&mut self, stroke: StrokeId, job: StrokeJob) {
        match self.with_stroke(stroke, |strategy, context| strategy.do_job(context, job)) {
            Some(Ok(())) => {}
            Some(Err(err)) => self.abort(stroke, err),
            None => warn!("Job for inactive {}", stroke),
        }
    }

    fn finish_stroke(&mut self, stroke: StrokeId) {
        match self.with_stroke(stroke, |strategy, context| strategy.finish(context)) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                self.abort(stroke, err);
                return;
            }
            None => {
                warn!("Finish for inactive {}", stroke);
                return;
            }
        }

        {
            let mut state = self.shared.lock();
            if state.strokes.get(&stroke) == Some(&StrokeState::Cancelled) {
                debug!("{} was cancelled while finishing", stroke);
                return;
            }
            state.strokes.insert(stroke, StrokeState::Committed);
        }

        let Some(ActiveStroke { strategy, executed }) = self.active.remove(&stroke) else {
            return;
        };
        let count = executed.len();
        self.with_image(|image| {
            if strategy.is_undoable() && !executed.is_empty() {
                let mut command = CompositeCommand::new(strategy.name());
                for child in executed {
                    command.push(child);
                }
                image.undo_stack_mut().push(Box::new(command));
            }
            image.emit(ImageSignal::StrokeEnded { stroke });
            image.announce_history();
        });
        debug!("Committed {} with {} commands", stroke, count);
    }

    fn cancel_stroke(&mut self, stroke: StrokeId) {
        let Some(ActiveStroke {
            mut strategy,
            mut executed,
        }) = self.active.remove(&stroke)
        else {
            // cancelled before its init step ran
            self.signals.notify(ImageSignal::StrokeCancelled { stroke });
            return;
        };
        let count = executed.len();
        self.with_image(|image| {
            let mut context = StrokeContext::new(stroke, image, &mut executed);
            if let Err(err) = strategy.cancel(&mut context) {
                warn!("Cancel hook of {} failed: {}", stroke, err);
            }
            while let Some(mut command) = executed.pop() {
                if let Err(err) = command.undo(image) {
                    error!("Rollback of '{}' in {} failed: {}", command.text(), stroke, err);
                }
            }
            image.emit(ImageSignal::StrokeCancelled { stroke });
        });
        debug!("Rolled back {} commands of {}", count, stroke);
    }

    fn history(&self, undo: bool) {
        let result = self.with_image(|image| if undo { image.undo() } else { image.redo() });
        if let Err(err) = result {
            warn!("{} failed: {}", if undo { "Undo" } else { "Redo" }, err);
        }
    }
}

/// Queues strokes and updates for an image and runs them on a background
/// worker
///
/// The image lives behind an `RwLock`; readers such as a canvas take the
/// read lock, the worker takes the write lock for every step. Signals are
/// delivered to the [`SignalRouter`] after the lock has been released.
pub struct StrokeScheduler {
    image: Arc<RwLock<Image>>,
    signals: Arc<SignalRouter>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl StrokeScheduler {
    pub fn new(image: Image, config: &SchedulerConfig) -> Result<Self, StrokeError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(image.has_pending_updates())),
            work: Condvar::new(),
            idle: Condvar::new(),
            balancing_ratio: config.effective_ratio(),
        });
        let image = Arc::new(RwLock::new(image));
        let signals = Arc::new(SignalRouter::new());

        let worker = Worker {
            image: Arc::clone(&image),
            signals: Arc::clone(&signals),
            shared: Arc::clone(&shared),
            active: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || worker.run())?;
        debug!(
            "Stroke scheduler started on '{}', balancing ratio {}",
            config.worker_name,
            config.effective_ratio()
        );

        Ok(Self {
            image,
            signals,
            shared,
            worker: Some(handle),
        })
    }

    /// Shared handle to the image
    pub fn image(&self) -> &Arc<RwLock<Image>> {
        &self.image
    }

    pub fn signals(&self) -> &Arc<SignalRouter> {
        &self.signals
    }

    /// Read the image. Blocks while the worker runs a step.
    pub fn with_image<R>(&self, f: impl FnOnce(&Image) -> R) -> R {
        let image = self.image.read().unwrap_or_else(PoisonError::into_inner);
        f(&image)
    }

    /// Edit the image outside any stroke. Updates it queues are picked up
    /// by the worker.
    pub fn with_image_mut<R>(&self, f: impl FnOnce(&mut Image) -> R) -> R {
        let (result, signals, pending) = {
            let mut image = self.image.write().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut image);
            (result, image.take_signals(), image.has_pending_updates())
        };
        self.signals.notify_all(signals);
        if pending {
            let mut state = self.shared.lock();
            state.updates_pending = true;
            self.shared.work.notify_all();
        }
        result
    }

    pub fn request_full_refresh(&self) {
        self.with_image_mut(Image::full_refresh_all);
    }

    pub fn request_update(&self, node: NodeId, rect: Rect) {
        self.with_image_mut(|image| image.set_dirty(node, rect));
    }

    /// Start a stroke. Only one stroke may accept jobs at a time; strokes
    /// that were ended still run to completion in the order they were
    /// ended.
    pub fn start_stroke(&self, strategy: Box<dyn StrokeStrategy>) -> Result<StrokeId, StrokeError> {
        let stroke = StrokeId::next();
        {
            let mut state = self.shared.lock();
            if let Some(active) = state.accepting_stroke() {
                warn!("Cannot start a stroke while {} accepts jobs", active);
                return Err(StrokeError::AlreadyActive(active));
            }
            debug!("Starting {} ({})", stroke, strategy.name());
            state.strokes.insert(stroke, StrokeState::Accepting);
            state.tasks.push_back(Task::Init { stroke, strategy });
            self.shared.work.notify_all();
        }
        self.signals.notify(ImageSignal::StrokeStarted { stroke });
        Ok(stroke)
    }

    /// Queue a job. Never blocks.
    pub fn add_job(&self, stroke: StrokeId, job: StrokeJob) -> Result<(), StrokeError> {
        let mut state = self.shared.lock();
        match state.strokes.get(&stroke) {
            Some(StrokeState::Accepting) => {
                trace!("Queued job for {}: {:?}", stroke, job);
                state.tasks.push_back(Task::Job { stroke, job });
                self.shared.work.notify_all();
                Ok(())
            }
            Some(other) => {
                warn!("Job added to {} in state {:?}, ignored", stroke, other);
                Err(StrokeError::NotAccepting(stroke))
            }
            None => Err(StrokeError::UnknownStroke(stroke)),
        }
    }

    /// Stop accepting jobs and commit once the queued ones ran
    pub fn end_stroke(&self, stroke: StrokeId) -> Result<(), StrokeError> {
        let mut state = self.shared.lock();
        match state.strokes.get(&stroke) {
            Some(StrokeState::Accepting) => {
                debug!("Ending {}", stroke);
                state.strokes.insert(stroke, StrokeState::Ending);
                state.tasks.push_back(Task::Finish { stroke });
                self.shared.work.notify_all();
                Ok(())
            }
            Some(other) => {
                warn!("End requested for {} in state {:?}", stroke, other);
                Err(StrokeError::NotAccepting(stroke))
            }
            None => Err(StrokeError::UnknownStroke(stroke)),
        }
    }

    /// Roll a stroke back. A job that is running finishes first and is
    /// undone with the rest; queued jobs never run.
    pub fn cancel_stroke(&self, stroke: StrokeId) -> Result<(), StrokeError> {
        self.shared.cancel(stroke).inspect_err(|err| {
            warn!("Cancel of {} refused: {}", stroke, err);
        })
    }

    pub fn stroke_state(&self, stroke: StrokeId) -> Option<StrokeState> {
        self.shared.lock().strokes.get(&stroke).copied()
    }

    /// Undo the newest history entry once the queue drained
    pub fn undo(&self) -> Result<(), StrokeError> {
        self.queue_history(Task::Undo)
    }

    pub fn redo(&self) -> Result<(), StrokeError> {
        self.queue_history(Task::Redo)
    }

    fn queue_history(&self, task: Task) -> Result<(), StrokeError> {
        let mut state = self.shared.lock();
        if let Some(active) = state.accepting_stroke() {
            warn!("History change refused while {} accepts jobs", active);
            return Err(StrokeError::AlreadyActive(active));
        }
        state.tasks.push_back(task);
        self.shared.work.notify_all();
        Ok(())
    }

    /// Block until every queued step and update has run. Must not be called
    /// from a signal listener, which runs on the worker.
    pub fn wait_for_done(&self) {
        let mut state = self.shared.lock();
        while !state.is_done() {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for StrokeScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            if !state.tasks.is_empty() {
                debug!("Scheduler dropped with {} queued steps", state.tasks.len());
            }
            self.shared.work.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Scheduler worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for StrokeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("StrokeScheduler")
            .field("queued", &state.tasks.len())
            .field("strokes", &state.strokes.len())
            .field("busy", &state.busy)
            .finish()
    }
}
