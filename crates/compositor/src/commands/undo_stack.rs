//! Bounded undo history

use tracing::debug;

use super::UndoCommand;

/// Two-stack undo history with a depth limit
///
/// Commands are pushed after they have been applied. Pushing a new command
/// drops everything that was undone; exceeding the limit drops the oldest
/// entry.
pub struct UndoStack {
    /// Applied commands, most recent at the end
    done: Vec<Box<dyn UndoCommand>>,
    /// Undone commands, most recently undone at the end
    undone: Vec<Box<dyn UndoCommand>>,
    /// Maximum number of applied commands kept
    limit: usize,
}

impl UndoStack {
    pub fn new(limit: usize) -> Self {
        Self {
            done: Vec::new(),
            undone: Vec::new(),
            limit,
        }
    }

    /// Record an applied command
    pub fn push(&mut self, command: Box<dyn UndoCommand>) {
        debug!("Undo stack push '{}'", command.text());
        self.undone.clear();
        self.done.push(command);
        self.enforce_limit();
    }

    fn enforce_limit(&mut self) {
        if self.done.len() > self.limit {
            let excess = self.done.len() - self.limit;
            self.done.drain(..excess);
            debug!("Undo stack trimmed {} oldest entries", excess);
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.enforce_limit();
    }

    pub fn can_undo(&self) -> bool {
        !self.done.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.done.len()
    }

    pub fn redo_count(&self) -> usize {
        self.undone.len()
    }

    pub fn undo_text(&self) -> Option<&str> {
        self.done.last().map(|command| command.text())
    }

    pub fn redo_text(&self) -> Option<&str> {
        self.undone.last().map(|command| command.text())
    }

    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
    }

    /// Remove the next command to undo. The caller undoes it and hands it
    /// back through [`push_undone`](Self::push_undone).
    pub(crate) fn take_undo(&mut self) -> Option<Box<dyn UndoCommand>> {
        self.done.pop()
    }

    pub(crate) fn push_undone(&mut self, command: Box<dyn UndoCommand>) {
        self.undone.push(command);
    }

    pub(crate) fn take_redo(&mut self) -> Option<Box<dyn UndoCommand>> {
        self.undone.pop()
    }

    /// Return a redone command without dropping the rest of the redo side
    pub(crate) fn push_redone(&mut self, command: Box<dyn UndoCommand>) {
        self.done.push(command);
        self.enforce_limit();
    }
}

impl std::fmt::Debug for UndoStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoStack")
            .field("undo_count", &self.done.len())
            .field("redo_count", &self.undone.len())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::LambdaCommand;

    fn noop(text: &str) -> Box<dyn UndoCommand> {
        Box::new(LambdaCommand::new(text, |_| Ok(()), |_| Ok(())))
    }

    #[test]
    fn test_limit_drops_oldest() {
        let mut stack = UndoStack::new(2);
        stack.push(noop("a"));
        stack.push(noop("b"));
        stack.push(noop("c"));
        assert_eq!(stack.undo_count(), 2);
        assert_eq!(stack.undo_text(), Some("c"));

        stack.set_limit(1);
        assert_eq!(stack.undo_count(), 1);
    }

    #[test]
    fn test_push_clears_redo() {
        let mut stack = UndoStack::new(10);
        stack.push(noop("a"));
        let command = stack.take_undo().unwrap();
        stack.push_undone(command);
        assert!(stack.can_redo());
        assert_eq!(stack.redo_text(), Some("a"));

        stack.push(noop("b"));
        assert!(!stack.can_redo());
        assert_eq!(stack.undo_count(), 1);
    }
}
