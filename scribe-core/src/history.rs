//! Per-session undo/redo.
//!
//! Two unbounded stacks of forward operations. Undo replays the inverse of
//! the newest entry; redo replays the entry itself. Remote edits rebase
//! every stored entry in place via [`transform`], so positions stay valid
//! while the stored text does not change.
//!
//! All application here is optimistic ([`apply_clamped`]); the hub holds
//! the authoritative copy.

use crate::apply::apply_clamped;
use crate::operation::Operation;
use crate::transform::transform;

/// Undo and redo stacks for one editing session.
#[derive(Debug, Clone, Default)]
pub struct History {
    undo: Vec<Operation>,
    redo: Vec<Operation>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a local edit, record it for undo and invalidate redo.
    ///
    /// Returns the operation to transmit.
    pub fn apply_local(&mut self, content: &mut String, op: Operation) -> Operation {
        *content = apply_clamped(content, &op);
        self.undo.push(op.clone());
        self.redo.clear();
        log::trace!("applied local {} at {}, undo depth {}", op.kind, op.index, self.undo.len());
        op
    }

    /// Revert the newest local edit. Returns the inverted operation to transmit.
    pub fn undo(&mut self, content: &mut String) -> Option<Operation> {
        let op = self.undo.pop()?;
        let inverse = op.inverted();
        *content = apply_clamped(content, &inverse);
        self.redo.push(op);
        log::trace!("undo {} at {}", inverse.kind, inverse.index);
        Some(inverse)
    }

    /// Reapply the newest undone edit. Returns it for transmission.
    pub fn redo(&mut self, content: &mut String) -> Option<Operation> {
        let op = self.redo.pop()?;
        *content = apply_clamped(content, &op);
        self.undo.push(op.clone());
        log::trace!("redo {} at {}", op.kind, op.index);
        Some(op)
    }

    /// Fold a remote edit into `content` and rebase both stacks against it.
    pub fn on_remote_operation(&mut self, content: &mut String, remote: &Operation) {
        *content = apply_clamped(content, remote);
        for entry in self.undo.iter_mut().chain(self.redo.iter_mut()) {
            *entry = transform(entry, remote);
        }
    }

    /// Forget everything, e.g. after the document was replaced by a snapshot.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Undo entries, oldest first.
    pub fn undo_stack(&self) -> &[Operation] {
        &self.undo
    }

    /// Redo entries, oldest first.
    pub fn redo_stack(&self) -> &[Operation] {
        &self.redo
    }
}
