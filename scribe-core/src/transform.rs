//! Index rebasing through an operation that has already been applied.
//!
//! Two consumers:
//! - [`transform`] keeps undo/redo entries pointing at the right span after a
//!   remote edit lands underneath them.
//! - [`transform_cursor`] moves other sessions' cursors through a local edit.
//!
//! Only positions move. `text`/`prevText` of a rebased operation are never
//! rewritten, so an entry whose span was edited concurrently replays its
//! original content.

use std::ops::Range;

use crate::operation::{Effect, Operation};

/// Rebase `local` so it still targets the right span after `remote` was applied.
///
/// A remote insert at or before `local.index` shifts it right. A remote
/// delete before `local.index` shifts it left by at most the gap; a remote
/// delete starting inside `local`'s span shrinks `local.length`. Replace and
/// inverted remote operations are rebased as their removal followed by their
/// insertion at the same index.
pub fn transform(local: &Operation, remote: &Operation) -> Operation {
    let mut rebased = local.clone();
    let Effect { index, removed, added } = remote.effect();

    if removed > 0 {
        rebase_over_delete(&mut rebased, index, removed);
    }
    if added > 0 {
        rebase_over_insert(&mut rebased, index, added);
    }
    rebased
}

fn rebase_over_insert(local: &mut Operation, at: usize, added: usize) {
    if at <= local.index {
        local.index += added;
    }
}

fn rebase_over_delete(local: &mut Operation, at: usize, removed: usize) {
    if at < local.index {
        local.index -= removed.min(local.index - at);
    } else if let Some(length) = local.length {
        let end = local.index + length;
        if at < end {
            local.length = Some(length - removed.min(end - at));
        }
    }
}

/// Move `cursor` through `op`, which has just been applied.
pub fn transform_cursor(cursor: usize, op: &Operation) -> usize {
    let Effect { index, removed, added } = op.effect();

    if removed == 0 {
        // Pure insertion (or a no-op when nothing is added either).
        if cursor < index || added == 0 {
            return cursor;
        }
        return cursor + added;
    }

    if cursor <= index {
        return cursor;
    }
    if cursor <= index + removed {
        return index + added;
    }
    cursor - removed + added
}

/// Where the author's caret lands after applying `op`.
pub fn final_cursor(op: &Operation) -> usize {
    let effect = op.effect();
    effect.index + effect.added
}

/// Span of text highlighted as "just changed" after applying `op`.
///
/// Inserted or re-inserted text is covered; a pure deletion yields an empty
/// range at the deletion point.
pub fn operation_range(op: &Operation) -> Range<usize> {
    op.index..final_cursor(op)
}
