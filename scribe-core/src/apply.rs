//! Applying operations to text.
//!
//! | kind    | forward                          | inverted                                   |
//! |---------|----------------------------------|--------------------------------------------|
//! | insert  | `c[..i] + text + c[i..]`         | `c[..i] + c[i+len(text)..]`                |
//! | delete  | `c[..i] + c[i+length..]`         | `c[..i] + prevText + c[i..]`               |
//! | replace | `c[..i] + text + c[i+length..]`  | `c[..i] + prevText + c[i+len(text)..]`     |
//!
//! [`apply`] is the authoritative form used by the hub: it refuses anything
//! out of bounds. [`apply_clamped`] is the optimistic client form: it never
//! fails and clamps the span into the content instead.

use crate::error::OperationError;
use crate::operation::{char_len, OpKind, Operation};

/// Apply `op` to `content`, failing if the span falls outside the content.
pub fn apply(content: &str, op: &Operation) -> Result<String, OperationError> {
    op.validate()?;

    let len = char_len(content);
    let (remove, insert) = splice_parts(op);
    let start = op.index;
    let end = start.saturating_add(remove);
    if start > len || end > len {
        return Err(OperationError::OutOfBounds { start, end, len });
    }

    Ok(splice(content, start, remove, insert))
}

/// Apply `op` to `content`, clamping the span and treating missing fields as empty.
pub fn apply_clamped(content: &str, op: &Operation) -> String {
    let len = char_len(content);
    let (wanted, insert) = splice_parts(op);
    let start = op.index.min(len);
    let remove = wanted.min(len - start);
    if start != op.index || remove != wanted {
        log::debug!(
            "clamped {} at {} into content of length {len}",
            op.kind,
            op.index
        );
    }
    splice(content, start, remove, insert)
}

/// Characters to remove at `op.index`, and the text to put in their place.
fn splice_parts(op: &Operation) -> (usize, &str) {
    let text = op.text.as_deref().unwrap_or("");
    let prev_text = op.prev_text.as_deref().unwrap_or("");
    let length = op.length.unwrap_or(0);
    match (op.kind, op.invert) {
        (OpKind::Insert, false) => (0, text),
        (OpKind::Insert, true) => (char_len(text), ""),
        (OpKind::Delete, false) => (length, ""),
        (OpKind::Delete, true) => (0, prev_text),
        (OpKind::Replace, false) => (length, text),
        (OpKind::Replace, true) => (char_len(text), prev_text),
    }
}

/// Byte offset of the `chars`-th character, or `text.len()` past the end.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(offset, _)| offset)
}

fn splice(content: &str, start: usize, remove: usize, insert: &str) -> String {
    let start = byte_offset(content, start);
    let end = start + byte_offset(&content[start..], remove);

    let mut out = String::with_capacity(content.len() - (end - start) + insert.len());
    out.push_str(&content[..start]);
    out.push_str(insert);
    out.push_str(&content[end..]);
    out
}
