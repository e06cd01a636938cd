//! Single-span diff between two text snapshots.
//!
//! Scans the longest common prefix, then the longest common suffix of what
//! remains, and reports the middle as one insert, delete or replace.
//!
//! The result is not always minimal. Typing into a run of identical
//! characters (`"aaa"` → `"aaaa"`) is reported at the end of the run rather
//! than at the caret, and a change that touches two separate places becomes
//! one replace spanning both. Both still apply to exactly the new text.

use crate::operation::Operation;

/// Compute the operation that turns `old` into `new`, or `None` if they are equal.
///
/// The returned operation carries no identity; stamp it before sending.
pub fn diff(old: &str, new: &str) -> Option<Operation> {
    if old == new {
        return None;
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();

    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed: String = old_chars[prefix..old_chars.len() - suffix].iter().collect();
    let added: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    match (removed.is_empty(), added.is_empty()) {
        (true, true) => None,
        (false, true) => Some(Operation::delete(prefix, removed)),
        (true, false) => Some(Operation::insert(prefix, added)),
        (false, false) => Some(Operation::replace(prefix, removed, added)),
    }
}
