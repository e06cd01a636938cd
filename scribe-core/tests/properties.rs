//! Property-based tests for the operation algebra.
//!
//!  - Invertibility: apply(apply(c, op), op⁻¹) = c
//!  - Diff round-trip: apply(a, diff(a, b)) = b, diff(a, a) = None
//!  - Cursor monotonicity under inserts
//!  - Rebased indices stay within bounds

use proptest::prelude::*;
use scribe_core::{apply, char_len, diff, transform, transform_cursor, Operation};

/// Short strings mixing ASCII and multibyte characters.
fn text_strategy() -> impl Strategy<Value = String> {
    "[a-cé日 ]{0,16}"
}

fn non_empty_text() -> impl Strategy<Value = String> {
    "[x-zß]{1,6}"
}

fn slice(content: &str, start: usize, len: usize) -> String {
    content.chars().skip(start).take(len).collect()
}

/// Content together with an operation that applies cleanly to it.
fn content_and_op() -> impl Strategy<Value = (String, Operation)> {
    text_strategy().prop_flat_map(|content| {
        let len = char_len(&content);
        let insert = (0..=len, non_empty_text())
            .prop_map(|(index, text)| Operation::insert(index, text))
            .boxed();
        let op = if len == 0 {
            insert
        } else {
            let c1 = content.clone();
            let c2 = content.clone();
            let delete = (0..len)
                .prop_flat_map(move |index| (Just(index), 1..=len - index))
                .prop_map(move |(index, n)| Operation::delete(index, slice(&c1, index, n)));
            let replace = (0..len)
                .prop_flat_map(move |index| (Just(index), 1..=len - index, non_empty_text()))
                .prop_map(move |(index, n, text)| {
                    Operation::replace(index, slice(&c2, index, n), text)
                });
            prop_oneof![insert, delete, replace].boxed()
        };
        (Just(content), op)
    })
}

proptest! {
    #[test]
    fn prop_apply_then_invert_restores((content, op) in content_and_op()) {
        let applied = apply(&content, &op).unwrap();
        let restored = apply(&applied, &op.inverted()).unwrap();
        prop_assert_eq!(restored, content);
    }

    #[test]
    fn prop_diff_round_trip(a in text_strategy(), b in text_strategy()) {
        match diff(&a, &b) {
            Some(op) => {
                prop_assert_eq!(apply(&a, &op).unwrap(), b);
            }
            None => {
                prop_assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn prop_diff_identical_is_none(a in text_strategy()) {
        prop_assert!(diff(&a, &a).is_none());
    }

    #[test]
    fn prop_diff_inverts(a in text_strategy(), b in text_strategy()) {
        if let Some(op) = diff(&a, &b) {
            prop_assert_eq!(apply(&b, &op.inverted()).unwrap(), a);
        }
    }

    #[test]
    fn prop_cursor_monotonic_under_insert(
        index in 0usize..50,
        cursor in 0usize..100,
        text in non_empty_text(),
    ) {
        let added = char_len(&text);
        let op = Operation::insert(index, text);
        let moved = transform_cursor(cursor, &op);
        if cursor < index {
            prop_assert_eq!(moved, cursor);
        } else {
            prop_assert_eq!(moved, cursor + added);
        }
    }

    #[test]
    fn prop_cursor_never_passes_delete_start(
        index in 0usize..50,
        cursor in 0usize..100,
        length in 1usize..20,
    ) {
        let op = Operation::delete_len(index, length);
        let moved = transform_cursor(cursor, &op);
        prop_assert!(moved <= cursor);
        if cursor > index {
            prop_assert!(moved >= index);
        }
    }

    #[test]
    fn prop_transform_stays_in_bounds(
        (_content, local) in content_and_op(),
        remote_index in 0usize..40,
        remote_len in 1usize..40,
    ) {
        let remote = Operation::delete_len(remote_index, remote_len);
        let rebased = transform(&local, &remote);
        prop_assert!(rebased.index <= local.index);
        prop_assert!(rebased.index >= local.index.saturating_sub(remote_len));
        if let (Some(before), Some(after)) = (local.length, rebased.length) {
            prop_assert!(after <= before);
        }
    }
}
