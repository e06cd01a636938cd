//! The edit unit exchanged between sessions and the hub.
//!
//! Wire shape (JSON, camelCase):
//! ```text
//! { opId, userId, docId, baseVersion, kind, index, length?, text?, prevText?, timestamp, invert? }
//! ```
//!
//! Identity fields (`opId`, `userId`, `docId`, `baseVersion`, `timestamp`) may be
//! absent on the wire; the hub fills whatever is missing before applying.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OperationError;

/// Number of Unicode scalar values in `text`.
///
/// Every index and length in this crate is measured in these units.
#[inline]
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Kind of edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Delete => "delete",
            OpKind::Replace => "replace",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single insert, delete or replace, with enough context to invert it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doc_id: String,
    /// Version the author believed was current.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    pub kind: OpKind,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Text removed by a delete/replace; replayed when the operation is inverted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub invert: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Net effect of an operation on the text, after accounting for `invert`.
///
/// `removed` characters starting at `index` disappear, then `added`
/// characters appear at the same `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub index: usize,
    pub removed: usize,
    pub added: usize,
}

impl Operation {
    fn bare(kind: OpKind, index: usize) -> Self {
        Self {
            op_id: String::new(),
            user_id: String::new(),
            doc_id: String::new(),
            base_version: None,
            kind,
            index,
            length: None,
            text: None,
            prev_text: None,
            timestamp: None,
            invert: false,
        }
    }

    /// Insert `text` at `index`.
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::bare(OpKind::Insert, index)
        }
    }

    /// Delete `prev_text`, which currently starts at `index`.
    pub fn delete(index: usize, prev_text: impl Into<String>) -> Self {
        let prev_text = prev_text.into();
        Self {
            length: Some(char_len(&prev_text)),
            prev_text: Some(prev_text),
            ..Self::bare(OpKind::Delete, index)
        }
    }

    /// Delete `length` characters without recording what they were.
    ///
    /// Such an operation applies forward but cannot be inverted.
    pub fn delete_len(index: usize, length: usize) -> Self {
        Self {
            length: Some(length),
            ..Self::bare(OpKind::Delete, index)
        }
    }

    /// Replace `prev_text` at `index` with `text`.
    pub fn replace(index: usize, prev_text: impl Into<String>, text: impl Into<String>) -> Self {
        let prev_text = prev_text.into();
        Self {
            length: Some(char_len(&prev_text)),
            prev_text: Some(prev_text),
            text: Some(text.into()),
            ..Self::bare(OpKind::Replace, index)
        }
    }

    /// Fill in authorship metadata with a fresh `opId` and the current time.
    pub fn stamped(mut self, user_id: &str, doc_id: &str, base_version: u64) -> Self {
        self.op_id = Uuid::new_v4().to_string();
        self.user_id = user_id.to_string();
        self.doc_id = doc_id.to_string();
        self.base_version = Some(base_version);
        self.timestamp = Some(Utc::now());
        self
    }

    /// The operation that undoes this one.
    pub fn inverted(&self) -> Self {
        Self {
            invert: true,
            ..self.clone()
        }
    }

    /// Check the structural invariants that do not depend on content.
    pub fn validate(&self) -> Result<(), OperationError> {
        let kind = self.kind;
        if matches!(kind, OpKind::Insert | OpKind::Replace) && self.text.is_none() {
            return Err(OperationError::MissingText { kind });
        }
        if matches!(kind, OpKind::Delete | OpKind::Replace) && self.length.unwrap_or(0) == 0 {
            return Err(OperationError::MissingLength { kind });
        }
        if self.invert && matches!(kind, OpKind::Delete | OpKind::Replace) && self.prev_text.is_none() {
            return Err(OperationError::MissingPrevText { kind });
        }
        Ok(())
    }

    pub fn text_len(&self) -> usize {
        self.text.as_deref().map_or(0, char_len)
    }

    pub fn prev_text_len(&self) -> usize {
        self.prev_text.as_deref().map_or(0, char_len)
    }

    /// Characters removed and added when this operation is applied.
    ///
    /// Inverting swaps the roles: an inverted insert removes its text, an
    /// inverted delete re-adds `prevText`.
    pub fn effect(&self) -> Effect {
        let (removed, added) = match (self.kind, self.invert) {
            (OpKind::Insert, false) => (0, self.text_len()),
            (OpKind::Insert, true) => (self.text_len(), 0),
            (OpKind::Delete, false) => (self.length.unwrap_or(0), 0),
            (OpKind::Delete, true) => (0, self.prev_text_len()),
            (OpKind::Replace, false) => (self.length.unwrap_or(0), self.text_len()),
            (OpKind::Replace, true) => (self.text_len(), self.prev_text_len()),
        };
        Effect {
            index: self.index,
            removed,
            added,
        }
    }
}

/// The shared document: one id, one version counter, one body of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub content: String,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            content: content.into(),
        }
    }
}
