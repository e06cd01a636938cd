//! # scribe-core: text operation algebra for collaborative editing
//!
//! Pure, synchronous building blocks shared by the hub and every client.
//! Nothing in this crate performs I/O.
//!
//! ## Pipeline
//!
//! ```text
//!  old text ─┐
//!            ├── diff() ──► Operation ──► History::apply_local()
//!  new text ─┘                                  │
//!                                               ▼
//!                                    apply() / apply_clamped()
//!                                               │
//!          remote Operation ──► History::on_remote_operation()
//!                                               │
//!                                  transform() over undo + redo
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: `Operation`, `OpKind`, `Document` and their invariants
//! - [`diff`]: prefix/suffix diff between two snapshots
//! - [`apply`]: strict and clamped application, including inversion
//! - [`transform`]: index rebasing for operations and cursors
//! - [`history`]: per-session undo/redo stacks
//!
//! All indices and lengths count Unicode scalar values (`char`s).

pub mod apply;
pub mod diff;
pub mod error;
pub mod history;
pub mod operation;
pub mod transform;

pub use apply::{apply, apply_clamped};
pub use diff::diff;
pub use error::OperationError;
pub use history::History;
pub use operation::{char_len, Document, Effect, OpKind, Operation};
pub use transform::{final_cursor, operation_range, transform, transform_cursor};
