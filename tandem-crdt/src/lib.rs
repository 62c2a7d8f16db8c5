//! # tandem-crdt — Conflict-free replicated document engine
//!
//! Per-client replica for collaboratively edited block documents.
//! Converts local edits into causally ordered operations and merges
//! remote operations deterministically, so every replica converges to
//! the same content without a central lock.
//!
//! ## Architecture
//!
//! ```text
//! local edit                     remote operation
//!     │                                │
//!     ▼                                ▼
//! CrdtDocument::insert/delete    CrdtDocument::apply_operation
//!     │  (resolve position →          │  (idempotence check,
//!     │   identity anchor)            │   causal buffering)
//!     ▼                                ▼
//! ┌──────────────────────────────────────────┐
//! │ Block — RGA elements + tombstones +      │
//! │         LWW update generations           │
//! └──────────────────────────────────────────┘
//!     │
//!     ▼
//! materialized content (block id → text)
//! ```
//!
//! ## Convergence rules
//!
//! - Operation ids make every apply idempotent.
//! - Concurrent inserts at one anchor order by `(clock, client)`
//!   descending — a total order identical on every replica.
//! - Deletes tombstone by insertion identity, never by index, so a
//!   concurrent insert into a deleted range loses nothing.
//! - Whole-block updates are last-writer-wins by `(clock, client)`.
//!
//! The engine does no networking; the session layer ships operations.

pub mod block;
pub mod document;
pub mod error;
pub mod op;
pub mod snapshot;

pub use block::Block;
pub use document::{CrdtDocument, DocumentContent};
pub use error::EngineError;
pub use op::{BlockId, ClientId, ElementId, GenId, InsertOrigin, Operation, OperationKind, OpId};
pub use snapshot::Snapshot;
