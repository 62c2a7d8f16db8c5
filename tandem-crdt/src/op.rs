//! Operation identity and records.
//!
//! Every edit is an [`Operation`] with a globally unique [`OpId`]
//! (replica id + local sequence number). Inserted characters get an
//! [`ElementId`] derived from the inserting operation, and all later
//! operations address content by that identity — never by raw index —
//! so concurrent edits on different replicas cannot corrupt each other
//! through position drift.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one replica (one open editing session).
///
/// Ordering is lexicographic on the underlying string; ties between
/// concurrent operations with equal clocks are broken by the larger id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random replica id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one block within a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique operation id: replica id + local sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub client: ClientId,
    pub seq: u64,
}

impl OpId {
    pub fn new(client: ClientId, seq: u64) -> Self {
        Self { client, seq }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.seq)
    }
}

/// Identity of a single inserted character: the inserting operation
/// plus the character's offset within that operation's content run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub op: OpId,
    pub offset: u32,
}

impl ElementId {
    pub fn new(op: OpId, offset: u32) -> Self {
        Self { op, offset }
    }
}

/// Identity of a block content generation.
///
/// A block starts in the `Initial` generation; every whole-block
/// `update` creates a new generation keyed by `(clock, client)`. The
/// materialized content always comes from the maximum generation, which
/// encodes last-writer-wins with the lexicographic client tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenId {
    Initial,
    Update { clock: u64, client: ClientId },
}

/// Where an insert attaches.
///
/// The anchor is resolved from a visible position on the producing
/// replica and shipped as identity, so receiving replicas never
/// re-interpret raw indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOrigin {
    /// At the head of the given generation.
    Start { generation: GenId },
    /// Immediately after the named element (which may be tombstoned).
    After { element: ElementId },
}

/// The three edit kinds carried by the operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Splice `content` in after `origin`.
    Insert {
        origin: InsertOrigin,
        content: String,
    },
    /// Tombstone the named elements. Targets are identities, not a
    /// range, so a concurrent remote insert into the deleted span
    /// survives the merge untouched.
    Delete { targets: Vec<ElementId> },
    /// Whole-block replacement; last writer wins by `(clock, client)`.
    Update { content: String },
}

/// One atomic, idempotent edit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub block: BlockId,
    /// Lamport clock of the producing replica at creation time.
    pub clock: u64,
    pub kind: OperationKind,
}

impl Operation {
    /// The replica that produced this operation.
    pub fn client(&self) -> &ClientId {
        &self.id.client
    }
}
