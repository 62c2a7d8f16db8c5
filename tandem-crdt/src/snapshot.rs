//! Serializable document checkpoints.

use serde::{Deserialize, Serialize};

use crate::document::DocumentContent;
use crate::op::Operation;

/// A point-in-time materialized copy of a replica's state.
///
/// Used to bootstrap a newly joining client and to resynchronize after
/// a version conflict. Created on demand and never mutated in place;
/// the receiver replays `operations` through the normal merge path and
/// treats `content` as a cross-check, not as authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Producing replica's clock at checkpoint time.
    pub clock: u64,
    /// The full applied operation log, deterministically ordered.
    pub operations: Vec<Operation>,
    /// Materialized view at checkpoint time.
    pub content: DocumentContent,
}

impl Snapshot {
    /// An empty checkpoint, the bootstrap state of a brand-new document.
    pub fn empty() -> Self {
        Self {
            clock: 0,
            operations: Vec::new(),
            content: DocumentContent::new(),
        }
    }
}
