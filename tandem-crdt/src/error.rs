//! Engine error taxonomy.

use crate::op::BlockId;

/// Errors from feeding the engine bad local input.
///
/// These are programming errors on the caller's side and fail fast;
/// they are never produced while merging remote operations (remote
/// operations that cannot apply yet are buffered, not rejected).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A position past the block's current visible length. Positions
    /// are unsigned, so only overflow past the end can occur; the
    /// caller must clamp or re-read state first.
    InvalidPosition {
        block: BlockId,
        position: usize,
        len: usize,
    },
    /// An edit addressed a block this replica has never seen.
    UnknownBlock(BlockId),
    /// A structurally invalid operation (empty content where content is
    /// required, zero-length delete, and the like).
    MalformedOperation(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidPosition {
                block,
                position,
                len,
            } => write!(
                f,
                "invalid position {position} in block {block} (visible length {len})"
            ),
            EngineError::UnknownBlock(block) => write!(f, "unknown block: {block}"),
            EngineError::MalformedOperation(msg) => write!(f, "malformed operation: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EngineError::InvalidPosition {
            block: BlockId::new("b1"),
            position: 9,
            len: 3,
        };
        assert_eq!(
            err.to_string(),
            "invalid position 9 in block b1 (visible length 3)"
        );
        assert_eq!(
            EngineError::UnknownBlock(BlockId::new("b2")).to_string(),
            "unknown block: b2"
        );
    }
}
