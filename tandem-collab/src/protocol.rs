//! JSON wire protocol for the room broadcast channel.
//!
//! One logical topic per room carries [`CollaborationMessage`] values,
//! tagged by `type` and dispatched by kind on receipt:
//!
//! ```text
//! presence / cursor / selection ──► PresenceTracker
//! crdt (base64 operation batch) ──► CrdtDocument::apply_operation
//! op (opaque structural batch)  ──► pending buffer for consumers
//! system (room_closed, version_conflict) ──► session lifecycle
//! ```
//!
//! The outer envelope is JSON so that any peer on the channel can route
//! it; the CRDT operation batch inside a `crdt` message stays opaque —
//! bincode-encoded, then base64 — and only the engine interprets it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use tandem_crdt::Operation;

use crate::presence::{CursorPosition, PresenceUser, SelectionRange};

/// Server-pushed lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    RoomClosed,
    VersionConflict,
}

/// Why a room was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The room's token lifetime ended; rejoining gets a fresh room.
    Expired,
    /// An administrator closed the room; the session is over.
    AdminClosed,
}

/// Everything that travels on a room's broadcast topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollaborationMessage {
    /// Roster update; last write per user wins.
    Presence { user: PresenceUser },

    /// Ephemeral caret move. Never enters the CRDT log.
    #[serde(rename_all = "camelCase")]
    Cursor {
        user_id: String,
        position: CursorPosition,
        at: u64,
    },

    /// Ephemeral selection change. Never enters the CRDT log.
    #[serde(rename_all = "camelCase")]
    Selection {
        user_id: String,
        range: SelectionRange,
        at: u64,
    },

    /// CRDT operation batch: base64 over bincode, plus the sender's
    /// clock after producing the batch.
    #[serde(rename_all = "camelCase")]
    Crdt {
        user_id: String,
        payload: String,
        clock: u64,
    },

    /// Generic structural operation batch, treated opaquely.
    #[serde(rename_all = "camelCase")]
    Op {
        user_id: String,
        ops: Vec<serde_json::Value>,
        base_version: u64,
        op_id: String,
    },

    /// Server lifecycle signal.
    #[serde(rename_all = "camelCase")]
    System {
        action: SystemAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<CloseReason>,
    },
}

impl CollaborationMessage {
    /// Build a `crdt` message from an operation batch.
    pub fn crdt(
        user_id: impl Into<String>,
        ops: &[Operation],
        clock: u64,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::Crdt {
            user_id: user_id.into(),
            payload: encode_op_batch(ops)?,
            clock,
        })
    }

    pub fn presence(user: PresenceUser) -> Self {
        Self::Presence { user }
    }

    pub fn cursor(user_id: impl Into<String>, position: CursorPosition, at: u64) -> Self {
        Self::Cursor {
            user_id: user_id.into(),
            position,
            at,
        }
    }

    pub fn selection(user_id: impl Into<String>, range: SelectionRange, at: u64) -> Self {
        Self::Selection {
            user_id: user_id.into(),
            range,
            at,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire form. Unknown `type` values and
    /// malformed JSON both fail here; the dispatcher logs and drops.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// The sending user, where the message carries one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Presence { user } => Some(&user.user_id),
            Self::Cursor { user_id, .. }
            | Self::Selection { user_id, .. }
            | Self::Crdt { user_id, .. }
            | Self::Op { user_id, .. } => Some(user_id),
            Self::System { .. } => None,
        }
    }
}

/// Encode an operation batch: bincode, then base64.
pub fn encode_op_batch(ops: &[Operation]) -> Result<String, ProtocolError> {
    let bytes = bincode::serde::encode_to_vec(ops, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// Decode an operation batch produced by [`encode_op_batch`].
pub fn decode_op_batch(payload: &str) -> Result<Vec<Operation>, ProtocolError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| ProtocolError::Payload(e.to_string()))?;
    let (ops, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Payload(e.to_string()))?;
    Ok(ops)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    /// The envelope was fine but the opaque payload was not.
    Payload(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::Payload(e) => write!(f, "payload error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
