//! # tandem-collab — Real-time collaboration session layer
//!
//! Binds a document to an ephemeral room and keeps every participant
//! converged: CRDT operation sync, presence, cursors, and selections
//! over one broadcast topic per room.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   create/join/bootstrap   ┌──────────────────┐
//! │ SessionHandle │ ────────────────────────► │ RoomDirectory    │
//! │  (per client) │                           │ (HTTP façade)    │
//! └──────┬────────┘                           └──────────────────┘
//!        │ RoomInfo.joinToken
//!        ▼
//! ┌───────────────┐    JSON frames    ┌───────────────────────┐
//! │ Connector /   │ ◄───────────────► │ room broadcast topic  │
//! │ Transport     │                   │ (all peers subscribe) │
//! └──────┬────────┘                   └───────────────────────┘
//!        │ dispatch by message type
//!        ├── crdt ──────► tandem_crdt::CrdtDocument
//!        ├── presence ──► PresenceTracker (roster)
//!        ├── cursor / selection ──► PresenceTracker (overlays)
//!        └── system ────► lifecycle (rejoin / teardown)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope + opaque operation batches
//! - [`directory`] — room provisioning façade (create/join/leave/bootstrap)
//! - [`transport`] — pub/sub channel abstraction (WebSocket + in-memory)
//! - [`presence`] — roster, cursors, selections, staleness
//! - [`debounce`] — trailing-edge coalescing for local cursor sends
//! - [`session`] — lifecycle state machine owning all of the above

pub mod debounce;
pub mod directory;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

pub use debounce::Debouncer;
pub use directory::{Bootstrap, DirectoryError, HttpRoomDirectory, RoomDirectory, RoomInfo};
pub use presence::{
    CursorPosition, PresenceStatus, PresenceTracker, PresenceUser, SelectionRange, UserColor,
};
pub use protocol::{
    decode_op_batch, encode_op_batch, CloseReason, CollaborationMessage, ProtocolError,
    SystemAction,
};
pub use session::{
    LocalIdentity, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionState,
    StructuralBatch,
};
pub use transport::{
    ChannelConnector, ChannelEndpoint, Connector, InboundRx, Transport, TransportError,
    WsConnector,
};
