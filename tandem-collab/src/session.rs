//! Session lifecycle for one collaboration room.
//!
//! A [`SessionHandle`] owns everything one client needs for one live
//! room: the CRDT replica, the presence tracker, the transport
//! connection, the heartbeat timer, and the inbound dispatcher. The
//! lifecycle is explicit — `start_collaboration`/`join_room` to come
//! up, `stop_collaboration` to tear down — with no hidden globals.
//!
//! ## State machine
//!
//! ```text
//! idle ──► requesting_room ──► connecting ──► connected
//!                ▲                  │             │
//!                │   version_conflict /           │ stop_collaboration
//!                │   room_closed(expired)         ▼
//!                └──────────────────┘        disconnected
//!                                   connect/provision failure ──► error
//! ```
//!
//! Inbound messages are drained by a single dispatcher task per
//! connection and routed by kind to the engine or the presence
//! tracker. Every spawned task is guarded by a disposed flag and a
//! connection epoch, so nothing fires after teardown resolves.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use tandem_crdt::{
    BlockId, ClientId, CrdtDocument, DocumentContent, EngineError, Operation, OpId,
};

use crate::debounce::Debouncer;
use crate::directory::{Bootstrap, DirectoryError, RoomDirectory, RoomInfo};
use crate::presence::{
    CursorPosition, PresenceStatus, PresenceTracker, PresenceUser, SelectionRange,
};
use crate::protocol::{
    decode_op_batch, CloseReason, CollaborationMessage, ProtocolError, SystemAction,
};
use crate::transport::{Connector, InboundRx, Transport, TransportError};

/// Milliseconds since the epoch; stamps presence and cursor messages.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed presence heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Quiet window for coalescing local cursor/selection sends.
    pub debounce_delay: Duration,
    /// Staleness window = heartbeat interval × this factor.
    pub staleness_factor: u32,
    /// Capacity of the event channel surfaced to the caller.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            debounce_delay: Duration::from_millis(50),
            staleness_factor: 2,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// How old a presence stamp may be before the user drops out of
    /// the active set.
    pub fn staleness_window(&self) -> Duration {
        self.heartbeat_interval * self.staleness_factor
    }
}

/// Who the local user is, as announced to peers.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestingRoom,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Events surfaced to the caller.
///
/// [`SessionEvent::SessionError`] is the actionable category — the
/// user must decide to retry. Everything else is passive awareness.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { room_id: String },
    /// Recovered from a version conflict or expired room by rejoining
    /// with fresh credentials.
    Rejoined { room_id: String },
    Disconnected,
    /// Transport or provisioning failure; not auto-retried.
    SessionError { message: String },
    /// The server closed the room.
    RoomClosed { reason: CloseReason },
    /// The active roster changed.
    PresenceChanged,
    /// Remote CRDT operations were applied to the document.
    RemoteOperations { count: usize },
    /// An opaque structural batch arrived.
    StructuralOperations { count: usize },
}

impl SessionEvent {
    /// Whether this event needs a user decision rather than passive
    /// awareness.
    pub fn requires_action(&self) -> bool {
        matches!(self, SessionEvent::SessionError { .. })
    }
}

/// An opaque structural operation batch, buffered for consumers.
#[derive(Debug, Clone)]
pub struct StructuralBatch {
    pub user_id: String,
    pub ops: Vec<serde_json::Value>,
    pub base_version: u64,
    pub op_id: String,
}

/// Session-level failures.
#[derive(Debug)]
pub enum SessionError {
    /// A session is already running; stop it first.
    AlreadyActive,
    /// No session is running.
    NotActive,
    Directory(DirectoryError),
    Transport(TransportError),
    Engine(EngineError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a collaboration session is already active"),
            Self::NotActive => write!(f, "no active collaboration session"),
            Self::Directory(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Engine(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DirectoryError> for SessionError {
    fn from(e: DirectoryError) -> Self {
        Self::Directory(e)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// How the session was bound to its room, kept for rejoin.
#[derive(Debug, Clone)]
enum Binding {
    Created {
        document_id: String,
        context_id: String,
    },
    Joined {
        room_id: String,
        document_id: String,
    },
}

impl Binding {
    fn document_id(&self) -> &str {
        match self {
            Binding::Created { document_id, .. } | Binding::Joined { document_id, .. } => {
                document_id
            }
        }
    }
}

/// What the inbound dispatcher should do after one message.
enum Flow {
    Continue,
    Stop,
    Rejoin,
}

struct DebouncerSet {
    cursor: Debouncer<CollaborationMessage>,
    selection: Debouncer<CollaborationMessage>,
}

impl DebouncerSet {
    fn abort(self) {
        self.cursor.abort();
        self.selection.abort();
    }
}

struct SessionInner {
    identity: LocalIdentity,
    config: SessionConfig,
    directory: Arc<dyn RoomDirectory>,
    connector: Arc<dyn Connector>,
    event_tx: mpsc::Sender<SessionEvent>,

    state: RwLock<SessionState>,
    /// Set by `stop_collaboration`; checked by every async callback
    /// before touching shared state.
    disposed: AtomicBool,
    /// Bumped on every connect, rejoin, and teardown. Tasks from older
    /// connections see the mismatch and exit.
    epoch: AtomicU64,
    binding: RwLock<Option<Binding>>,
    room: RwLock<Option<RoomInfo>>,
    engine: Mutex<Option<CrdtDocument>>,
    presence: Mutex<PresenceTracker>,
    pending_remote: Mutex<Vec<Operation>>,
    pending_structural: Mutex<Vec<StructuralBatch>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    debouncers: Mutex<Option<DebouncerSet>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One client's collaboration session.
pub struct SessionHandle {
    inner: Arc<SessionInner>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl SessionHandle {
    pub fn new(
        identity: LocalIdentity,
        config: SessionConfig,
        directory: Arc<dyn RoomDirectory>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let presence = PresenceTracker::new(identity.user_id.clone(), config.staleness_window());
        let inner = Arc::new(SessionInner {
            identity,
            config,
            directory,
            connector,
            event_tx,
            state: RwLock::new(SessionState::Idle),
            disposed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            binding: RwLock::new(None),
            room: RwLock::new(None),
            engine: Mutex::new(None),
            presence: Mutex::new(presence),
            pending_remote: Mutex::new(Vec::new()),
            pending_structural: Mutex::new(Vec::new()),
            transport: Mutex::new(None),
            debouncers: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        Self {
            inner,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver. Can only be taken once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Create a room for `document_id`/`context_id` and connect to it.
    pub async fn start_collaboration(
        &self,
        document_id: &str,
        context_id: &str,
    ) -> Result<(), SessionError> {
        self.inner.ensure_inactive().await?;
        self.inner.disposed.store(false, Ordering::SeqCst);
        *self.inner.binding.write().await = Some(Binding::Created {
            document_id: document_id.to_string(),
            context_id: context_id.to_string(),
        });
        self.inner.set_state(SessionState::RequestingRoom).await;

        let bootstrap = match self.inner.directory.get_bootstrap(document_id).await {
            Ok(b) => b,
            Err(e) => return Err(self.inner.fail_provisioning(e).await),
        };
        let room = match self
            .inner
            .directory
            .create_room(document_id, context_id)
            .await
        {
            Ok(r) => r,
            Err(e) => return Err(self.inner.fail_provisioning(e).await),
        };
        self.inner.clone().establish(room, bootstrap, true).await
    }

    /// Join an existing room by id.
    pub async fn join_room(&self, room_id: &str, document_id: &str) -> Result<(), SessionError> {
        self.inner.ensure_inactive().await?;
        self.inner.disposed.store(false, Ordering::SeqCst);
        *self.inner.binding.write().await = Some(Binding::Joined {
            room_id: room_id.to_string(),
            document_id: document_id.to_string(),
        });
        self.inner.set_state(SessionState::RequestingRoom).await;

        let bootstrap = match self.inner.directory.get_bootstrap(document_id).await {
            Ok(b) => b,
            Err(e) => return Err(self.inner.fail_provisioning(e).await),
        };
        let room = match self.inner.directory.join_room(room_id).await {
            Ok(r) => r,
            Err(e) => return Err(self.inner.fail_provisioning(e).await),
        };
        self.inner.clone().establish(room, bootstrap, true).await
    }

    /// Hard teardown: unsubscribe, stop the heartbeat, notify the
    /// directory, clear all in-memory session state. After this
    /// resolves, no callback from the old connection can fire.
    pub async fn stop_collaboration(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        {
            let state = *inner.state.read().await;
            if state == SessionState::Idle {
                return Err(SessionError::NotActive);
            }
        }
        inner.disposed.store(true, Ordering::SeqCst);
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        // Kill timers and the dispatcher before anything else so no
        // callback can interleave with the teardown below.
        for task in inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(set) = inner.debouncers.lock().await.take() {
            set.abort();
        }

        // Best-effort leave so peers learn immediately instead of via
        // staleness.
        if let Some(transport) = inner.transport.lock().await.take() {
            let leave =
                CollaborationMessage::presence(inner.local_presence(PresenceStatus::Leave));
            if let Ok(frame) = leave.encode() {
                let _ = transport.send(frame).await;
            }
            transport.close().await;
        }

        let room = inner.room.write().await.take();
        if let Some(room) = room {
            if let Err(e) = inner.directory.leave_room(&room.room_id).await {
                log::warn!("leave_room for {} failed: {e}", room.room_id);
            }
        }

        *inner.engine.lock().await = None;
        inner.presence.lock().await.clear();
        inner.pending_remote.lock().await.clear();
        inner.pending_structural.lock().await.clear();
        *inner.binding.write().await = None;

        inner.set_state(SessionState::Disconnected).await;
        inner.emit(SessionEvent::Disconnected);
        Ok(())
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Insert text into a block and publish the operation.
    pub async fn insert(
        &self,
        block: &BlockId,
        position: usize,
        content: &str,
    ) -> Result<Operation, SessionError> {
        let (op, clock) = {
            let mut guard = self.inner.engine.lock().await;
            let engine = guard.as_mut().ok_or(SessionError::NotActive)?;
            let op = engine.insert(block, position, content)?;
            (op, engine.clock())
        };
        self.inner
            .publish_ops(std::slice::from_ref(&op), clock)
            .await;
        Ok(op)
    }

    /// Delete a visible range from a block and publish the operation.
    pub async fn delete(
        &self,
        block: &BlockId,
        position: usize,
        length: usize,
    ) -> Result<Operation, SessionError> {
        let (op, clock) = {
            let mut guard = self.inner.engine.lock().await;
            let engine = guard.as_mut().ok_or(SessionError::NotActive)?;
            let op = engine.delete(block, position, length)?;
            (op, engine.clock())
        };
        self.inner
            .publish_ops(std::slice::from_ref(&op), clock)
            .await;
        Ok(op)
    }

    /// Replace a block's whole content and publish the operation.
    pub async fn update(&self, block: &BlockId, content: &str) -> Result<Operation, SessionError> {
        let (op, clock) = {
            let mut guard = self.inner.engine.lock().await;
            let engine = guard.as_mut().ok_or(SessionError::NotActive)?;
            let op = engine.update(block, content)?;
            (op, engine.clock())
        };
        self.inner
            .publish_ops(std::slice::from_ref(&op), clock)
            .await;
        Ok(op)
    }

    /// Publish an opaque structural batch. Returns the generated batch
    /// id. A no-op (beyond id generation) while not connected.
    pub async fn send_structural(
        &self,
        ops: Vec<serde_json::Value>,
        base_version: u64,
    ) -> Result<String, SessionError> {
        let op_id = uuid::Uuid::new_v4().to_string();
        let msg = CollaborationMessage::Op {
            user_id: self.inner.identity.user_id.clone(),
            ops,
            base_version,
            op_id: op_id.clone(),
        };
        self.inner.send(msg).await;
        Ok(op_id)
    }

    // ── Ephemeral state ──────────────────────────────────────────

    /// Announce the local caret. Debounced; bursts coalesce into the
    /// newest position.
    pub async fn update_cursor(&self, position: CursorPosition) {
        let msg = CollaborationMessage::cursor(
            self.inner.identity.user_id.clone(),
            position,
            epoch_millis(),
        );
        if let Some(set) = self.inner.debouncers.lock().await.as_ref() {
            set.cursor.offer(msg);
        }
    }

    /// Announce the local selection. Debounced like cursor moves.
    pub async fn update_selection(&self, range: SelectionRange) {
        let msg = CollaborationMessage::selection(
            self.inner.identity.user_id.clone(),
            range,
            epoch_millis(),
        );
        if let Some(set) = self.inner.debouncers.lock().await.as_ref() {
            set.selection.offer(msg);
        }
    }

    // ── Reads for the document view ──────────────────────────────

    pub async fn content(&self) -> Result<DocumentContent, SessionError> {
        let guard = self.inner.engine.lock().await;
        guard
            .as_ref()
            .map(|e| e.content())
            .ok_or(SessionError::NotActive)
    }

    pub async fn block_content(&self, block: &BlockId) -> Option<String> {
        let guard = self.inner.engine.lock().await;
        guard.as_ref().and_then(|e| e.block_content(block))
    }

    /// Roster members currently active (status and staleness checked
    /// against "now").
    pub async fn active_collaborators(&self) -> Vec<PresenceUser> {
        let now = epoch_millis();
        let presence = self.inner.presence.lock().await;
        presence.active_users(now).into_iter().cloned().collect()
    }

    pub async fn cursors(&self) -> std::collections::HashMap<String, CursorPosition> {
        self.inner.presence.lock().await.cursors().clone()
    }

    pub async fn selections(&self) -> std::collections::HashMap<String, SelectionRange> {
        self.inner.presence.lock().await.selections().clone()
    }

    /// Drain remote CRDT operations applied since the last call.
    pub async fn take_remote_operations(&self) -> Vec<Operation> {
        std::mem::take(&mut *self.inner.pending_remote.lock().await)
    }

    /// Drain buffered structural batches.
    pub async fn take_structural_batches(&self) -> Vec<StructuralBatch> {
        std::mem::take(&mut *self.inner.pending_structural.lock().await)
    }

    pub async fn room(&self) -> Option<RoomInfo> {
        self.inner.room.read().await.clone()
    }
}

impl SessionInner {
    async fn ensure_inactive(&self) -> Result<(), SessionError> {
        match *self.state.read().await {
            SessionState::Idle | SessionState::Disconnected | SessionState::Error => Ok(()),
            _ => Err(SessionError::AlreadyActive),
        }
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::debug!("event channel full or closed; event dropped");
        }
    }

    fn local_presence(&self, status: PresenceStatus) -> PresenceUser {
        PresenceUser {
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
            avatar_url: self.identity.avatar_url.clone(),
            status,
            at: epoch_millis(),
        }
    }

    async fn fail_provisioning(&self, error: DirectoryError) -> SessionError {
        self.set_state(SessionState::Error).await;
        self.emit(SessionEvent::SessionError {
            message: error.to_string(),
        });
        SessionError::Directory(error)
    }

    /// Open the transport and wire the whole session onto it.
    ///
    /// With `fresh` the engine is rebuilt from the bootstrap snapshot;
    /// on a rejoin the existing replica is kept, the snapshot merges
    /// in idempotently, and local operations the server never saw are
    /// replayed onto the new channel.
    async fn establish(
        self: Arc<Self>,
        room: RoomInfo,
        bootstrap: Bootstrap,
        fresh: bool,
    ) -> Result<(), SessionError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SessionError::NotActive);
        }
        self.set_state(SessionState::Connecting).await;

        let (transport, inbound) = match self
            .connector
            .connect(&room, &self.identity.user_id)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.set_state(SessionState::Error).await;
                self.emit(SessionEvent::SessionError {
                    message: e.to_string(),
                });
                return Err(SessionError::Transport(e));
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Adopt or merge the bootstrap state; collect the rejoin
        // replay set (local ops absent from the server's log).
        let mut replay: Vec<Operation> = Vec::new();
        let mut replay_clock = 0;
        {
            let mut guard = self.engine.lock().await;
            let keep_replica = !fresh && guard.is_some();
            if keep_replica {
                if let Some(engine) = guard.as_mut() {
                    for op in &bootstrap.snapshot.operations {
                        engine.apply_operation(op);
                    }
                    let known: HashSet<OpId> = bootstrap
                        .snapshot
                        .operations
                        .iter()
                        .map(|op| op.id.clone())
                        .collect();
                    let local = engine.client().clone();
                    replay = engine
                        .operations_since(0)
                        .into_iter()
                        .filter(|op| op.client() == &local && !known.contains(&op.id))
                        .collect();
                    replay_clock = engine.clock();
                }
            } else {
                *guard = Some(CrdtDocument::from_snapshot(
                    ClientId::generate(),
                    &bootstrap.snapshot,
                ));
            }
        }

        *self.transport.lock().await = Some(transport);
        *self.room.write().await = Some(room.clone());

        {
            let mut presence = self.presence.lock().await;
            presence.clear();
            presence.seed(bootstrap.presence);
            presence.handle_presence(self.local_presence(PresenceStatus::Join));
        }

        // Debounced cursor/selection pipeline: two coalescers feeding
        // epoch-guarded pump tasks.
        let (cursor_tx, cursor_rx) = mpsc::channel(64);
        let (selection_tx, selection_rx) = mpsc::channel(64);
        let set = DebouncerSet {
            cursor: Debouncer::new(self.config.debounce_delay, cursor_tx),
            selection: Debouncer::new(self.config.debounce_delay, selection_tx),
        };
        if let Some(old) = self.debouncers.lock().await.replace(set) {
            old.abort();
        }

        {
            let mut tasks = self.tasks.lock().await;
            tasks.retain(|t| !t.is_finished());
            tasks.push(self.clone().spawn_dispatcher(inbound, epoch));
            tasks.push(self.clone().spawn_heartbeat(epoch));
            tasks.push(self.clone().spawn_pump(cursor_rx, epoch));
            tasks.push(self.clone().spawn_pump(selection_rx, epoch));
        }

        self.set_state(SessionState::Connected).await;

        // Announce ourselves before anything else goes out.
        self.send(CollaborationMessage::presence(
            self.local_presence(PresenceStatus::Join),
        ))
        .await;

        if !replay.is_empty() {
            log::info!(
                "replaying {} unacknowledged local operation(s) after rejoin",
                replay.len()
            );
            self.publish_ops(&replay, replay_clock).await;
        }

        let room_id = room.room_id;
        if fresh {
            self.emit(SessionEvent::Connected { room_id });
        } else {
            self.emit(SessionEvent::Rejoined { room_id });
        }
        Ok(())
    }

    /// Publish a CRDT batch; a no-op while not connected.
    async fn publish_ops(&self, ops: &[Operation], clock: u64) {
        if ops.is_empty() {
            return;
        }
        match CollaborationMessage::crdt(self.identity.user_id.clone(), ops, clock) {
            Ok(msg) => self.send(msg).await,
            Err(e) => log::warn!("failed to encode operation batch: {e}"),
        }
    }

    /// Send one frame; a no-op unless connected. Send failures are
    /// logged, never fatal — the rejoin replay path recovers content.
    async fn send(&self, msg: CollaborationMessage) {
        if *self.state.read().await != SessionState::Connected {
            return;
        }
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                log::warn!("failed to encode outbound frame: {e}");
                return;
            }
        };
        let guard = self.transport.lock().await;
        if let Some(transport) = guard.as_ref() {
            if let Err(e) = transport.send(frame).await {
                log::warn!("outbound send failed: {e}");
            }
        }
    }

    fn spawn_dispatcher(self: Arc<Self>, mut inbound: InboundRx, epoch: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if self.disposed.load(Ordering::SeqCst)
                    || self.epoch.load(Ordering::SeqCst) != epoch
                {
                    return;
                }
                match self.dispatch(&frame).await {
                    Flow::Continue => {}
                    Flow::Stop => return,
                    Flow::Rejoin => {
                        self.clone().rejoin().await;
                        return;
                    }
                }
            }
            // Inbound stream ended without a teardown: the socket died.
            if !self.disposed.load(Ordering::SeqCst)
                && self.epoch.load(Ordering::SeqCst) == epoch
            {
                self.set_state(SessionState::Error).await;
                self.emit(SessionEvent::SessionError {
                    message: "transport closed unexpectedly".into(),
                });
            }
        })
    }

    fn spawn_heartbeat(self: Arc<Self>, epoch: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            // The join announcement covered the first beat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if self.disposed.load(Ordering::SeqCst)
                    || self.epoch.load(Ordering::SeqCst) != epoch
                {
                    return;
                }
                let beat = self.local_presence(PresenceStatus::Heartbeat);
                self.presence.lock().await.handle_presence(beat.clone());
                // Fire-and-forget: a missed beat is detected by peers
                // through staleness, not by the sender.
                self.send(CollaborationMessage::presence(beat)).await;
            }
        })
    }

    fn spawn_pump(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<CollaborationMessage>,
        epoch: u64,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if self.disposed.load(Ordering::SeqCst)
                    || self.epoch.load(Ordering::SeqCst) != epoch
                {
                    return;
                }
                self.send(msg).await;
            }
        })
    }

    /// Route one inbound frame. Malformed frames are logged and
    /// dropped; they never kill the session loop.
    async fn dispatch(&self, frame: &str) -> Flow {
        let msg = match CollaborationMessage::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("dropping malformed inbound message: {e}");
                return Flow::Continue;
            }
        };

        // No self-echo: the engine would reject our own ops anyway,
        // but presence and cursors must not loop back either.
        if msg.sender() == Some(self.identity.user_id.as_str())
            && !matches!(msg, CollaborationMessage::Presence { .. })
        {
            return Flow::Continue;
        }

        match msg {
            CollaborationMessage::Presence { user } => {
                let changed = self.presence.lock().await.handle_presence(user);
                if changed {
                    self.emit(SessionEvent::PresenceChanged);
                }
            }
            CollaborationMessage::Cursor {
                user_id,
                position,
                at,
            } => {
                self.presence
                    .lock()
                    .await
                    .handle_cursor(&user_id, position, at);
            }
            CollaborationMessage::Selection { user_id, range, at } => {
                self.presence
                    .lock()
                    .await
                    .handle_selection(&user_id, range, at);
            }
            CollaborationMessage::Crdt { payload, .. } => {
                let ops = match decode_op_batch(&payload) {
                    Ok(ops) => ops,
                    Err(e) => {
                        log::warn!("dropping undecodable operation batch: {e}");
                        return Flow::Continue;
                    }
                };
                let mut applied = Vec::new();
                {
                    let mut guard = self.engine.lock().await;
                    if let Some(engine) = guard.as_mut() {
                        for op in ops {
                            if engine.apply_operation(&op) {
                                applied.push(op);
                            }
                        }
                    }
                }
                if !applied.is_empty() {
                    let count = applied.len();
                    self.pending_remote.lock().await.extend(applied);
                    self.emit(SessionEvent::RemoteOperations { count });
                }
            }
            CollaborationMessage::Op {
                user_id,
                ops,
                base_version,
                op_id,
            } => {
                let count = ops.len();
                self.pending_structural.lock().await.push(StructuralBatch {
                    user_id,
                    ops,
                    base_version,
                    op_id,
                });
                self.emit(SessionEvent::StructuralOperations { count });
            }
            CollaborationMessage::System { action, reason } => {
                return self.handle_system(action, reason).await;
            }
        }
        Flow::Continue
    }

    async fn handle_system(&self, action: SystemAction, reason: Option<CloseReason>) -> Flow {
        match action {
            SystemAction::VersionConflict => {
                log::info!("server signaled a version conflict; rejoining from scratch");
                Flow::Rejoin
            }
            SystemAction::RoomClosed => {
                let reason = reason.unwrap_or(CloseReason::AdminClosed);
                self.emit(SessionEvent::RoomClosed { reason });
                match reason {
                    // The token lifetime ended; the same document is
                    // still live, so recover with fresh credentials.
                    CloseReason::Expired => Flow::Rejoin,
                    // Terminal: tear everything down.
                    CloseReason::AdminClosed => {
                        self.teardown_after_close().await;
                        Flow::Stop
                    }
                }
            }
        }
    }

    /// Teardown triggered from inside the dispatcher when the server
    /// closed the room — the channel is gone, so no leave is sent and
    /// the directory is not notified.
    async fn teardown_after_close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
        if let Some(set) = self.debouncers.lock().await.take() {
            set.abort();
        }
        *self.engine.lock().await = None;
        self.presence.lock().await.clear();
        self.pending_remote.lock().await.clear();
        self.pending_structural.lock().await.clear();
        *self.room.write().await = None;
        self.set_state(SessionState::Disconnected).await;
        self.emit(SessionEvent::Disconnected);
    }

    /// Rejoin from scratch after a version conflict or room expiry:
    /// fresh bootstrap, fresh RoomInfo, fresh subscription. The old
    /// channel is no longer trustworthy and is discarded first.
    async fn rejoin(self: Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::RequestingRoom).await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close().await;
        }

        let binding = match self.binding.read().await.clone() {
            Some(b) => b,
            None => {
                self.set_state(SessionState::Error).await;
                self.emit(SessionEvent::SessionError {
                    message: "no room binding to rejoin".into(),
                });
                return;
            }
        };

        let bootstrap = match self.directory.get_bootstrap(binding.document_id()).await {
            Ok(b) => b,
            Err(e) => {
                self.fail_provisioning(e).await;
                return;
            }
        };
        let room = match &binding {
            Binding::Created {
                document_id,
                context_id,
            } => self.directory.create_room(document_id, context_id).await,
            Binding::Joined { room_id, .. } => self.directory.join_room(room_id).await,
        };
        let room = match room {
            Ok(r) => r,
            Err(e) => {
                self.fail_provisioning(e).await;
                return;
            }
        };

        if let Err(e) = self.clone().establish(room, bootstrap, false).await {
            log::warn!("rejoin failed: {e}");
        }
    }
}
