//! Presence roster and cursor/selection overlays.
//!
//! The tracker is purely reactive: it folds presence, cursor, and
//! selection messages into last-write-wins maps and never runs timers.
//! Staleness is inferred at read time by comparing each entry's `at`
//! stamp against "now", so arbitrary message reordering on the channel
//! cannot corrupt the roster — the newest stamp simply wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tandem_crdt::BlockId;

/// How many explicit leavers the "recently left" history keeps.
const LEFT_HISTORY_CAP: usize = 32;

/// Presence lifecycle states carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Join,
    Leave,
    Heartbeat,
}

/// One user's latest presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub status: PresenceStatus,
    /// Sender wall-clock stamp, milliseconds since the epoch.
    pub at: u64,
}

impl PresenceUser {
    /// Whether this record counts toward the active roster, before the
    /// read-time staleness check.
    pub fn is_active(&self) -> bool {
        matches!(self.status, PresenceStatus::Join | PresenceStatus::Heartbeat)
    }
}

/// A collaborator's caret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub block_id: BlockId,
    pub offset: usize,
}

/// A collaborator's selected range within one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub block_id: BlockId,
    pub from: usize,
    pub to: usize,
}

/// RGBA color for rendering a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl UserColor {
    /// Stable, visually distinct color derived from a user id.
    ///
    /// High-saturation HSL with the hue taken from the id hash, so the
    /// same user renders the same color on every peer.
    pub fn from_user_id(user_id: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let hue = ((hasher.finish() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Live collaborator roster plus cursor/selection overlays for one room.
///
/// Owned exclusively by the session; cleared wholesale on session stop.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user_id: String,
    /// Entries older than this (vs. read-time "now") drop out of the
    /// active set. Derived from the heartbeat interval.
    staleness: Duration,
    roster: HashMap<String, PresenceUser>,
    recently_left: Vec<PresenceUser>,
    cursors: HashMap<String, CursorPosition>,
    cursor_stamps: HashMap<String, u64>,
    selections: HashMap<String, SelectionRange>,
    selection_stamps: HashMap<String, u64>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>, staleness: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            staleness,
            roster: HashMap::new(),
            recently_left: Vec::new(),
            cursors: HashMap::new(),
            cursor_stamps: HashMap::new(),
            selections: HashMap::new(),
            selection_stamps: HashMap::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Warm the roster from a bootstrap payload.
    pub fn seed(&mut self, users: Vec<PresenceUser>) {
        for user in users {
            self.handle_presence(user);
        }
    }

    /// Fold one presence message in. Returns `true` when the roster
    /// visibly changed.
    ///
    /// Last write wins per user, keyed on the sender stamp rather than
    /// arrival order. An explicit `leave` removes the user immediately
    /// (no staleness grace) and files them in the recently-left
    /// history.
    pub fn handle_presence(&mut self, user: PresenceUser) -> bool {
        if let Some(existing) = self.roster.get(&user.user_id) {
            if existing.at > user.at {
                return false;
            }
        }
        if user.status == PresenceStatus::Leave {
            let was_present = self.roster.remove(&user.user_id).is_some();
            self.cursors.remove(&user.user_id);
            self.cursor_stamps.remove(&user.user_id);
            self.selections.remove(&user.user_id);
            self.selection_stamps.remove(&user.user_id);
            self.recently_left.push(user);
            if self.recently_left.len() > LEFT_HISTORY_CAP {
                self.recently_left.remove(0);
            }
            return was_present;
        }
        self.roster.insert(user.user_id.clone(), user);
        true
    }

    /// Fold one cursor message in; the local user's own echo is ignored.
    pub fn handle_cursor(&mut self, user_id: &str, position: CursorPosition, at: u64) {
        if user_id == self.local_user_id {
            return;
        }
        if self.cursor_stamps.get(user_id).is_some_and(|&prev| prev > at) {
            return;
        }
        self.cursor_stamps.insert(user_id.to_string(), at);
        self.cursors.insert(user_id.to_string(), position);
    }

    /// Fold one selection message in; self-echo is ignored.
    pub fn handle_selection(&mut self, user_id: &str, range: SelectionRange, at: u64) {
        if user_id == self.local_user_id {
            return;
        }
        if self
            .selection_stamps
            .get(user_id)
            .is_some_and(|&prev| prev > at)
        {
            return;
        }
        self.selection_stamps.insert(user_id.to_string(), at);
        self.selections.insert(user_id.to_string(), range);
    }

    /// Users whose latest status is `join`/`heartbeat` and whose stamp
    /// is within the staleness window of `now_ms`.
    pub fn active_users(&self, now_ms: u64) -> Vec<&PresenceUser> {
        let window = self.staleness.as_millis() as u64;
        let mut users: Vec<&PresenceUser> = self
            .roster
            .values()
            .filter(|u| u.is_active() && now_ms.saturating_sub(u.at) <= window)
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn active_count(&self, now_ms: u64) -> usize {
        self.active_users(now_ms).len()
    }

    /// Users who explicitly left, oldest first.
    pub fn recently_left(&self) -> &[PresenceUser] {
        &self.recently_left
    }

    pub fn cursors(&self) -> &HashMap<String, CursorPosition> {
        &self.cursors
    }

    pub fn selections(&self) -> &HashMap<String, SelectionRange> {
        &self.selections
    }

    pub fn cursor_of(&self, user_id: &str) -> Option<&CursorPosition> {
        self.cursors.get(user_id)
    }

    /// Rendering color for a roster member.
    pub fn color_of(&self, user_id: &str) -> UserColor {
        UserColor::from_user_id(user_id)
    }

    /// Drop everything. Called on session stop.
    pub fn clear(&mut self) {
        self.roster.clear();
        self.recently_left.clear();
        self.cursors.clear();
        self.cursor_stamps.clear();
        self.selections.clear();
        self.selection_stamps.clear();
    }
}
