//! Presence: who is in the document and where their caret is.
//!
//! ## Flow
//!
//! ```text
//! local edit / caret move
//!       │
//!       ▼
//! PresenceRoom::reconcile() / update_local_cursor()
//!       │   self entry + every peer cursor that moved
//!       ▼
//! PRESENCE [ … ]  ──►  hub registry  ──►  other sessions
//!                                            │
//!                                            ▼
//!                              PresenceRoom::handle_update()
//! ```
//!
//! Entries are keyed by [`SessionId`], not user: one user with two tabs has
//! two independent entries.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scribe_core::{final_cursor, operation_range, transform_cursor, Operation};

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Identifier of one editing session, minted once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One session's caret and highlighted range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: SessionId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cursor: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_end: Option<usize>,
    /// Unix milliseconds of the last update.
    #[serde(default)]
    pub last_seen: i64,
}

impl Presence {
    pub fn new(user_id: impl Into<String>, session_id: SessionId, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            name: name.into(),
            cursor: 0,
            op_start: None,
            op_end: None,
            last_seen: now_millis(),
        }
    }

    pub fn selection(&self) -> Option<Range<usize>> {
        match (self.op_start, self.op_end) {
            (Some(start), Some(end)) => Some(start..end),
            _ => None,
        }
    }

    fn set_selection(&mut self, selection: Option<Range<usize>>) {
        self.op_start = selection.as_ref().map(|r| r.start);
        self.op_end = selection.map(|r| r.end);
    }

    pub fn is_idle(&self, now: i64, timeout: Duration) -> bool {
        let timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.last_seen) > timeout
    }
}

/// Client-side view of every session in the document, including our own.
#[derive(Debug, Clone)]
pub struct PresenceRoom {
    local: Presence,
    peers: HashMap<SessionId, Presence>,
    /// Peers silent for longer than this are dropped by `cleanup_idle_peers`.
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local: Presence) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            idle_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_idle_timeout(local: Presence, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..Self::new(local)
        }
    }

    /// Record a bare caret move or selection change. Returns the entries to send.
    pub fn update_local_cursor(
        &mut self,
        cursor: usize,
        selection: Option<Range<usize>>,
    ) -> Vec<Presence> {
        self.local.cursor = cursor;
        self.local.set_selection(selection);
        self.local.last_seen = now_millis();
        vec![self.local.clone()]
    }

    /// Move every caret through a just-applied local `op`.
    ///
    /// Our own caret jumps to the end of the edit. Peer carets are
    /// transformed; the ones that moved are updated here and returned after
    /// our own entry, ready for one bulk PRESENCE.
    pub fn reconcile(&mut self, op: &Operation) -> Vec<Presence> {
        let now = now_millis();
        self.local.cursor = final_cursor(op);
        self.local.set_selection(Some(operation_range(op)));
        self.local.last_seen = now;

        let mut changed = vec![self.local.clone()];
        for peer in self.peers.values_mut() {
            let moved = transform_cursor(peer.cursor, op);
            if moved != peer.cursor {
                peer.cursor = moved;
                changed.push(peer.clone());
            }
        }
        changed
    }

    /// Merge entries received from the hub.
    ///
    /// An entry for our own session carries a caret another session moved
    /// through its edit; adopt the position and keep everything else.
    pub fn handle_update(&mut self, entries: Vec<Presence>) {
        for entry in entries {
            if entry.session_id == self.local.session_id {
                self.local.cursor = entry.cursor;
                continue;
            }
            self.peers.insert(entry.session_id.clone(), entry);
        }
    }

    pub fn handle_remove(&mut self, session_id: &SessionId) -> Option<Presence> {
        self.peers.remove(session_id)
    }

    /// Drop peers whose `lastSeen` is older than the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<SessionId> {
        self.cleanup_idle_peers_at(now_millis())
    }

    pub fn cleanup_idle_peers_at(&mut self, now: i64) -> Vec<SessionId> {
        let timeout = self.idle_timeout;
        let stale: Vec<SessionId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn local(&self) -> &Presence {
        &self.local
    }

    pub fn session_id(&self) -> &SessionId {
        &self.local.session_id
    }

    pub fn peers(&self) -> &HashMap<SessionId, Presence> {
        &self.peers
    }

    pub fn peer(&self, session_id: &SessionId) -> Option<&Presence> {
        self.peers.get(session_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
