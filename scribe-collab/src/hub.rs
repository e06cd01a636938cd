//! The authoritative document and presence registry.
//!
//! ```text
//! socket task ─┐                      ┌── BroadcastGroup ──► socket tasks
//! socket task ─┼─► mpsc ─► Hub::run ──┤
//! socket task ─┘   (HubCommand)       └── Document + presence registry
//! ```
//!
//! One task owns the [`Hub`] and handles commands one at a time, so reading
//! the document, mutating it, broadcasting and replying happen as a unit
//! with no locks. Every other task talks to it through a [`HubHandle`].

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use scribe_core::{apply, Document, Operation};

use crate::auth::Identity;
use crate::broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame};
use crate::error::{Result, SyncError};
use crate::presence::{now_millis, Presence, SessionId};
use crate::protocol::{Ack, Envelope, Heartbeat, Message, PresenceRemove};

/// What the hub does with an operation whose `baseVersion` is behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Apply in arrival order regardless of `baseVersion`.
    #[default]
    ArrivalOrder,
    /// Reject operations that declare a `baseVersion` other than the current one.
    RejectStale,
}

impl FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" | "arrival-order" => Ok(ConflictPolicy::ArrivalOrder),
            "reject-stale" | "reject" => Ok(ConflictPolicy::RejectStale),
            other => Err(SyncError::Config(format!(
                "unknown conflict policy {other:?} (expected arrival or reject-stale)"
            ))),
        }
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub ops_accepted: u64,
    pub ops_rejected: u64,
    pub malformed_messages: u64,
    pub presence_entries: usize,
    pub broadcast: BroadcastStats,
}

pub struct Hub {
    document: Document,
    policy: ConflictPolicy,
    connections: BroadcastGroup,
    presence: HashMap<SessionId, Presence>,
    /// Sessions each connection is responsible for cleaning up.
    owned: HashMap<ConnectionId, HashSet<SessionId>>,
    stats: HubStats,
}

impl Hub {
    pub fn new(document: Document, policy: ConflictPolicy) -> Self {
        Self {
            document,
            policy,
            connections: BroadcastGroup::new(),
            presence: HashMap::new(),
            owned: HashMap::new(),
            stats: HubStats::default(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Registry entries, ordered by session id.
    pub fn presence(&self) -> Vec<Presence> {
        let mut entries: Vec<Presence> = self.presence.values().cloned().collect();
        entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        entries
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_connections: self.connections.peer_count(),
            presence_entries: self.presence.len(),
            broadcast: self.connections.stats(),
            ..self.stats.clone()
        }
    }

    /// Attach an authenticated connection.
    pub fn connect(&mut self, id: ConnectionId, identity: Identity, sender: UnboundedSender<Frame>) {
        log::info!("{} ({}) connected as {id}", identity.name, identity.user_id);
        self.connections.add_peer(id, identity, sender);
        self.stats.total_connections += 1;
    }

    /// Decode and handle one text frame from `id`.
    pub fn handle_text(&mut self, id: ConnectionId, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.handle(id, envelope),
            Err(e) => {
                log::warn!("malformed message from {id}: {e}");
                self.stats.malformed_messages += 1;
                self.reply(&id, None, Message::error(format!("Malformed message: {e}")));
            }
        }
    }

    pub fn handle(&mut self, id: ConnectionId, envelope: Envelope) {
        let Some(identity) = self.connections.identity(&id).cloned() else {
            log::warn!("dropping {} from unknown connection {id}", envelope.message_type());
            return;
        };
        let Envelope {
            message,
            request_id,
        } = envelope;
        log::debug!("{} from {}", message.message_type(), identity.user_id);

        match message {
            Message::Hello(hello) => {
                log::info!(
                    "{} joined {} (last known version {})",
                    identity.user_id,
                    hello.doc_id,
                    hello.last_known_version
                );
                self.reply(&id, request_id, Message::Snapshot(self.document.clone()));
            }
            Message::RequestSnapshot => {
                self.reply(&id, request_id, Message::Snapshot(self.document.clone()));
            }
            Message::Op(op) => match self.accept_operation(&identity, op) {
                Ok(op) => {
                    let ack = Ack {
                        op_id: Some(op.op_id.clone()),
                        version: Some(self.document.version),
                        session_ids: Vec::new(),
                    };
                    self.broadcast(Some(&id), Message::Op(op));
                    self.reply(&id, request_id, Message::Ack(ack));
                }
                Err(e) => {
                    log::warn!("rejected operation from {}: {e}", identity.user_id);
                    self.stats.ops_rejected += 1;
                    self.reply(&id, request_id, Message::error(e.to_string()));
                }
            },
            Message::Presence(entries) => {
                let session_ids = self.upsert_presence(&id, &identity, entries);
                self.reply(
                    &id,
                    request_id,
                    Message::Ack(Ack {
                        session_ids,
                        ..Ack::default()
                    }),
                );
            }
            Message::PresenceRemove(PresenceRemove { session_id }) => {
                if self.remove_presence(&session_id).is_some() {
                    self.broadcast(Some(&id), Message::remove_presence(session_id.clone()));
                }
                self.reply(
                    &id,
                    request_id,
                    Message::Ack(Ack {
                        session_ids: vec![session_id],
                        ..Ack::default()
                    }),
                );
            }
            Message::Ping(_) => {
                log::trace!("ping from {id}");
                self.reply(&id, request_id, Message::Pong(Heartbeat::now()));
            }
            other @ (Message::Snapshot(_) | Message::Ack(_) | Message::Error(_) | Message::Pong(_)) => {
                log::debug!("ignoring {} sent to the hub by {id}", other.message_type());
            }
        }
    }

    /// Fill identity fields, apply strictly and bump the version.
    fn accept_operation(&mut self, identity: &Identity, mut op: Operation) -> Result<Operation> {
        if op.op_id.is_empty() {
            op.op_id = Uuid::new_v4().to_string();
        }
        if op.doc_id.is_empty() {
            op.doc_id = self.document.id.clone();
        }
        op.user_id = identity.user_id.clone();

        let current = self.document.version;
        if let (ConflictPolicy::RejectStale, Some(base)) = (self.policy, op.base_version) {
            if base != current {
                return Err(SyncError::Conflict { base, current });
            }
        }
        op.base_version.get_or_insert(current);
        op.timestamp.get_or_insert_with(Utc::now);

        self.document.content = apply(&self.document.content, &op)?;
        self.document.version += 1;
        self.stats.ops_accepted += 1;
        log::debug!(
            "applied {} {} from {}, document now at version {}",
            op.kind,
            op.op_id,
            op.user_id,
            self.document.version
        );
        Ok(op)
    }

    /// Upsert presence entries, take ownership of this user's sessions and fan out.
    fn upsert_presence(
        &mut self,
        id: &ConnectionId,
        identity: &Identity,
        entries: Vec<Presence>,
    ) -> Vec<SessionId> {
        let mut filled = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.user_id.is_empty() {
                entry.user_id = identity.user_id.clone();
            }
            if entry.name.is_empty() {
                entry.name = identity.name.clone();
            }
            if entry.session_id.is_empty() {
                entry.session_id = SessionId::generate();
            }
            if entry.last_seen == 0 {
                entry.last_seen = now_millis();
            }
            if entry.user_id == identity.user_id {
                self.take_ownership(id, &entry.session_id);
            }
            self.presence.insert(entry.session_id.clone(), entry.clone());
            filled.push(entry);
        }

        let session_ids = filled.iter().map(|p| p.session_id.clone()).collect();
        self.broadcast(Some(id), Message::Presence(filled));
        session_ids
    }

    /// Claim `session_id` for `id` unless another live connection already owns it.
    ///
    /// Another tab of the same user relays this session's caret after its own
    /// edits; that relay must not move ownership away from the tab itself.
    fn take_ownership(&mut self, id: &ConnectionId, session_id: &SessionId) {
        let owner = self
            .owned
            .iter()
            .find(|(_, sessions)| sessions.contains(session_id))
            .map(|(conn, _)| *conn);
        match owner {
            Some(owner) if owner == *id => return,
            Some(owner) if self.connections.has_peer(&owner) => return,
            Some(owner) => {
                if let Some(sessions) = self.owned.get_mut(&owner) {
                    sessions.remove(session_id);
                }
            }
            None => {}
        }
        self.owned.entry(*id).or_default().insert(session_id.clone());
    }

    fn remove_presence(&mut self, session_id: &SessionId) -> Option<Presence> {
        for sessions in self.owned.values_mut() {
            sessions.remove(session_id);
        }
        self.presence.remove(session_id)
    }

    /// Detach a connection and retract every session it owned.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let identity = self.connections.remove_peer(&id);
        let owned = self.owned.remove(&id).unwrap_or_default();
        for session_id in owned {
            if self.presence.remove(&session_id).is_some() {
                self.broadcast(None, Message::remove_presence(session_id));
            }
        }
        if let Some(identity) = identity {
            log::info!("{} disconnected ({id})", identity.user_id);
        }
    }

    fn reply(&mut self, id: &ConnectionId, request_id: Option<String>, message: Message) {
        if let Some(frame) = encode(Envelope::reply(message, request_id)) {
            if !self.connections.send_to(id, frame) {
                log::debug!("reply to {id} dropped, connection gone");
            }
        }
    }

    fn broadcast(&mut self, exclude: Option<&ConnectionId>, message: Message) {
        if let Some(frame) = encode(Envelope::new(message)) {
            self.connections.broadcast_except(exclude, &frame);
        }
    }

    fn dispatch(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect {
                id,
                identity,
                sender,
            } => self.connect(id, identity, sender),
            HubCommand::Frame { id, text } => self.handle_text(id, &text),
            HubCommand::Disconnect { id } => self.disconnect(id),
            HubCommand::Document(reply) => {
                let _ = reply.send(self.document.clone());
            }
            HubCommand::Presence(reply) => {
                let _ = reply.send(self.presence());
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Drain the mailbox until every handle is dropped.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<HubCommand>) {
        log::info!(
            "hub for {} started at version {} ({:?})",
            self.document.id,
            self.document.version,
            self.policy
        );
        while let Some(command) = mailbox.recv().await {
            self.dispatch(command);
        }
        log::info!("hub for {} stopped", self.document.id);
    }

    /// Spawn the hub on the current runtime.
    pub fn spawn(self, mailbox_capacity: usize) -> (HubHandle, JoinHandle<()>) {
        let (handle, mailbox) = HubHandle::channel(mailbox_capacity);
        (handle, tokio::spawn(self.run(mailbox)))
    }
}

fn encode(envelope: Envelope) -> Option<Frame> {
    match envelope.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("failed to encode {}: {e}", envelope.message_type());
            None
        }
    }
}

/// Work items for the hub task.
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        id: ConnectionId,
        identity: Identity,
        sender: UnboundedSender<Frame>,
    },
    Frame {
        id: ConnectionId,
        text: String,
    },
    Disconnect {
        id: ConnectionId,
    },
    Document(oneshot::Sender<Document>),
    Presence(oneshot::Sender<Vec<Presence>>),
    Stats(oneshot::Sender<HubStats>),
}

/// Cloneable mailbox address of a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// A handle and the mailbox a [`Hub::run`] must drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, command: HubCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| SyncError::HubClosed)
    }

    pub async fn connect(
        &self,
        id: ConnectionId,
        identity: Identity,
        sender: UnboundedSender<Frame>,
    ) -> Result<()> {
        self.send(HubCommand::Connect {
            id,
            identity,
            sender,
        })
        .await
    }

    pub async fn frame(&self, id: ConnectionId, text: String) -> Result<()> {
        self.send(HubCommand::Frame { id, text }).await
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        self.send(HubCommand::Disconnect { id }).await
    }

    /// Current authoritative document.
    pub async fn document(&self) -> Result<Document> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Document(tx)).await?;
        rx.await.map_err(|_| SyncError::HubClosed)
    }

    /// Current presence registry.
    pub async fn presence(&self) -> Result<Vec<Presence>> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Presence(tx)).await?;
        rx.await.map_err(|_| SyncError::HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Stats(tx)).await?;
        rx.await.map_err(|_| SyncError::HubClosed)
    }
}
