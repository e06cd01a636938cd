//! One user's view of the shared document.
//!
//! [`Replica`] is the synchronous state machine: local content, undo/redo
//! history and presence. Every local action returns the messages to send;
//! every received message is folded in through [`Replica::receive`].
//! [`DocumentSession`] pairs a replica with a [`SyncClient`] so callers only
//! deal with text edits and events.
//!
//! The session id is minted once per replica and carried in every presence
//! entry it produces, including across reconnects.

use std::ops::Range;

use scribe_core::{diff, Document, History, Operation};

use crate::auth::Identity;
use crate::client::{ClientConfig, SyncClient, SyncEvent};
use crate::error::SyncError;
use crate::presence::{Presence, PresenceRoom, SessionId};
use crate::protocol::{Ack, Hello, Message};

/// What a received message changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// A snapshot replaced the document; history was cleared.
    DocumentReplaced,
    RemoteEdit(Operation),
    PresenceChanged,
    Acknowledged(Ack),
    /// The hub refused something we sent. The local edit is not rolled back.
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct Replica {
    identity: Identity,
    document: Document,
    history: History,
    presence: PresenceRoom,
}

impl Replica {
    pub fn new(identity: Identity, doc_id: impl Into<String>) -> Self {
        let local = Presence::new(identity.user_id.clone(), SessionId::generate(), identity.name.clone());
        Self {
            identity,
            document: Document::new(doc_id, ""),
            history: History::new(),
            presence: PresenceRoom::new(local),
        }
    }

    /// Handshake describing this replica.
    pub fn hello(&self) -> Hello {
        Hello {
            user_id: self.identity.user_id.clone(),
            name: self.identity.name.clone(),
            doc_id: self.document.id.clone(),
            last_known_version: self.document.version,
        }
    }

    /// Replace the content with `new_text`, as an editor would after a keystroke.
    pub fn edit(&mut self, new_text: &str) -> Vec<Message> {
        match diff(&self.document.content, new_text) {
            Some(op) => self.apply_local(op),
            None => Vec::new(),
        }
    }

    /// Apply a local operation and produce the presence update and the operation to send.
    pub fn apply_local(&mut self, op: Operation) -> Vec<Message> {
        let op = self.stamp(op);
        let sent = self.history.apply_local(&mut self.document.content, op);
        self.after_local(sent)
    }

    pub fn undo(&mut self) -> Vec<Message> {
        match self.history.undo(&mut self.document.content) {
            Some(inverse) => {
                let inverse = self.stamp(inverse);
                self.after_local(inverse)
            }
            None => Vec::new(),
        }
    }

    pub fn redo(&mut self) -> Vec<Message> {
        match self.history.redo(&mut self.document.content) {
            Some(op) => {
                let op = self.stamp(op);
                self.after_local(op)
            }
            None => Vec::new(),
        }
    }

    pub fn move_cursor(&mut self, cursor: usize, selection: Option<Range<usize>>) -> Vec<Message> {
        vec![Message::Presence(self.presence.update_local_cursor(cursor, selection))]
    }

    /// Retract our presence entry.
    pub fn leave(&self) -> Message {
        Message::remove_presence(self.presence.session_id().clone())
    }

    /// Fresh identity for everything this replica transmits, including undo and redo.
    fn stamp(&self, op: Operation) -> Operation {
        op.stamped(&self.identity.user_id, &self.document.id, self.document.version)
    }

    fn after_local(&mut self, op: Operation) -> Vec<Message> {
        // Optimistic: the hub will assign this version unless something lands first.
        self.document.version += 1;
        let presence = self.presence.reconcile(&op);
        vec![Message::Presence(presence), Message::Op(op)]
    }

    /// Fold a message from the hub into local state.
    pub fn receive(&mut self, message: Message) -> Option<SessionEvent> {
        match message {
            Message::Snapshot(document) => {
                log::debug!(
                    "snapshot of {} at version {} replaces local copy",
                    document.id,
                    document.version
                );
                self.document = document;
                self.history.clear();
                Some(SessionEvent::DocumentReplaced)
            }
            Message::Op(op) => {
                self.history.on_remote_operation(&mut self.document.content, &op);
                self.document.version += 1;
                Some(SessionEvent::RemoteEdit(op))
            }
            Message::Presence(entries) => {
                self.presence.handle_update(entries);
                Some(SessionEvent::PresenceChanged)
            }
            Message::PresenceRemove(remove) => {
                self.presence.handle_remove(&remove.session_id);
                Some(SessionEvent::PresenceChanged)
            }
            Message::Ack(ack) => {
                if let Some(version) = ack.version {
                    self.document.version = self.document.version.max(version);
                }
                Some(SessionEvent::Acknowledged(ack))
            }
            Message::Error(error) => {
                log::warn!("hub rejected a request: {}", error.message);
                Some(SessionEvent::Rejected(error.message))
            }
            Message::Hello(_) | Message::RequestSnapshot | Message::Ping(_) | Message::Pong(_) => None,
        }
    }

    pub fn content(&self) -> &str {
        &self.document.content
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn session_id(&self) -> &SessionId {
        self.presence.session_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// A replica wired to a live connection.
pub struct DocumentSession {
    replica: Replica,
    client: SyncClient,
}

impl DocumentSession {
    /// Start connecting. The hub's SNAPSHOT arrives as [`SessionEvent::DocumentReplaced`].
    pub fn connect(config: ClientConfig, identity: Identity, doc_id: impl Into<String>) -> Self {
        let replica = Replica::new(identity, doc_id);
        let mut client = SyncClient::new(config, replica.hello());
        client.start();
        Self { replica, client }
    }

    async fn transmit(&self, messages: Vec<Message>) {
        for message in messages {
            self.client.send(message).await;
        }
    }

    pub async fn edit(&mut self, new_text: &str) {
        let messages = self.replica.edit(new_text);
        self.transmit(messages).await;
    }

    pub async fn apply(&mut self, op: Operation) {
        let messages = self.replica.apply_local(op);
        self.transmit(messages).await;
    }

    pub async fn undo(&mut self) {
        let messages = self.replica.undo();
        self.transmit(messages).await;
    }

    pub async fn redo(&mut self) {
        let messages = self.replica.redo();
        self.transmit(messages).await;
    }

    pub async fn move_cursor(&mut self, cursor: usize, selection: Option<Range<usize>>) {
        let messages = self.replica.move_cursor(cursor, selection);
        self.transmit(messages).await;
    }

    pub async fn request_snapshot(&self) {
        self.client.send(Message::RequestSnapshot).await;
    }

    pub async fn leave(&self) {
        self.client.send(self.replica.leave()).await;
    }

    /// Wait for the next event that changed something.
    ///
    /// A version-mismatch rejection also requests a fresh snapshot, which
    /// arrives later as [`SessionEvent::DocumentReplaced`].
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let received = self.client.next_event().await?;
            let event = match received {
                SyncEvent::Connected => SessionEvent::Connected,
                SyncEvent::Disconnected => SessionEvent::Disconnected,
                SyncEvent::Error(e) => {
                    log::debug!("connection attempt failed: {e}");
                    continue;
                }
                SyncEvent::Message(envelope) => match self.replica.receive(envelope.message) {
                    Some(event) => event,
                    None => continue,
                },
            };
            if let SessionEvent::Rejected(message) = &event {
                if SyncError::is_version_mismatch(message) {
                    log::info!("local copy is stale, requesting a snapshot");
                    self.client.send(Message::RequestSnapshot).await;
                }
            }
            self.client
                .set_last_known_version(self.replica.document().version)
                .await;
            return Some(event);
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn content(&self) -> &str {
        self.replica.content()
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub async fn close(mut self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorPayload;

    fn replica(user: &str) -> Replica {
        Replica::new(Identity::new(user, user), "doc")
    }

    fn seeded(user: &str, content: &str) -> Replica {
        let mut r = replica(user);
        r.receive(Message::Snapshot(Document::new("doc", content)));
        r
    }

    fn sent_op(messages: &[Message]) -> &Operation {
        messages
            .iter()
            .find_map(|m| match m {
                Message::Op(op) => Some(op),
                _ => None,
            })
            .expect("an OP message")
    }

    #[test]
    fn test_edit_emits_presence_then_op() {
        let mut r = seeded("alice", "Hello World");
        let messages = r.edit("Hello, World");
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], Message::Presence(p) if p[0].cursor == 6));
        let op = sent_op(&messages);
        assert_eq!(op.index, 5);
        assert_eq!(op.user_id, "alice");
        assert_eq!(op.doc_id, "doc");
        assert_eq!(op.base_version, Some(0));
        assert_eq!(r.content(), "Hello, World");
        assert_eq!(r.document().version, 1);
    }

    #[test]
    fn test_identical_edit_sends_nothing() {
        let mut r = seeded("alice", "same");
        assert!(r.edit("same").is_empty());
    }

    #[test]
    fn test_undo_sends_fresh_inverted_op() {
        let mut r = seeded("alice", "abc");
        let first = sent_op(&r.edit("abcd")).clone();
        let messages = r.undo();
        let inverse = sent_op(&messages);
        assert!(inverse.invert);
        assert_ne!(inverse.op_id, first.op_id);
        assert_eq!(inverse.base_version, Some(1));
        assert_eq!(r.content(), "abc");

        let messages = r.redo();
        assert!(!sent_op(&messages).invert);
        assert_eq!(r.content(), "abcd");
        assert_eq!(r.undo().len(), 2);
        assert_eq!(r.redo().len(), 2);
        assert!(r.redo().is_empty());
    }

    #[test]
    fn test_remote_op_rebases_history() {
        let mut r = seeded("alice", "world");
        r.edit("world!");
        let event = r.receive(Message::Op(Operation::insert(0, "hello ")));
        assert!(matches!(event, Some(SessionEvent::RemoteEdit(_))));
        assert_eq!(r.content(), "hello world!");
        assert_eq!(r.document().version, 2);

        r.undo();
        assert_eq!(r.content(), "hello world");
    }

    #[test]
    fn test_snapshot_clears_history() {
        let mut r = seeded("alice", "abc");
        r.edit("abcd");
        assert!(r.history().can_undo());
        let event = r.receive(Message::Snapshot(Document {
            id: "doc".into(),
            version: 9,
            content: "fresh".into(),
        }));
        assert_eq!(event, Some(SessionEvent::DocumentReplaced));
        assert!(!r.history().can_undo());
        assert_eq!(r.hello().last_known_version, 9);
    }

    #[test]
    fn test_ack_raises_version() {
        let mut r = seeded("alice", "");
        r.receive(Message::Ack(Ack {
            op_id: Some("x".into()),
            version: Some(4),
            session_ids: Vec::new(),
        }));
        assert_eq!(r.document().version, 4);
        r.receive(Message::Ack(Ack {
            version: Some(2),
            ..Ack::default()
        }));
        assert_eq!(r.document().version, 4);
    }

    #[test]
    fn test_error_is_reported_not_rolled_back() {
        let mut r = seeded("alice", "abc");
        r.edit("abcd");
        let event = r.receive(Message::Error(ErrorPayload {
            message: "nope".into(),
        }));
        assert_eq!(event, Some(SessionEvent::Rejected("nope".into())));
        assert_eq!(r.content(), "abcd");
    }

    #[test]
    fn test_presence_flow_between_replicas() {
        let mut alice = seeded("alice", "0123456789");
        let mut bob = seeded("bob", "0123456789");

        let bob_moves = bob.move_cursor(8, None);
        for message in bob_moves {
            alice.receive(message);
        }
        assert_eq!(alice.presence().peer(bob.session_id()).unwrap().cursor, 8);

        // Alice inserts before Bob's caret and relays his moved position.
        let messages = alice.apply_local(Operation::insert(2, "abc"));
        let Message::Presence(entries) = &messages[0] else {
            panic!("expected presence first");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].cursor, 11);

        for message in messages {
            bob.receive(message);
        }
        assert_eq!(bob.presence().local().cursor, 11);
        assert_eq!(bob.content(), "01abc23456789");
        assert_eq!(bob.presence().peer(alice.session_id()).unwrap().cursor, 5);

        bob.receive(alice.leave());
        assert_eq!(bob.presence().peer_count(), 0);
    }

    #[test]
    fn test_session_ids_are_per_replica() {
        let a = replica("alice");
        let b = replica("alice");
        assert_ne!(a.session_id(), b.session_id());
    }
}
