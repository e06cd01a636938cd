//! # scribe-collab: real-time sync for a shared text document
//!
//! A central hub owns the authoritative document and relays edits and
//! caret positions between WebSocket clients. Messages are JSON envelopes
//! sent as text frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     WebSocket      ┌─────────────┐
//! │ DocumentSession │ ◄─────────────────► │ SyncServer  │
//! │  Replica        │   JSON envelopes    │ (token auth)│
//! │  SyncClient     │                     └──────┬──────┘
//! └─────────────────┘                            │ HubHandle
//!                                                ▼
//!                                         ┌─────────────┐
//!                                         │ Hub task    │
//!                                         │ Document    │
//!                                         │ presence    │
//!                                         └──────┬──────┘
//!                                                │
//!                                        ┌───────┴───────┐
//!                                        │ BroadcastGroup│
//!                                        │ (fan-out)     │
//!                                        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: envelope and message types, JSON encoding
//! - [`auth`]: handshake tokens and identities
//! - [`presence`]: caret/selection entries and the client-side room
//! - [`broadcast`]: non-blocking fan-out to connections
//! - [`hub`]: the single writer for document state
//! - [`server`]: WebSocket accept loop
//! - [`client`]: reconnecting client with an offline queue
//! - [`session`]: replica state plus client, for editors

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::{token_from_request, CredentialVerifier, Identity, StaticCredentials};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame};
pub use client::{
    Backoff, BackoffConfig, ClientConfig, ConnectionState, OutboundQueue, SyncClient, SyncEvent,
};
pub use error::{Result, SyncError};
pub use hub::{ConflictPolicy, Hub, HubCommand, HubHandle, HubStats};
pub use presence::{Presence, PresenceRoom, SessionId};
pub use protocol::{
    Ack, Envelope, ErrorPayload, Heartbeat, Hello, Message, MessageType, PresenceRemove,
    ProtocolError,
};
pub use server::{ServerConfig, SyncServer};
pub use session::{DocumentSession, Replica, SessionEvent};
