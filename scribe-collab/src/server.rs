//! WebSocket front end for the hub.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► handshake (token from ?token= or Bearer)
//!                               │
//!                    invalid ───┴─── valid
//!                       │              │
//!               ERROR + close    socket task ◄──► HubHandle ──► Hub task
//! ```
//!
//! Each socket task forwards inbound text frames to the hub and writes
//! whatever the hub queues on its outbound channel. No envelope is read
//! before the credential has been checked.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use scribe_core::Document;

use crate::auth::{token_from_request, CredentialVerifier};
use crate::error::Result;
use crate::hub::{ConflictPolicy, Hub, HubCommand, HubHandle};
use crate::protocol::{Envelope, Message};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Id of the single document this hub serves
    pub document_id: String,
    /// Content the document starts with, at version 0
    pub initial_content: String,
    pub conflict_policy: ConflictPolicy,
    /// Hub mailbox depth; socket tasks wait when it is full
    pub mailbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            document_id: "default".to_string(),
            initial_content: String::new(),
            conflict_policy: ConflictPolicy::ArrivalOrder,
            mailbox_capacity: 1024,
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: HubHandle,
    /// Hub and mailbox, until `serve` starts the hub task.
    pending: Mutex<Option<(Hub, mpsc::Receiver<HubCommand>)>>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, verifier: impl CredentialVerifier) -> Self {
        let document = Document::new(config.document_id.clone(), config.initial_content.clone());
        let hub = Hub::new(document, config.conflict_policy);
        let (handle, mailbox) = HubHandle::channel(config.mailbox_capacity);
        Self {
            config,
            hub: handle,
            pending: Mutex::new(Some((hub, mailbox))),
            verifier: Arc::new(verifier),
        }
    }

    /// Address of the hub, usable before the server is running.
    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.start_hub();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let verifier = Arc::clone(&self.verifier);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, verifier).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn start_hub(&self) {
        let pending = self.pending.lock().ok().and_then(|mut slot| slot.take());
        if let Some((hub, mailbox)) = pending {
            tokio::spawn(hub.run(mailbox));
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    verifier: Arc<dyn CredentialVerifier>,
) -> Result<()> {
    let mut token = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            let authorization = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            token = token_from_request(request.uri().query(), authorization);
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let identity = match token.as_deref().map(|t| (t, verifier.verify(t))) {
        Some((_, Some(identity))) => identity,
        rejected => {
            let reason = if rejected.is_some() {
                "Invalid token"
            } else {
                "Authentication required"
            };
            log::warn!("Rejecting connection from {addr}: {reason}");
            let refusal = Envelope::new(Message::error(reason)).encode()?;
            ws_sender.send(WsMessage::text(refusal)).await?;
            ws_sender.send(WsMessage::Close(None)).await?;
            return Ok(());
        }
    };

    let id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    hub.connect(id, identity.clone(), outbound_tx).await?;
    log::info!("WebSocket connection from {addr} authenticated as {}", identity.user_id);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if hub.frame(id, text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        let error = Envelope::new(Message::error("Malformed message: binary frames are not supported"));
                        if let Ok(text) = error.encode() {
                            if ws_sender.send(WsMessage::text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if ws_sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(WsMessage::text(frame.to_string())).await {
                            log::warn!("Failed to write to {addr}: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // The hub may already be gone during shutdown.
    let _ = hub.disconnect(id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, StaticCredentials};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.document_id, "default");
        assert!(config.initial_content.is_empty());
        assert_eq!(config.conflict_policy, ConflictPolicy::ArrivalOrder);
        assert_eq!(config.mailbox_capacity, 1024);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::default(), StaticCredentials::new());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.pending.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hub_starts_with_configured_document() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            document_id: "notes".to_string(),
            initial_content: "seed".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(
            config,
            StaticCredentials::new().with_token("t", Identity::new("u", "U")),
        );
        server.start_hub();
        assert!(server.pending.lock().unwrap().is_none());

        let document = server.hub().document().await.unwrap();
        assert_eq!(document, Document::new("notes", "seed"));
    }
}
