//! WebSocket client side of the connection protocol.
//!
//! Provides:
//! - Connection lifecycle with unbounded reconnect and jittered backoff
//! - `HELLO` first on every (re)connect, then the offline queue in FIFO order
//! - `PING` heartbeat while connected
//! - Offline queue for envelopes sent while disconnected
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► (drop) ─► ReconnectScheduled
//!                     ▲                                       │
//!                     └──────────── backoff delay ◄───────────┘
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Result, SyncError};
use crate::protocol::{Envelope, Heartbeat, Hello, Message};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and `HELLO` sent
    Connected,
    /// Connection lost; a reconnect is scheduled
    Disconnected,
    /// Envelope received from the hub (`PONG` is consumed internally)
    Message(Envelope),
    /// A connection attempt failed
    Error(String),
}

/// Reconnect delay parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Exponential backoff: `min(base * 2^attempt, cap) + jitter`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before jitter for a given attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config.base.saturating_mul(factor).min(self.config.cap)
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = self.config.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Credential, sent as the percent-encoded `token` query parameter
    pub token: String,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Hub URL with the token appended as a form-urlencoded query parameter.
    fn connect_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| SyncError::Config(format!("invalid hub URL {:?}: {e}", self.url)))?;
        if !self.token.is_empty() {
            url.query_pairs_mut().append_pair("token", &self.token);
        }
        Ok(url.into())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            token: String::new(),
            heartbeat_interval: Duration::from_secs(20),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Envelopes waiting for a connection. Unbounded; nothing is dropped.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<Envelope>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    /// Put envelopes back ahead of everything queued, keeping their order.
    pub fn requeue_front(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes.into_iter().rev() {
            self.queue.push_front(envelope);
        }
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Connection state shared between the caller and the driver task.
#[derive(Debug)]
struct Link {
    state: ConnectionState,
    queue: OutboundQueue,
    writer: Option<UnboundedSender<Envelope>>,
    hello: Hello,
    unacked: HashSet<String>,
}

impl Link {
    fn new(hello: Hello) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            queue: OutboundQueue::new(),
            writer: None,
            hello,
            unacked: HashSet::new(),
        }
    }

    /// Send now if connected, otherwise queue.
    fn submit(&mut self, envelope: Envelope) {
        if let Message::Op(op) = &envelope.message {
            if !op.op_id.is_empty() {
                self.unacked.insert(op.op_id.clone());
            }
        }
        match (&self.writer, self.state) {
            (Some(writer), ConnectionState::Connected) => {
                if let Err(mpsc::error::SendError(envelope)) = writer.send(envelope) {
                    self.queue.push(envelope);
                }
            }
            _ => self.queue.push(envelope),
        }
    }

    /// Enter `Connected`: `HELLO`, then the queue, then live traffic.
    fn open(&mut self, writer: UnboundedSender<Envelope>) -> usize {
        let _ = writer.send(Envelope::request(Message::Hello(self.hello.clone())));
        let queued = self.queue.drain();
        let flushed = queued.len();
        for envelope in queued {
            if let Err(mpsc::error::SendError(envelope)) = writer.send(envelope) {
                self.queue.push(envelope);
            }
        }
        self.writer = Some(writer);
        self.state = ConnectionState::Connected;
        flushed
    }

    /// Leave `Connected`, keeping whatever was not written.
    ///
    /// Handshake and heartbeat envelopes are regenerated on the next
    /// connection and are not requeued.
    fn close(&mut self, unsent: Vec<Envelope>) {
        self.writer = None;
        self.state = ConnectionState::ReconnectScheduled;
        let unsent = unsent
            .into_iter()
            .filter(|e| !matches!(e.message, Message::Hello(_) | Message::Ping(_)))
            .collect();
        self.queue.requeue_front(unsent);
    }

    fn acknowledge(&mut self, op_id: &str) {
        self.unacked.remove(op_id);
    }
}

/// The sync client.
///
/// Owns a background driver that keeps one WebSocket open to the hub and
/// reconnects forever. Sends made while disconnected are queued.
pub struct SyncClient {
    config: ClientConfig,
    link: Arc<Mutex<Link>>,
    event_tx: UnboundedSender<SyncEvent>,
    event_rx: UnboundedReceiver<SyncEvent>,
    driver: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, hello: Hello) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            link: Arc::new(Mutex::new(Link::new(hello))),
            event_tx,
            event_rx,
            driver: None,
        }
    }

    /// Spawn the connection driver. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let driver = drive(self.config.clone(), self.link.clone(), self.event_tx.clone());
        self.driver = Some(tokio::spawn(driver));
    }

    /// Send an envelope with a fresh `requestId`. Returns that id.
    pub async fn send(&self, message: Message) -> Option<String> {
        let envelope = Envelope::request(message);
        let request_id = envelope.request_id.clone();
        self.link.lock().await.submit(envelope);
        request_id
    }

    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.event_rx.recv().await
    }

    /// Stop the driver and drop the connection. Queued envelopes are kept.
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            let _ = driver.await;
        }
        let mut link = self.link.lock().await;
        link.writer = None;
        link.state = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.link.lock().await.state
    }

    pub async fn queued_len(&self) -> usize {
        self.link.lock().await.queue.len()
    }

    /// `opId`s sent but not yet acknowledged by the hub.
    pub async fn unacked_ops(&self) -> Vec<String> {
        self.link.lock().await.unacked.iter().cloned().collect()
    }

    /// Version reported in the next `HELLO`.
    pub async fn set_last_known_version(&self, version: u64) {
        self.link.lock().await.hello.last_known_version = version;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Connect, serve, back off, repeat. Returns only if the URL is unusable.
async fn drive(config: ClientConfig, link: Arc<Mutex<Link>>, events: UnboundedSender<SyncEvent>) {
    let mut backoff = Backoff::new(config.backoff.clone());
    let url = match config.connect_url() {
        Ok(url) => url,
        Err(e) => {
            log::error!("{e}");
            link.lock().await.state = ConnectionState::Disconnected;
            let _ = events.send(SyncEvent::Error(e.to_string()));
            return;
        }
    };

    loop {
        link.lock().await.state = ConnectionState::Connecting;
        log::debug!("Connecting to {}", config.url);

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                backoff.reset();
                let (writer, outbound) = mpsc::unbounded_channel();
                let flushed = link.lock().await.open(writer);
                log::info!("Connected to {}, replayed {flushed} queued envelopes", config.url);
                let _ = events.send(SyncEvent::Connected);

                let unsent = run_connection(
                    ws_stream,
                    outbound,
                    &link,
                    &events,
                    config.heartbeat_interval,
                )
                .await;

                link.lock().await.close(unsent);
                log::info!("Disconnected from {}", config.url);
                let _ = events.send(SyncEvent::Disconnected);
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {e}", config.url);
                link.lock().await.state = ConnectionState::ReconnectScheduled;
                let _ = events.send(SyncEvent::Error(e.to_string()));
            }
        }

        let delay = backoff.next_delay();
        log::debug!("Reconnecting in {delay:?} (attempt {})", backoff.attempt());
        sleep(delay).await;
    }
}

/// Pump one live connection until it drops. Returns envelopes never written.
async fn run_connection(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: UnboundedReceiver<Envelope>,
    link: &Mutex<Link>,
    events: &UnboundedSender<SyncEvent>,
    heartbeat_interval: Duration,
) -> Vec<Envelope> {
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut unsent = Vec::new();

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(envelope) = next else { break };
                match envelope.encode() {
                    Ok(text) => {
                        if let Err(e) = ws_writer.send(WsMessage::text(text)).await {
                            log::warn!("Write failed: {e}");
                            unsent.push(envelope);
                            break;
                        }
                    }
                    Err(e) => log::error!("Dropping unencodable {}: {e}", envelope.message_type()),
                }
            }

            _ = heartbeat.tick() => {
                log::trace!("Sending heartbeat");
                let ping = Envelope::request(Message::Ping(Heartbeat::now()));
                let Ok(text) = ping.encode() else { continue };
                if ws_writer.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }

            incoming = ws_reader.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => match Envelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            match &envelope.message {
                                Message::Pong(_) => {
                                    log::trace!("Heartbeat acknowledged");
                                    continue;
                                }
                                Message::Ack(ack) => {
                                    if let Some(op_id) = &ack.op_id {
                                        link.lock().await.acknowledge(op_id);
                                    }
                                }
                                _ => {}
                            }
                            let _ = events.send(SyncEvent::Message(envelope));
                        }
                        Err(e) => log::warn!("Ignoring undecodable frame from hub: {e}"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Late submissions fail over to the queue once the receiver is closed.
    outbound.close();
    while let Ok(envelope) = outbound.try_recv() {
        unsent.push(envelope);
    }
    unsent
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::Operation;

    fn hello() -> Hello {
        Hello {
            user_id: "alice".into(),
            name: "Alice".into(),
            doc_id: "doc".into(),
            last_known_version: 0,
        }
    }

    fn op(text: &str) -> Envelope {
        Envelope::request(Message::Op(Operation::insert(0, text).stamped("alice", "doc", 0)))
    }

    fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_and_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for attempt in 0..6 {
            let delay = backoff.next_delay();
            let floor = backoff.delay_for(attempt);
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_millis(500));
        }
        assert_eq!(backoff.attempt(), 6);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_outbound_queue_requeue_front() {
        let mut queue = OutboundQueue::new();
        queue.push(op("c"));
        queue.requeue_front(vec![op("a"), op("b")]);
        let texts: Vec<String> = queue
            .drain()
            .into_iter()
            .filter_map(|e| match e.message {
                Message::Op(op) => op.text,
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submit_while_disconnected_queues() {
        let mut link = Link::new(hello());
        link.submit(op("a"));
        link.submit(Envelope::request(Message::RequestSnapshot));
        assert_eq!(link.queue.len(), 2);
        assert_eq!(link.unacked.len(), 1);
    }

    #[test]
    fn test_reconnect_sends_hello_then_queue_then_live() {
        let mut link = Link::new(hello());
        let first = op("first");
        let second = op("second");
        link.submit(first.clone());
        link.submit(second.clone());

        let (writer, mut rx) = mpsc::unbounded_channel();
        assert_eq!(link.open(writer), 2);
        let live = op("live");
        link.submit(live.clone());

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 4);
        assert!(matches!(sent[0].message, Message::Hello(_)));
        assert_eq!(sent[1], first);
        assert_eq!(sent[2], second);
        assert_eq!(sent[3], live);
        assert!(link.queue.is_empty());
        assert_eq!(link.state, ConnectionState::Connected);
    }

    #[test]
    fn test_close_requeues_unsent_without_handshake() {
        let mut link = Link::new(hello());
        let (writer, _rx) = mpsc::unbounded_channel();
        link.open(writer);

        let pending = op("pending");
        link.close(vec![
            Envelope::request(Message::Hello(hello())),
            pending.clone(),
            Envelope::request(Message::Ping(Heartbeat::now())),
        ]);
        assert_eq!(link.state, ConnectionState::ReconnectScheduled);
        assert!(link.writer.is_none());
        assert_eq!(link.queue.drain(), vec![pending]);
    }

    #[test]
    fn test_submit_after_receiver_closed_falls_back_to_queue() {
        let mut link = Link::new(hello());
        let (writer, rx) = mpsc::unbounded_channel();
        link.open(writer);
        drop(rx);
        link.submit(op("late"));
        assert_eq!(link.queue.len(), 1);
    }

    #[test]
    fn test_acknowledge_clears_unacked() {
        let mut link = Link::new(hello());
        let envelope = op("x");
        let Message::Op(sent) = &envelope.message else {
            unreachable!()
        };
        let op_id = sent.op_id.clone();
        link.submit(envelope);
        link.acknowledge(&op_id);
        assert!(link.unacked.is_empty());
    }

    #[test]
    fn test_connect_url_appends_token() {
        let config = ClientConfig::new("ws://h:1", "abc");
        assert_eq!(config.connect_url().unwrap(), "ws://h:1/?token=abc");
        let config = ClientConfig::new("ws://h:1/doc?x=1", "abc");
        assert_eq!(config.connect_url().unwrap(), "ws://h:1/doc?x=1&token=abc");
        assert_eq!(ClientConfig::new("ws://h:1/", "").connect_url().unwrap(), "ws://h:1/");
    }

    #[test]
    fn test_connect_url_token_survives_server_parsing() {
        for token in ["a&b=c", "abc=", "100%", "two words+more"] {
            let url = ClientConfig::new("ws://h:1/", token).connect_url().unwrap();
            let query = Url::parse(&url).unwrap().query().map(str::to_string);
            assert_eq!(
                crate::auth::token_from_request(query.as_deref(), None).as_deref(),
                Some(token)
            );
        }
    }

    #[test]
    fn test_connect_url_rejects_garbage() {
        assert!(matches!(
            ClientConfig::new("not a url", "t").connect_url(),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unusable_url_stops_driver() {
        let mut client = SyncClient::new(ClientConfig::new("not a url", "t"), hello());
        client.start();
        let event = tokio::time::timeout(Duration::from_secs(1), client.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(SyncEvent::Error(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(ClientConfig::default(), hello());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.queued_len().await, 0);
        assert_eq!(client.config().heartbeat_interval, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_send_offline_queues() {
        let client = SyncClient::new(ClientConfig::default(), hello());
        let request_id = client.send(Message::RequestSnapshot).await;
        assert!(request_id.is_some());
        client
            .send(Message::Op(Operation::insert(0, "x").stamped("alice", "doc", 0)))
            .await;
        assert_eq!(client.queued_len().await, 2);
        assert_eq!(client.unacked_ops().await.len(), 1);
    }
}
