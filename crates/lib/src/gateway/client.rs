//! Gateway connection: owns the WebSocket, runs the connect handshake and the single
//! receive loop, serializes writes, and reconnects with backoff after unexpected loss.

use crate::gateway::backoff::{Backoff, ReconnectPolicy};
use crate::gateway::error::BridgeError;
use crate::gateway::events::EventDispatcher;
use crate::gateway::pending::PendingTable;
use crate::gateway::protocol::{self, ConnectParams, Frame, HelloOk, WsEvent, WsRequest, WsResponse};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";

const MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;
const CHALLENGE_EVENT: &str = "connect.challenge";
const TICK_EVENT: &str = "tick";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Lifecycle of the single gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

/// Connection settings. Built from [`crate::config::Config`] by the application.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub token: Option<String>,
    pub password: Option<String>,
    /// Client id announced in `connect`; must be one the gateway knows.
    pub client_name: String,
    pub client_version: String,
    /// Default deadline for requests issued without an explicit timeout.
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// How long to wait for an optional `connect.challenge` before sending `connect`.
    pub challenge_wait: Duration,
    pub handshake_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: None,
            password: None,
            client_name: "gateway-client".to_string(),
            client_version: "1.0.0".to_string(),
            request_timeout: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
            challenge_wait: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Handle to the gateway connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    state: watch::Sender<ConnectionState>,
    /// Write half of the live socket; the async mutex serializes writers in call order.
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: PendingTable,
    events: EventDispatcher,
    hello: Mutex<Option<HelloOk>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Bumped per successful connect so a stale reader cannot tear down a newer socket.
    generation: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    reconnecting: AtomicBool,
    /// Delay sequence across reconnect runs; reset by every successful connect.
    backoff: Mutex<Backoff>,
    sweeper_started: AtomicBool,
}

impl GatewayClient {
    pub fn new(options: ClientOptions) -> Self {
        let backoff = Backoff::new(options.reconnect);
        Self {
            inner: Arc::new(Inner {
                options,
                state: watch::channel(ConnectionState::Disconnected).0,
                writer: tokio::sync::Mutex::new(None),
                pending: PendingTable::new(),
                events: EventDispatcher::new(),
                hello: Mutex::new(None),
                reader: Mutex::new(None),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown: watch::channel(false).0,
                reconnecting: AtomicBool::new(false),
                backoff: Mutex::new(backoff),
                sweeper_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection is Ready. Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let ready = tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Ready))
            .await
            .is_ok_and(|r| r.is_ok());
        ready
    }

    /// True while a background reconnect task is running.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Hello payload of the current (or last) successful handshake.
    pub fn hello(&self) -> Option<HelloOk> {
        self.inner.hello.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    /// Open the socket and complete the handshake. On failure a background reconnect is
    /// scheduled (unless the client was closed) and the error is returned.
    pub async fn connect(&self) -> Result<HelloOk, BridgeError> {
        let result = self.inner.try_connect().await;
        if result.is_err() {
            Inner::schedule_reconnect(&self.inner);
        }
        result
    }

    /// Write one frame. Rejected without any I/O unless the connection is Ready.
    pub async fn send(&self, frame: &Frame) -> Result<(), BridgeError> {
        self.inner.send(frame).await
    }

    /// Send a request and wait for its payload, using the default request timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let timeout = self.inner.options.request_timeout;
        self.request_with(method, params, timeout, false).await
    }

    pub async fn request_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.request_with(method, params, timeout, false).await
    }

    /// Like [`request_timeout`](Self::request_timeout) but skips `{"status":"accepted"}` acks
    /// and waits for the final response.
    pub async fn request_final(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.request_with(method, params, timeout, true).await
    }

    async fn request_with(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        expect_final: bool,
    ) -> Result<Value, BridgeError> {
        if self.state() != ConnectionState::Ready {
            return Err(BridgeError::NotConnected);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let handle = self
            .inner
            .pending
            .register(id.clone(), method, timeout, expect_final)?;
        let frame = Frame::Request(WsRequest {
            id,
            method: method.to_string(),
            params,
        });
        log::debug!("gateway: -> {} {}", method, handle.id());
        self.inner.send(&frame).await?;
        let response = handle.wait().await?;
        response.into_result().map_err(BridgeError::from)
    }

    /// Deliberate close: stops reconnecting, fails pending requests with
    /// `ConnectionClosed`, and closes the socket. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.set_state(ConnectionState::Closing);
        inner.shutdown.send_replace(true);
        let reader = inner.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let failed = inner.pending.fail_all(|| BridgeError::ConnectionClosed);
        let sink = inner.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            })
            .await;
        }
        inner.set_state(ConnectionState::Disconnected);
        log::info!("gateway: connection closed ({} pending request(s) failed)", failed);
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("gateway: state {:?} -> {:?}", prev, next);
        }
    }

    /// Move from `from` to `to` only if the state is still `from`.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            log::debug!("gateway: state {:?} -> {:?}", from, to);
        }
        moved
    }

    async fn try_connect(self: &Arc<Self>) -> Result<HelloOk, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionClosed);
        }
        if !self.advance(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return match self.state() {
                ConnectionState::Ready => Ok(self
                    .hello
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or_default()),
                ConnectionState::Closing => Err(BridgeError::ConnectionClosed),
                _ => Err(BridgeError::Handshake("connect already in progress".to_string())),
            };
        }
        log::info!("gateway: connecting to {}", self.options.url);
        let (sink, source, hello) = match self.open_and_handshake().await {
            Ok(parts) => parts,
            Err(e) => {
                self.advance(ConnectionState::Connecting, ConnectionState::Disconnected);
                self.advance(ConnectionState::Authenticating, ConnectionState::Disconnected);
                log::warn!("gateway: connect failed: {}", e);
                return Err(e);
            }
        };

        *self.writer.lock().await = Some(sink);
        if !self.advance(ConnectionState::Authenticating, ConnectionState::Ready) {
            // Closed while the handshake was in flight.
            self.writer.lock().await.take();
            return Err(BridgeError::ConnectionClosed);
        }
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner).reset();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.hello.lock().unwrap_or_else(PoisonError::into_inner) = Some(hello.clone());
        let reader = tokio::spawn(Arc::clone(self).run_reader(source, generation));
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }
        self.ensure_sweeper();
        log::info!(
            "gateway: connected to {} (protocol {})",
            self.options.url,
            hello.protocol.map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        Ok(hello)
    }

    async fn open_and_handshake(&self) -> Result<(WsSink, WsSource, HelloOk), BridgeError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_MESSAGE_SIZE);
        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(self.options.url.as_str(), Some(config), false)
                .await?;
        if !self.advance(ConnectionState::Connecting, ConnectionState::Authenticating) {
            return Err(BridgeError::ConnectionClosed);
        }
        let (mut sink, mut source) = ws.split();

        // The gateway may open with a challenge; absence is fine.
        match tokio::time::timeout(self.options.challenge_wait, next_text(&mut source)).await {
            Ok(Some(Ok(text))) => match protocol::decode(&text) {
                Ok(Frame::Event(ev)) if ev.event == CHALLENGE_EVENT => {
                    let nonce = ev.payload.get("nonce").and_then(|n| n.as_str()).unwrap_or("");
                    log::debug!("gateway: received connect challenge (nonce {})", nonce);
                }
                Ok(_) => log::debug!("gateway: dropping frame received before connect"),
                Err(e) => log::warn!("gateway: dropping {}: {}", e, preview(&e.raw)),
            },
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(closed_during_handshake()),
            Err(_) => log::debug!("gateway: no connect challenge, sending connect"),
        }

        let params = ConnectParams::operator(
            &self.options.client_name,
            &self.options.client_version,
            self.options.token.as_deref(),
            self.options.password.as_deref(),
        );
        let id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::Request(WsRequest {
            id: id.clone(),
            method: "connect".to_string(),
            params: serde_json::to_value(&params)?,
        });
        sink.send(Message::Text(protocol::encode(&frame)?)).await?;

        let response = tokio::time::timeout(
            self.options.handshake_timeout,
            wait_for_response(&mut source, &id),
        )
        .await
        .map_err(|_| BridgeError::Handshake("timed out waiting for connect response".to_string()))??;
        let payload = response
            .into_result()
            .map_err(|e| BridgeError::Handshake(format!("{}: {}", e.code, e.message)))?;
        let hello: HelloOk = serde_json::from_value(payload).unwrap_or_default();
        Ok((sink, source, hello))
    }

    async fn send(&self, frame: &Frame) -> Result<(), BridgeError> {
        if self.state() != ConnectionState::Ready {
            return Err(BridgeError::NotConnected);
        }
        let text = protocol::encode(frame)?;
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(BridgeError::NotConnected);
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            log::warn!("gateway: write failed: {}", e);
            return Err(BridgeError::ConnectionLost);
        }
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, mut source: WsSource, generation: u64) {
        let reason = loop {
            match next_text(&mut source).await {
                Some(Ok(text)) => self.handle_text(&text).await,
                Some(Err(e)) => break e.to_string(),
                None => break "socket closed by gateway".to_string(),
            }
        };
        self.connection_lost(generation, &reason).await;
    }

    async fn handle_text(&self, text: &str) {
        match protocol::decode(text) {
            Ok(Frame::Response(res)) => {
                self.pending.resolve(res);
            }
            Ok(Frame::Event(ev)) => self.handle_event(ev).await,
            Ok(Frame::Request(req)) => {
                log::debug!("gateway: ignoring {} request from gateway", req.method)
            }
            Err(e) => log::warn!("gateway: dropping {}: {}", e, preview(&e.raw)),
        }
    }

    async fn handle_event(&self, ev: WsEvent) {
        if self.state() != ConnectionState::Ready {
            log::debug!("gateway: dropping event {} received before ready", ev.event);
            return;
        }
        match ev.event.as_str() {
            TICK_EVENT => log::trace!("gateway: tick"),
            CHALLENGE_EVENT => log::debug!("gateway: ignoring connect challenge after handshake"),
            _ => {
                self.events.dispatch(&ev).await;
            }
        }
    }

    async fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.closed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        log::warn!("gateway: connection lost: {}", reason);
        self.advance(ConnectionState::Ready, ConnectionState::Disconnected);
        let failed = self.pending.fail_all(|| BridgeError::ConnectionLost);
        if failed > 0 {
            log::warn!("gateway: {} pending request(s) failed with connection lost", failed);
        }
        self.writer.lock().await.take();
        Inner::schedule_reconnect(self);
    }

    /// Start the reconnect task unless one is running or the client is closed.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconnect_loop().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
            // A loss right after the last successful attempt found the flag still set.
            if !inner.closed.load(Ordering::SeqCst) && inner.state() == ConnectionState::Disconnected {
                Inner::schedule_reconnect(&inner);
            }
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let delay = self.backoff.lock().unwrap_or_else(PoisonError::into_inner).next_delay();
            attempt += 1;
            log::info!("gateway: reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            match self.try_connect().await {
                Ok(_) => {
                    log::info!("gateway: reconnected after {} attempt(s)", attempt);
                    return;
                }
                Err(BridgeError::ConnectionClosed) => return,
                Err(e) => log::debug!("gateway: reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.options.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(inner) = weak.upgrade() else { break };
                let expired = inner.pending.sweep(Instant::now());
                if expired > 0 {
                    log::debug!("gateway: sweeper expired {} request(s)", expired);
                }
            }
        });
    }
}

/// Next text frame from the socket. Binary frames are accepted when they are UTF-8.
/// `None` means the socket closed.
async fn next_text(source: &mut WsSource) -> Option<Result<String, BridgeError>> {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(Ok(text)),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => return Some(Ok(text)),
                Err(_) => log::warn!("gateway: dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                log::debug!("gateway: close frame received: {:?}", frame);
                return None;
            }
            Ok(_) => {}
            Err(e) => return Some(Err(e.into())),
        }
    }
    None
}

async fn wait_for_response(source: &mut WsSource, id: &str) -> Result<WsResponse, BridgeError> {
    loop {
        let text = match next_text(source).await {
            Some(text) => text?,
            None => return Err(closed_during_handshake()),
        };
        match protocol::decode(&text) {
            Ok(Frame::Response(res)) if res.id == id => return Ok(res),
            Ok(Frame::Event(ev)) if ev.event == CHALLENGE_EVENT => {
                log::debug!("gateway: late connect challenge ignored")
            }
            Ok(_) => log::debug!("gateway: dropping frame received before ready"),
            Err(e) => log::warn!("gateway: dropping {}: {}", e, preview(&e.raw)),
        }
    }
}

fn closed_during_handshake() -> BridgeError {
    BridgeError::Handshake("socket closed during handshake".to_string())
}

/// First 200 characters of a raw frame, for log lines.
fn preview(raw: &str) -> &str {
    raw.char_indices().nth(200).map_or(raw, |(i, _)| &raw[..i])
}
