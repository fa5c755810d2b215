//! In-process mock Moltbot gateway for integration tests.
//!
//! Serves one WebSocket route on a free port. Every socket gets a `connect.challenge`
//! (unless disabled), `connect` is answered with hello-ok (or rejected on token mismatch),
//! and every other request is answered by the test's script.

#![allow(dead_code)]

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use moltqq::gateway::protocol::{self, Frame, WsRequest, WsResponse};
use moltqq::gateway::{ClientOptions, ReconnectPolicy};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// What the mock does in answer to one request, in order.
#[derive(Debug, Clone)]
pub enum Action {
    Send(Frame),
    Sleep(Duration),
    /// Drop the socket without a close handshake.
    Drop,
}

pub fn ok(req: &WsRequest, payload: Value) -> Action {
    Action::Send(Frame::Response(WsResponse::ok(&req.id, payload)))
}

pub fn err(req: &WsRequest, code: &str, message: &str) -> Action {
    Action::Send(Frame::Response(WsResponse::err(&req.id, code, message)))
}

pub fn event(name: &str, payload: Value) -> Action {
    Action::Send(Frame::event(name, payload))
}

type Script = dyn Fn(&WsRequest) -> Vec<Action> + Send + Sync;

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub token: Option<String>,
    pub challenge: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            token: None,
            challenge: true,
        }
    }
}

#[derive(Clone)]
enum Command {
    Push(Frame),
    DropAll,
}

enum Out {
    Frame(Frame),
    Drop,
}

struct MockState {
    options: MockOptions,
    script: Box<Script>,
    commands: broadcast::Sender<Command>,
    accepted: AtomicUsize,
    requests: Mutex<Vec<WsRequest>>,
}

pub struct MockGateway {
    pub url: String,
    state: Arc<MockState>,
}

impl MockGateway {
    pub async fn start(script: impl Fn(&WsRequest) -> Vec<Action> + Send + Sync + 'static) -> Self {
        Self::start_with(MockOptions::default(), script).await
    }

    pub async fn start_with(
        options: MockOptions,
        script: impl Fn(&WsRequest) -> Vec<Action> + Send + Sync + 'static,
    ) -> Self {
        let state = Arc::new(MockState {
            options,
            script: Box::new(script),
            commands: broadcast::channel(64).0,
            accepted: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock gateway");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("ws://{}", addr),
            state,
        }
    }

    /// Client options pointing at this mock, with short timings for tests.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            url: self.url.clone(),
            challenge_wait: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(50),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                jitter: 0.0,
            },
            ..ClientOptions::default()
        }
    }

    /// Send a frame to every open socket.
    pub fn push(&self, frame: Frame) {
        let _ = self.state.commands.send(Command::Push(frame));
    }

    /// Drop every open socket without a close handshake.
    pub fn drop_all(&self) {
        let _ = self.state.commands.send(Command::DropAll);
    }

    /// Sockets accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Requests received so far (including `connect`).
    pub fn requests(&self) -> Vec<WsRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<WsRequest> {
        self.requests().into_iter().filter(|r| r.method == method).collect()
    }
}

async fn ws_handler(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    let text = protocol::encode(frame).expect("encode frame");
    socket.send(Message::Text(text)).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<MockState>) {
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let mut commands = state.commands.subscribe();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Out>();

    if state.options.challenge {
        let challenge = Frame::event("connect.challenge", json!({ "nonce": "n-1", "ts": 0 }));
        if !send_frame(&mut socket, &challenge).await {
            return;
        }
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Ok(Command::Push(frame)) => {
                    send_frame(&mut socket, &frame).await;
                }
                Ok(Command::DropAll) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            out = out_rx.recv() => match out {
                Some(Out::Frame(frame)) => {
                    send_frame(&mut socket, &frame).await;
                }
                Some(Out::Drop) | None => break,
            },
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(Frame::Request(req)) = protocol::decode(&text) else { continue };
                state.requests.lock().unwrap().push(req.clone());

                if req.method == "connect" {
                    let provided = req.params["auth"]["token"].as_str();
                    let authorized = match state.options.token.as_deref() {
                        Some(required) => provided == Some(required),
                        None => true,
                    };
                    let res = if authorized {
                        WsResponse::ok(
                            &req.id,
                            json!({ "type": "hello-ok", "protocol": 3, "policy": { "tickIntervalMs": 15000 } }),
                        )
                    } else {
                        WsResponse::err(&req.id, "UNAUTHORIZED", "gateway token mismatch")
                    };
                    send_frame(&mut socket, &Frame::Response(res)).await;
                    continue;
                }

                let actions = (state.script)(&req);
                let tx = out_tx.clone();
                tokio::spawn(async move {
                    for action in actions {
                        match action {
                            Action::Send(frame) => {
                                let _ = tx.send(Out::Frame(frame));
                            }
                            Action::Sleep(d) => tokio::time::sleep(d).await,
                            Action::Drop => {
                                let _ = tx.send(Out::Drop);
                            }
                        }
                    }
                });
            }
        }
    }
}

/// Wait until `cond` holds, polling every 10ms, for at most `timeout`.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
