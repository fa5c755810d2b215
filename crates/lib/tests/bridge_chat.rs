//! Integration tests: bridge facade and chat integration against the mock gateway.

mod common;

use async_trait::async_trait;
use common::{event, ok, Action, MockGateway};
use moltqq::bridge::{AgentRequest, Bridge, ChatOptions};
use moltqq::channels::{ChatOutbound, InboundHandler, InboundMessage, Notices, PushForwarder};
use moltqq::gateway::protocol::WsRequest;
use moltqq::gateway::{BridgeError, Frame, GatewayClient};
use moltqq::routing::{AllowList, SessionKey};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn text_message(text: &str) -> Value {
    json!({ "role": "assistant", "content": [{ "type": "text", "text": text }] })
}

fn chat_event(session: &str, state: &str, extra: Value) -> Action {
    let mut payload = json!({ "sessionKey": session, "state": state, "runId": "run-1" });
    if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        obj.extend(extra.clone());
    }
    event("chat", payload)
}

fn chat_send(req: &WsRequest) -> Vec<Action> {
    let session = req.params["sessionKey"].as_str().unwrap_or_default().to_string();
    let started = ok(req, json!({ "runId": "run-1", "status": "started" }));
    match req.params["message"].as_str().unwrap_or_default() {
        "hello" => vec![
            started,
            chat_event("qq:private:someone-else", "final", json!({ "message": text_message("wrong") })),
            chat_event(&session, "delta", json!({ "message": text_message("hel") })),
            chat_event(&session, "delta", json!({ "message": text_message("hello") })),
            chat_event(&session, "final", json!({ "message": text_message(" hello world ") })),
        ],
        "boom" => vec![
            started,
            chat_event(&session, "error", json!({ "errorMessage": "model crashed" })),
        ],
        "stop" => vec![started, chat_event(&session, "aborted", json!({}))],
        "reject" => vec![ok(req, json!({ "status": "error", "summary": "rate limited" }))],
        "silent" => vec![started, chat_event(&session, "final", json!({}))],
        "hang" => vec![started],
        "mute" => vec![],
        "first" => vec![
            ok(req, json!({ "runId": "run-a", "status": "started" })),
            Action::Sleep(Duration::from_millis(300)),
            chat_event(&session, "final", json!({ "runId": "run-a", "message": text_message("reply-one") })),
        ],
        // The final event lands before the ack.
        "second" => vec![
            chat_event(&session, "final", json!({ "runId": "run-b", "message": text_message("reply-two") })),
            ok(req, json!({ "runId": "run-b", "status": "started" })),
        ],
        _ => vec![ok(req, json!({ "runId": "run-1", "status": "started" }))],
    }
}

async fn gateway() -> MockGateway {
    MockGateway::start(|req| match req.method.as_str() {
        "chat.send" => chat_send(req),
        "chat.history" => vec![ok(
            req,
            json!({ "sessionKey": req.params["sessionKey"], "messages": [text_message("earlier")] }),
        )],
        "agent" => vec![
            ok(req, json!({ "runId": "run-2", "status": "accepted" })),
            Action::Sleep(Duration::from_millis(50)),
            ok(req, json!({ "runId": "run-2", "status": "ok", "text": " done " })),
        ],
        "send" => vec![ok(req, json!({ "messageId": "m1", "to": req.params["to"] }))],
        _ => vec![],
    })
    .await
}

async fn connected_bridge(mock: &MockGateway, timeout: Duration) -> Bridge {
    let client = GatewayClient::new(mock.client_options());
    client.connect().await.expect("connect");
    Bridge::new(client, timeout)
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(String, String)>>);

#[async_trait]
impl ChatOutbound for Recorder {
    async fn deliver(&self, target: &SessionKey, text: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((target.to_string(), text.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn chat_turn_streams_deltas_and_returns_final() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_secs(5)).await;
    let session = SessionKey::private("664275355");

    let deltas = Arc::new(Mutex::new(Vec::new()));
    let recorded = deltas.clone();
    let options = ChatOptions {
        on_delta: Some(Arc::new(move |text: &str| recorded.lock().unwrap().push(text.to_string()))),
        ..ChatOptions::default()
    };
    let reply = bridge.chat(&session, "hello", options).await.expect("chat");

    assert_eq!(reply.as_deref(), Some("hello world"));
    assert_eq!(*deltas.lock().unwrap(), vec!["hel".to_string(), "hello".to_string()]);
    assert_eq!(bridge.client().events().handler_count("chat"), 0);

    let sent = mock.requests_for("chat.send").pop().expect("chat.send");
    assert_eq!(sent.params["sessionKey"], "qq:private:664275355");
    assert_eq!(sent.params["message"], "hello");
    assert!(sent.params["idempotencyKey"].as_str().is_some_and(|k| !k.is_empty()));
    bridge.client().close().await;
}

#[tokio::test]
async fn chat_turn_failures() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_millis(300)).await;
    let session = SessionKey::group("1", "2");

    let err = bridge.chat(&session, "boom", ChatOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Gateway {
            code: "CHAT_ERROR".to_string(),
            message: "model crashed".to_string()
        }
    );

    let err = bridge.chat(&session, "stop", ChatOptions::default()).await.unwrap_err();
    assert_eq!(err, BridgeError::Aborted);

    let err = bridge.chat(&session, "reject", ChatOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Gateway {
            code: "CHAT_SEND_FAILED".to_string(),
            message: "rate limited".to_string()
        }
    );

    let reply = bridge.chat(&session, "silent", ChatOptions::default()).await.expect("silent");
    assert_eq!(reply, None);

    let err = bridge.chat(&session, "hang", ChatOptions::default()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");

    assert_eq!(bridge.client().events().handler_count("chat"), 0);
    assert!(bridge.client().is_ready());
    bridge.client().close().await;
}

#[tokio::test]
async fn concurrent_turns_on_one_session_keep_their_own_replies() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_secs(3)).await;
    let session = SessionKey::private("664275355");

    let first = {
        let bridge = bridge.clone();
        let session = session.clone();
        tokio::spawn(async move { bridge.chat(&session, "first", ChatOptions::default()).await })
    };
    assert!(common::eventually(Duration::from_secs(1), || !mock.requests_for("chat.send").is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = bridge.chat(&session, "second", ChatOptions::default()).await.expect("second");
    let first = first.await.unwrap().expect("first");

    assert_eq!(second.as_deref(), Some("reply-two"));
    assert_eq!(first.as_deref(), Some("reply-one"));
    assert_eq!(bridge.client().events().handler_count("chat"), 0);
    bridge.client().close().await;
}

#[tokio::test]
async fn unacknowledged_send_times_out_with_the_turn() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_millis(200)).await;

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        bridge.chat(&SessionKey::private("7"), "mute", ChatOptions::default()),
    )
    .await
    .expect("bounded by the turn timeout, not the ack timeout")
    .unwrap_err();
    assert_eq!(
        err,
        BridgeError::Timeout {
            method: "chat.send".to_string()
        }
    );
    assert!(bridge.client().pending().is_empty());
    bridge.client().close().await;
}

#[tokio::test]
async fn chat_turn_fails_when_connection_drops() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_secs(5)).await;
    let session = SessionKey::private("7");

    let turn = {
        let bridge = bridge.clone();
        let session = session.clone();
        tokio::spawn(async move { bridge.chat(&session, "hang", ChatOptions::default()).await })
    };
    assert!(common::eventually(Duration::from_secs(1), || !mock.requests_for("chat.send").is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    mock.drop_all();

    let err = tokio::time::timeout(Duration::from_secs(2), turn)
        .await
        .expect("turn ends before its own timeout")
        .unwrap()
        .unwrap_err();
    assert_eq!(err, BridgeError::ConnectionLost);
    bridge.client().close().await;
}

#[tokio::test]
async fn send_chat_history_agent_and_send() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_secs(5)).await;
    let session = SessionKey::group("10", "20");

    let ack = bridge.send_chat(&session, "anything").await.expect("send_chat");
    assert_eq!(ack["status"], "started");

    let history = bridge.chat_history(&session, Some(5)).await.expect("history");
    assert_eq!(history["sessionKey"], "qq:group:10:20");
    let req = mock.requests_for("chat.history").pop().expect("chat.history");
    assert_eq!(req.params["limit"], 5);

    let reply = bridge
        .agent(AgentRequest {
            message: "summarize".to_string(),
            session: Some(session.clone()),
            ..AgentRequest::default()
        })
        .await
        .expect("agent");
    assert_eq!(reply.as_deref(), Some("done"));
    assert!(bridge.client().pending().is_empty());

    let sent = bridge
        .send_message("user:1", "hi there", Some("qq"), None)
        .await
        .expect("send");
    assert_eq!(sent["messageId"], "m1");
    let req = mock.requests_for("send").pop().expect("send request");
    assert_eq!(req.params["channel"], "qq");
    assert!(req.params.get("accountId").is_none());
    bridge.client().close().await;
}

#[tokio::test]
async fn inbound_handler_replies_and_gates() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_millis(300)).await;
    let handler = InboundHandler::new(bridge.clone(), AllowList::parse("42"));
    let out = Recorder::default();

    handler.handle(&InboundMessage::group("9", "42", "hello"), &out).await.unwrap();
    handler.handle(&InboundMessage::private("7", "hello"), &out).await.unwrap();
    handler.handle(&InboundMessage::private("42", "boom"), &out).await.unwrap();
    handler.handle(&InboundMessage::private("42", "hang"), &out).await.unwrap();

    let notices = Notices::default();
    assert_eq!(
        *out.0.lock().unwrap(),
        vec![
            ("qq:group:9:42".to_string(), "hello world".to_string()),
            ("qq:private:42".to_string(), notices.failed),
            ("qq:private:42".to_string(), notices.timeout),
        ]
    );
    // The denied user never reached the gateway.
    assert!(mock
        .requests_for("chat.send")
        .iter()
        .all(|r| r.params["sessionKey"] != "qq:private:7"));
    bridge.client().close().await;
}

#[tokio::test]
async fn pushes_are_forwarded_to_chat() {
    let mock = gateway().await;
    let bridge = connected_bridge(&mock, Duration::from_secs(1)).await;
    let out = Arc::new(Recorder::default());
    bridge.on_push(Arc::new(PushForwarder::new(out.clone())));

    mock.push(Frame::event(
        "chat.push",
        json!({ "sessionKey": "qq:group:5:6", "text": "reminder" }),
    ));
    assert!(common::eventually(Duration::from_secs(2), || !out.0.lock().unwrap().is_empty()).await);
    assert_eq!(
        *out.0.lock().unwrap(),
        vec![("qq:group:5:6".to_string(), "reminder".to_string())]
    );
    bridge.client().close().await;
}
