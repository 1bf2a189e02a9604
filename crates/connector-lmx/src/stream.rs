//! Turn loop over the LMX `/v1/chat/stream` WebSocket.
//!
//! Client frames: `chat.request`, `chat.cancel`.
//! Server frames: `chat.token`, `chat.tool_call`, `chat.done`, `chat.error`.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use opta_connector_core::{
    BackendError, BackendEvent, ToolCall, ToolExecutor, ToolOutcome, TurnChannels, TurnControl,
    TurnRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::LmxConfig;

type LmxSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundFrame {
    #[serde(rename = "chat.token")]
    Token {
        request_id: Option<String>,
        content: String,
    },
    #[serde(rename = "chat.tool_call")]
    ToolCall {
        request_id: Option<String>,
        tool_call: ToolCallDelta,
    },
    #[serde(rename = "chat.done")]
    Done {
        request_id: Option<String>,
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(rename = "chat.error")]
    Error {
        #[allow(dead_code)]
        request_id: Option<String>,
        error: String,
    },
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Tool call assembled from streamed deltas.
#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

struct Round {
    text: String,
    calls: Vec<PendingCall>,
    cancelled: bool,
}

impl Round {
    fn cancelled() -> Self {
        Self {
            text: String::new(),
            calls: Vec::new(),
            cancelled: true,
        }
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

enum Decision {
    Approved,
    Denied(String),
    Cancelled,
}

pub(crate) async fn run_turn(
    config: Arc<LmxConfig>,
    tools: Arc<dyn ToolExecutor>,
    request: TurnRequest,
    channels: TurnChannels,
) {
    let TurnChannels {
        events,
        mut control,
    } = channels;

    let terminal = match drive(&config, tools.as_ref(), &request, &events, &mut control).await {
        Ok(Outcome::Completed) => BackendEvent::Completed,
        Ok(Outcome::Cancelled) => BackendEvent::Cancelled,
        Err(error) => {
            warn!(
                component = "lmx",
                event = "lmx.turn.failed",
                session_id = %request.session_id,
                turn_id = %request.turn_id,
                model = %request.model,
                error = %error,
                "LMX turn failed"
            );
            BackendEvent::Failed(error)
        }
    };
    let _ = events.send(terminal).await;
}

async fn drive(
    config: &LmxConfig,
    tools: &dyn ToolExecutor,
    request: &TurnRequest,
    events: &mpsc::Sender<BackendEvent>,
    control: &mut mpsc::Receiver<TurnControl>,
) -> Result<Outcome, BackendError> {
    let mut socket = connect(config).await?;
    info!(
        component = "lmx",
        event = "lmx.turn.connected",
        turn_id = %request.turn_id,
        model = %request.model,
    );

    let definitions = tools.definitions();
    let mut messages = initial_messages(request);

    for _ in 0..=config.max_tool_rounds {
        let payload = chat_request(config, &request.model, &messages, &definitions);
        socket
            .send(Message::text(payload.to_string()))
            .await
            .map_err(|e| BackendError::StreamClosed(e.to_string()))?;

        let round = stream_round(&mut socket, config, &request.model, events, control).await?;
        if round.cancelled {
            let _ = socket.close(None).await;
            return Ok(Outcome::Cancelled);
        }
        if round.calls.is_empty() {
            let _ = socket.close(None).await;
            return Ok(Outcome::Completed);
        }

        messages.push(ChatMessage {
            role: "assistant",
            content: (!round.text.is_empty()).then(|| round.text.clone()),
            tool_calls: Some(round.calls.iter().map(openai_tool_call).collect()),
            tool_call_id: None,
        });

        for call in round.calls {
            let arguments =
                serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments));
            let tool_call = ToolCall {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments,
                requires_approval: !config.auto_approve_tools.iter().any(|t| *t == call.name),
            };
            let needs_approval = tool_call.requires_approval;
            if events
                .send(BackendEvent::ToolCall(tool_call.clone()))
                .await
                .is_err()
            {
                return Ok(Outcome::Cancelled);
            }

            let decision = if needs_approval {
                await_decision(control, &call.id).await
            } else {
                Decision::Approved
            };
            let result = match decision {
                Decision::Approved => execute_tool(tools, tool_call, events).await,
                Decision::Denied(reason) => format!("error: permission denied: {reason}"),
                Decision::Cancelled => {
                    let _ = socket.close(None).await;
                    return Ok(Outcome::Cancelled);
                }
            };

            messages.push(ChatMessage {
                role: "tool",
                content: Some(result),
                tool_calls: None,
                tool_call_id: Some(call.id),
            });
        }
    }

    let _ = socket.close(None).await;
    Err(BackendError::Other(format!(
        "model kept calling tools after {} rounds",
        config.max_tool_rounds
    )))
}

async fn connect(config: &LmxConfig) -> Result<LmxSocket, BackendError> {
    let mut request = config
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| BackendError::Other(format!("invalid LMX url {}: {e}", config.ws_url)))?;
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| BackendError::Other(format!("invalid LMX api key: {e}")))?;
        request.headers_mut().insert("authorization", value);
    }

    match tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    {
        Err(_) => Err(BackendError::Timeout(config.connect_timeout.as_millis() as u64)),
        Ok(Err(error)) => Err(map_connect_error(&config.ws_url, error)),
        Ok(Ok((socket, _response))) => Ok(socket),
    }
}

fn map_connect_error(url: &str, error: tungstenite::Error) -> BackendError {
    match error {
        tungstenite::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::AddrNotAvailable
            | std::io::ErrorKind::NotConnected => {
                BackendError::ConnectionRefused(format!("{url}: {io}"))
            }
            std::io::ErrorKind::TimedOut => BackendError::Timeout(0),
            _ => BackendError::Other(format!("{url}: {io}")),
        },
        other => BackendError::Other(format!("LMX handshake failed: {other}")),
    }
}

fn initial_messages(request: &TurnRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);
    for entry in &request.history {
        messages.push(ChatMessage::text("user", &entry.prompt));
        messages.push(ChatMessage::text("assistant", &entry.response));
    }
    messages.push(ChatMessage::text("user", &request.content));
    messages
}

fn chat_request(
    config: &LmxConfig,
    model: &str,
    messages: &[ChatMessage],
    definitions: &[Value],
) -> Value {
    let mut payload = json!({
        "type": "chat.request",
        "model": model,
        "messages": messages,
        "stream": true,
    });
    if !definitions.is_empty() {
        payload["tools"] = Value::Array(definitions.to_vec());
    }
    if let Some(max_tokens) = config.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = config.temperature {
        payload["temperature"] = json!(temperature);
    }
    payload
}

fn openai_tool_call(call: &PendingCall) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {"name": call.name, "arguments": call.arguments},
    })
}

async fn stream_round(
    socket: &mut LmxSocket,
    config: &LmxConfig,
    model: &str,
    events: &mpsc::Sender<BackendEvent>,
    control: &mut mpsc::Receiver<TurnControl>,
) -> Result<Round, BackendError> {
    let mut request_id: Option<String> = None;
    let mut calls: BTreeMap<usize, PendingCall> = BTreeMap::new();
    let mut text = String::new();
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            msg = control.recv() => match msg {
                Some(TurnControl::Cancel) => {
                    if cancel_sent {
                        continue;
                    }
                    cancel_sent = true;
                    let Some(id) = request_id.as_deref() else {
                        // Nothing streamed yet; dropping the socket cancels server-side.
                        return Ok(Round::cancelled());
                    };
                    let frame = json!({"type": "chat.cancel", "request_id": id});
                    if socket.send(Message::text(frame.to_string())).await.is_err() {
                        return Ok(Round::cancelled());
                    }
                }
                Some(other) => {
                    debug!(component = "lmx", event = "lmx.control.ignored", control = ?other);
                }
                None => return Ok(Round::cancelled()),
            },
            frame = tokio::time::timeout(config.idle_timeout, socket.next()) => {
                let message = match frame {
                    Err(_) if cancel_sent => return Ok(Round::cancelled()),
                    Err(_) => {
                        return Err(BackendError::Timeout(config.idle_timeout.as_millis() as u64));
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) if cancel_sent => {
                        return Ok(Round::cancelled());
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                        return Err(BackendError::StreamClosed("LMX closed the stream".into()));
                    }
                    Ok(Some(Err(error))) if cancel_sent => {
                        debug!(component = "lmx", event = "lmx.stream.error_after_cancel", error = %error);
                        return Ok(Round::cancelled());
                    }
                    Ok(Some(Err(error))) => return Err(BackendError::StreamClosed(error.to_string())),
                    Ok(Some(Ok(Message::Text(body)))) => body,
                    Ok(Some(Ok(_))) => continue,
                };

                let frame: InboundFrame = match serde_json::from_str(message.as_str()) {
                    Ok(frame) => frame,
                    Err(error) => {
                        debug!(
                            component = "lmx",
                            event = "lmx.frame.unrecognized",
                            error = %error,
                        );
                        continue;
                    }
                };

                match frame {
                    InboundFrame::Token { request_id: id, content } => {
                        remember(&mut request_id, id);
                        if cancel_sent || content.is_empty() {
                            continue;
                        }
                        text.push_str(&content);
                        if events.send(BackendEvent::Token(content)).await.is_err() {
                            return Ok(Round::cancelled());
                        }
                    }
                    InboundFrame::ToolCall { request_id: id, tool_call } => {
                        remember(&mut request_id, id);
                        let entry = calls.entry(tool_call.index).or_default();
                        if let Some(call_id) = tool_call.id.filter(|s| !s.is_empty()) {
                            entry.id = call_id;
                        }
                        if let Some(name) = tool_call.name.filter(|s| !s.is_empty()) {
                            entry.name = name;
                        }
                        if let Some(arguments) = tool_call.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                    InboundFrame::Done { request_id: id, finish_reason, content, usage } => {
                        remember(&mut request_id, id);
                        if let Some(usage) = usage {
                            let _ = events
                                .send(BackendEvent::Usage {
                                    prompt_tokens: usage.prompt_tokens,
                                    completion_tokens: usage.completion_tokens,
                                })
                                .await;
                        }
                        let cancelled = cancel_sent || finish_reason.as_deref() == Some("cancelled");
                        if cancelled {
                            return Ok(Round::cancelled());
                        }
                        if text.is_empty() {
                            if let Some(content) = content.filter(|c| !c.is_empty()) {
                                let _ = events.send(BackendEvent::Token(content.clone())).await;
                                text = content;
                            }
                        }
                        return Ok(Round {
                            text,
                            calls: finalize_calls(calls),
                            cancelled: false,
                        });
                    }
                    InboundFrame::Error { error, .. } => {
                        if cancel_sent {
                            return Ok(Round::cancelled());
                        }
                        return Err(BackendError::from_message(model, &error));
                    }
                }
            }
        }
    }
}

fn remember(slot: &mut Option<String>, id: Option<String>) {
    if slot.is_none() {
        *slot = id;
    }
}

fn finalize_calls(calls: BTreeMap<usize, PendingCall>) -> Vec<PendingCall> {
    calls
        .into_iter()
        .map(|(index, mut call)| {
            if call.id.is_empty() {
                call.id = format!("call_{index}");
            }
            call
        })
        .filter(|call| !call.name.is_empty())
        .collect()
}

async fn await_decision(control: &mut mpsc::Receiver<TurnControl>, call_id: &str) -> Decision {
    loop {
        match control.recv().await {
            Some(TurnControl::Approve { call_id: id }) if id == call_id => return Decision::Approved,
            Some(TurnControl::Deny { call_id: id, reason }) if id == call_id => {
                return Decision::Denied(reason)
            }
            Some(TurnControl::Cancel) | None => return Decision::Cancelled,
            Some(_) => continue,
        }
    }
}

async fn execute_tool(
    tools: &dyn ToolExecutor,
    call: ToolCall,
    events: &mpsc::Sender<BackendEvent>,
) -> String {
    let call_id = call.call_id.clone();
    let outcome = tools.execute(call).await;
    let text = match &outcome {
        ToolOutcome::Success(output) => output.clone(),
        ToolOutcome::Failure(error) => format!("error: {error}"),
    };
    let _ = events
        .send(BackendEvent::ToolFinished { call_id, outcome })
        .await;
    text
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use opta_connector_core::{turn_channels, TurnBackend};
    use opta_protocol::TurnMode;
    use tokio::net::TcpListener;

    use super::*;
    use crate::LmxBackend;

    type ServerSocket = WebSocketStream<TcpStream>;

    async fn fake_lmx<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(socket).await;
        });
        format!("ws://{addr}/v1/chat/stream")
    }

    async fn next_json(socket: &mut ServerSocket) -> Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("client went away: {:?}", other),
            }
        }
    }

    async fn send_json(socket: &mut ServerSocket, value: Value) {
        socket.send(Message::text(value.to_string())).await.unwrap();
    }

    fn backend(ws_url: String) -> LmxBackend {
        LmxBackend::new(LmxConfig {
            ws_url,
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(2),
            ..LmxConfig::default()
        })
    }

    fn request() -> TurnRequest {
        TurnRequest {
            session_id: "s-1".into(),
            turn_id: "t-1".into(),
            model: "qwen".into(),
            content: "hi".into(),
            mode: TurnMode::Chat,
            metadata: None,
            history: Vec::new(),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<BackendEvent>) -> BackendEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn streams_tokens_and_usage_then_completes() {
        let url = fake_lmx(|mut socket| async move {
            let request = next_json(&mut socket).await;
            assert_eq!(request["type"], "chat.request");
            assert_eq!(request["model"], "qwen");
            assert_eq!(request["messages"][0]["content"], "hi");
            for token in ["Hel", "lo"] {
                send_json(&mut socket, json!({"type":"chat.token","request_id":"r1","content":token})).await;
            }
            send_json(
                &mut socket,
                json!({"type":"chat.done","request_id":"r1","finish_reason":"stop",
                       "usage":{"prompt_tokens":3,"completion_tokens":2}}),
            )
            .await;
        })
        .await;

        let mut handle = backend(url).start_turn(request());
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Token(t) if t == "Hel"));
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Token(t) if t == "lo"));
        assert!(matches!(
            next_event(&mut handle.events).await,
            BackendEvent::Usage { prompt_tokens: 3, completion_tokens: 2 }
        ));
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Completed));
    }

    #[tokio::test]
    async fn unloaded_model_maps_to_no_model_loaded() {
        let url = fake_lmx(|mut socket| async move {
            let _ = next_json(&mut socket).await;
            send_json(
                &mut socket,
                json!({"type":"chat.error","request_id":"r1","error":"Model 'qwen' is not loaded"}),
            )
            .await;
        })
        .await;

        let mut handle = backend(url).start_turn(request());
        match next_event(&mut handle.events).await {
            BackendEvent::Failed(BackendError::NoModelLoaded(model)) => assert_eq!(model, "qwen"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_connection_maps_to_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut handle = backend(format!("ws://{addr}/v1/chat/stream")).start_turn(request());
        match next_event(&mut handle.events).await {
            BackendEvent::Failed(error) => assert_eq!(
                error.code(),
                opta_protocol::TurnErrorCode::LmxConnectionRefused
            ),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_stream_mid_turn_maps_to_ws_closed() {
        let url = fake_lmx(|mut socket| async move {
            let _ = next_json(&mut socket).await;
            send_json(&mut socket, json!({"type":"chat.token","request_id":"r1","content":"par"})).await;
            let _ = socket.close(None).await;
        })
        .await;

        let mut handle = backend(url).start_turn(request());
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Token(_)));
        match next_event(&mut handle.events).await {
            BackendEvent::Failed(BackendError::StreamClosed(_)) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_sends_chat_cancel_and_acknowledges() {
        let url = fake_lmx(|mut socket| async move {
            let _ = next_json(&mut socket).await;
            send_json(&mut socket, json!({"type":"chat.token","request_id":"r9","content":"a"})).await;
            let cancel = next_json(&mut socket).await;
            assert_eq!(cancel["type"], "chat.cancel");
            assert_eq!(cancel["request_id"], "r9");
            send_json(
                &mut socket,
                json!({"type":"chat.done","request_id":"r9","finish_reason":"cancelled",
                       "usage":{"prompt_tokens":0,"completion_tokens":0}}),
            )
            .await;
        })
        .await;

        let mut handle = backend(url).start_turn(request());
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Token(_)));
        handle.control.send(TurnControl::Cancel).await.unwrap();

        loop {
            match next_event(&mut handle.events).await {
                BackendEvent::Usage { .. } => continue,
                BackendEvent::Cancelled => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn tool_calls_wait_for_approval_and_feed_results_back() {
        let url = fake_lmx(|mut socket| async move {
            let _ = next_json(&mut socket).await;
            send_json(
                &mut socket,
                json!({"type":"chat.tool_call","request_id":"r1",
                       "tool_call":{"index":0,"id":"call_a","name":"read_file","arguments":"{\"path\":"}}),
            )
            .await;
            send_json(
                &mut socket,
                json!({"type":"chat.tool_call","request_id":"r1",
                       "tool_call":{"index":0,"arguments":"\"a.txt\"}"}}),
            )
            .await;
            send_json(&mut socket, json!({"type":"chat.done","request_id":"r1","finish_reason":"tool_calls"})).await;

            let follow_up = next_json(&mut socket).await;
            let messages = follow_up["messages"].as_array().unwrap();
            let tool_message = messages.last().unwrap();
            assert_eq!(tool_message["role"], "tool");
            assert_eq!(tool_message["tool_call_id"], "call_a");

            send_json(&mut socket, json!({"type":"chat.token","request_id":"r2","content":"done"})).await;
            send_json(&mut socket, json!({"type":"chat.done","request_id":"r2","finish_reason":"stop"})).await;
        })
        .await;

        let mut handle = backend(url).start_turn(request());
        match next_event(&mut handle.events).await {
            BackendEvent::ToolCall(call) => {
                assert_eq!(call.call_id, "call_a");
                assert_eq!(call.arguments, json!({"path": "a.txt"}));
                assert!(call.requires_approval);
                handle
                    .control
                    .send(TurnControl::Approve { call_id: call.call_id })
                    .await
                    .unwrap();
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            next_event(&mut handle.events).await,
            BackendEvent::ToolFinished { outcome: ToolOutcome::Failure(_), .. }
        ));
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Token(t) if t == "done"));
        assert!(matches!(next_event(&mut handle.events).await, BackendEvent::Completed));
    }

    #[test]
    fn finalize_assigns_missing_ids_and_drops_nameless_calls() {
        let mut calls = BTreeMap::new();
        calls.insert(
            1,
            PendingCall {
                id: String::new(),
                name: "grep".into(),
                arguments: "{}".into(),
            },
        );
        calls.insert(2, PendingCall::default());
        let calls = finalize_calls(calls);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
    }

    #[test]
    fn turn_channels_pair_up() {
        let (handle, channels) = turn_channels();
        assert!(!handle.control.is_closed());
        drop(channels);
        assert!(handle.control.is_closed());
    }
}
