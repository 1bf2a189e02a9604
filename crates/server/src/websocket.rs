//! WebSocket handling

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use opta_protocol::{
    decode_client_frame, new_prefixed_id, ClientFrame, Envelope, ErrorBody, ProtocolViolation,
};

use crate::background::StartRequest;
use crate::clock::now_ms;
use crate::envelope::error_frame;
use crate::session::SessionSeed;
use crate::session_actor::SessionActorHandle;
use crate::session_command::{AttachFrames, SessionCommand};
use crate::state::AppState;
use crate::transition::{CancelTarget, PendingTurn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// Envelope, serialized by the send task
    Json(Arc<Envelope>),
    /// Raw pong response
    Pong(Bytes),
}

/// One `hello` on this connection.
struct Attached {
    client_id: String,
    actor: SessionActorHandle,
    forwarder: JoinHandle<()>,
}

/// Per-socket state: which sessions this connection is attached to.
struct Connection {
    id: u64,
    attached: HashMap<String, Attached>,
}

impl Connection {
    fn new(id: u64) -> Self {
        Self {
            id,
            attached: HashMap::new(),
        }
    }

    async fn detach(&mut self, session_id: &str) {
        if let Some(previous) = self.attached.remove(session_id) {
            previous.forwarder.abort();
            previous
                .actor
                .send(SessionCommand::Detach {
                    client_id: previous.client_id,
                })
                .await;
        }
    }

    async fn close(&mut self) {
        let ids: Vec<String> = self.attached.keys().cloned().collect();
        for id in ids {
            self.detach(&id).await;
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(envelope) => match envelope.to_json() {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            kind = envelope.event.name(),
                            error = %e,
                            "Failed to serialize envelope"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut conn = Connection::new(conn_id);

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        // Keep this future on the heap so debug builds don't blow worker stack.
        Box::pin(handle_text(msg.as_str(), &outbound_tx, &state, &mut conn)).await;
    }

    conn.close().await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Decode one inbound text frame and dispatch it. Frames that fail decoding
/// are answered with a `protocol-violation` error and change nothing.
async fn handle_text(
    text: &str,
    tx: &mpsc::Sender<OutboundMessage>,
    state: &Arc<AppState>,
    conn: &mut Connection,
) {
    match decode_client_frame(text) {
        Ok(frame) => handle_client_message(frame, tx, state, conn).await,
        Err(violation) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id = conn.id,
                error = %violation,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, 240),
                "Rejected client frame"
            );
            send_error(
                tx,
                state,
                None,
                ErrorBody::new(ProtocolViolation::CODE, violation.to_string()),
            )
            .await;
        }
    }
}

async fn send_envelope(tx: &mpsc::Sender<OutboundMessage>, envelope: Arc<Envelope>) -> bool {
    tx.send(OutboundMessage::Json(envelope)).await.is_ok()
}

/// Connection-scoped error; carries seq 0.
async fn send_error(
    tx: &mpsc::Sender<OutboundMessage>,
    state: &AppState,
    session_id: Option<&str>,
    error: ErrorBody,
) {
    let frame = error_frame(state.daemon_id(), session_id, error, now_ms());
    send_envelope(tx, Arc::new(frame)).await;
}

/// Queue the replay or snapshot an attach produced. Returns false once the
/// socket is gone.
async fn send_frames(tx: &mpsc::Sender<OutboundMessage>, frames: AttachFrames) -> bool {
    match frames {
        AttachFrames::Replay(events) => {
            for envelope in events {
                if !send_envelope(tx, envelope).await {
                    return false;
                }
            }
            true
        }
        AttachFrames::Snapshot(frame) => send_envelope(tx, Arc::new(*frame)).await,
    }
}

/// Forward live envelopes for one attached client. Anything at or below the
/// client's cursor was already delivered by replay and is skipped. A lagging
/// receiver resyncs through the actor instead of dropping events silently.
fn spawn_session_forwarder(
    actor: SessionActorHandle,
    client_id: String,
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    mut cursor: Arc<AtomicU64>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let seq = envelope.seq;
                    if seq <= cursor.load(Ordering::Relaxed) {
                        continue;
                    }
                    if !send_envelope(&outbound_tx, envelope).await {
                        break;
                    }
                    cursor.fetch_max(seq, Ordering::Relaxed);
                }
                Err(RecvError::Lagged(n)) => {
                    let after_seq = cursor.load(Ordering::Relaxed);
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        session_id = %actor.id,
                        client_id = %client_id,
                        skipped = n,
                        after_seq = after_seq,
                        "Broadcast subscriber lagged, resyncing"
                    );
                    let Some(resynced) = actor
                        .request(|reply| SessionCommand::Resync {
                            client_id: client_id.clone(),
                            after_seq,
                            reply,
                        })
                        .await
                    else {
                        break;
                    };
                    if !send_frames(&outbound_tx, resynced.frames).await {
                        break;
                    }
                    resynced.cursor.fetch_max(resynced.last_seq, Ordering::Relaxed);
                    rx = resynced.rx;
                    cursor = resynced.cursor;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn session_not_found(session_id: &str) -> ErrorBody {
    ErrorBody::new(
        "session-not-found",
        format!("session `{session_id}` does not exist; send hello first"),
    )
}

async fn handle_client_message(
    frame: ClientFrame,
    tx: &mpsc::Sender<OutboundMessage>,
    state: &Arc<AppState>,
    conn: &mut Connection,
) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = conn.id,
        kind = frame.kind(),
    );

    match frame {
        ClientFrame::Hello {
            client_id,
            session_id,
            after_seq,
            model,
            title,
        } => {
            conn.detach(&session_id).await;

            let (actor, created) = state.registry.get_or_create(SessionSeed {
                session_id: session_id.clone(),
                model,
                title,
            });
            let Some(attachment) = actor
                .request(|reply| SessionCommand::Attach {
                    client_id: client_id.clone(),
                    after_seq,
                    reply,
                })
                .await
            else {
                send_error(
                    tx,
                    state,
                    Some(&session_id),
                    ErrorBody::new("session-unavailable", "session actor stopped"),
                )
                .await;
                return;
            };

            let replayed = match &attachment.frames {
                AttachFrames::Replay(events) => Some(events.len()),
                AttachFrames::Snapshot(_) => None,
            };
            info!(
                component = "websocket",
                event = "ws.session.attached",
                connection_id = conn.id,
                session_id = %session_id,
                client_id = %client_id,
                created = created,
                after_seq = ?after_seq,
                replayed = ?replayed,
                last_seq = attachment.last_seq,
            );

            if !send_frames(tx, attachment.frames).await {
                return;
            }
            attachment
                .cursor
                .fetch_max(attachment.last_seq, Ordering::Relaxed);
            let forwarder = spawn_session_forwarder(
                actor.clone(),
                client_id.clone(),
                attachment.rx,
                attachment.cursor,
                tx.clone(),
            );
            conn.attached.insert(
                session_id,
                Attached {
                    client_id,
                    actor,
                    forwarder,
                },
            );
        }

        ClientFrame::TurnSubmit {
            client_id,
            writer_id,
            session_id,
            content,
            mode,
            metadata,
        } => {
            let Some(actor) = state.registry.get(&session_id) else {
                send_error(tx, state, Some(&session_id), session_not_found(&session_id)).await;
                return;
            };
            let turn = Box::new(PendingTurn {
                turn_id: new_prefixed_id("turn"),
                writer_id,
                client_id,
                mode,
                content,
                metadata,
                queued_at: now_ms(),
            });
            // The turn's own events (queued/start) carry its id back.
            if actor
                .request(|reply| SessionCommand::Submit { turn, reply })
                .await
                .is_none()
            {
                send_error(
                    tx,
                    state,
                    Some(&session_id),
                    ErrorBody::new("session-unavailable", "session actor stopped"),
                )
                .await;
            }
        }

        ClientFrame::PermissionResolve {
            session_id,
            request_id,
            decision,
            decided_by,
        } => {
            let Some(actor) = state.registry.get(&session_id) else {
                send_error(tx, state, Some(&session_id), session_not_found(&session_id)).await;
                return;
            };
            let result = actor
                .request(|reply| SessionCommand::ResolvePermission {
                    request_id,
                    decision,
                    decided_by,
                    reply,
                })
                .await;
            if let Some(Err(e)) = result {
                send_error(tx, state, Some(&session_id), ErrorBody::new(e.code(), e.to_string()))
                    .await;
            }
        }

        ClientFrame::TurnCancel {
            session_id,
            turn_id,
            writer_id,
        } => {
            let Some(actor) = state.registry.get(&session_id) else {
                send_error(tx, state, Some(&session_id), session_not_found(&session_id)).await;
                return;
            };
            let target = match (turn_id, writer_id) {
                (Some(turn_id), _) => CancelTarget::Turn(turn_id),
                (None, Some(writer_id)) => CancelTarget::Writer(writer_id),
                (None, None) => {
                    send_error(
                        tx,
                        state,
                        Some(&session_id),
                        ErrorBody::new(
                            ProtocolViolation::CODE,
                            "turn.cancel needs turnId or writerId",
                        ),
                    )
                    .await;
                    return;
                }
            };
            let result = actor
                .request(|reply| SessionCommand::Cancel { target, reply })
                .await;
            if let Some(Err(e)) = result {
                send_error(tx, state, Some(&session_id), ErrorBody::new(e.code(), e.to_string()))
                    .await;
            }
        }

        ClientFrame::BackgroundStart {
            session_id,
            command,
            cwd,
            timeout_ms,
            label,
        } => {
            if state.registry.get(&session_id).is_none() {
                send_error(tx, state, Some(&session_id), session_not_found(&session_id)).await;
                return;
            }
            // Status and output arrive on the session stream.
            state
                .supervisor
                .start(StartRequest {
                    session_id,
                    command,
                    cwd,
                    timeout_ms,
                    label,
                })
                .await;
        }

        ClientFrame::BackgroundKill { process_id, signal } => {
            let session_id = state.supervisor.get(&process_id).map(|p| p.session_id);
            if let Err(e) = state.supervisor.kill(&process_id, signal.as_deref()).await {
                send_error(
                    tx,
                    state,
                    session_id.as_deref(),
                    ErrorBody::new(e.code(), e.to_string()),
                )
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use opta_protocol::{DaemonEvent, SnapshotReason, TurnMode};

    use crate::operations::tests::harness;

    async fn recv_envelope(rx: &mut mpsc::Receiver<OutboundMessage>) -> Arc<Envelope> {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound envelope")
            .expect("outbound channel closed");
        match msg {
            OutboundMessage::Json(envelope) => envelope,
            OutboundMessage::Pong(_) => panic!("expected envelope, got pong"),
        }
    }

    async fn recv_until(rx: &mut mpsc::Receiver<OutboundMessage>, name: &str) -> Vec<Arc<Envelope>> {
        let mut out = Vec::new();
        loop {
            let envelope = recv_envelope(rx).await;
            let done = envelope.event.name() == name;
            out.push(envelope);
            if done {
                return out;
            }
        }
    }

    fn hello(session_id: &str, after_seq: Option<u64>) -> ClientFrame {
        ClientFrame::Hello {
            client_id: "cli-1".into(),
            session_id: session_id.into(),
            after_seq,
            model: None,
            title: None,
        }
    }

    fn submit(session_id: &str, content: &str) -> ClientFrame {
        ClientFrame::TurnSubmit {
            client_id: "cli-1".into(),
            writer_id: "w-1".into(),
            session_id: session_id.into(),
            content: content.into(),
            mode: TurnMode::Chat,
            metadata: None,
        }
    }

    fn error_code(envelope: &Envelope) -> &str {
        match &envelope.event {
            DaemonEvent::Error(body) => &body.code,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn hello_sends_initial_snapshot_then_live_turn() {
        let h = harness();
        let state = h.app_state();
        let (tx, mut rx) = mpsc::channel(64);
        let mut conn = Connection::new(1);

        handle_client_message(hello("s-1", None), &tx, &state, &mut conn).await;
        let first = recv_envelope(&mut rx).await;
        match &first.event {
            DaemonEvent::SessionSnapshot { reason, .. } => {
                assert_eq!(*reason, SnapshotReason::Initial)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(first.seq, 0);

        handle_client_message(submit("s-1", "hello there"), &tx, &state, &mut conn).await;
        let events = recv_until(&mut rx, "turn.done").await;
        assert_eq!(events[0].event.name(), "turn.start");
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
        assert_eq!(seqs, expected);

        conn.close().await;
    }

    #[tokio::test]
    async fn reconnect_after_seq_replays_exactly_the_missed_events() {
        let h = harness();
        let state = h.app_state();

        let (tx, mut rx) = mpsc::channel(64);
        let mut first = Connection::new(1);
        handle_client_message(hello("s-1", None), &tx, &state, &mut first).await;
        recv_envelope(&mut rx).await;
        handle_client_message(submit("s-1", "one two three"), &tx, &state, &mut first).await;
        let live = recv_until(&mut rx, "turn.done").await;
        first.close().await;

        let (tx2, mut rx2) = mpsc::channel(64);
        let mut second = Connection::new(2);
        handle_client_message(hello("s-1", Some(1)), &tx2, &state, &mut second).await;
        let replayed = recv_until(&mut rx2, "turn.done").await;
        let replayed_seqs: Vec<u64> = replayed.iter().map(|e| e.seq).collect();
        let live_seqs: Vec<u64> = live.iter().skip(1).map(|e| e.seq).collect();
        assert_eq!(replayed_seqs, live_seqs);
        assert_eq!(replayed[0].seq, 2);

        // Live forwarding continues after the replay without duplicates.
        handle_client_message(submit("s-1", "again"), &tx2, &state, &mut second).await;
        let next = recv_envelope(&mut rx2).await;
        assert_eq!(next.event.name(), "turn.start");
        assert_eq!(next.seq, live.last().unwrap().seq + 1);

        second.close().await;
    }

    #[tokio::test]
    async fn frames_for_unknown_sessions_are_rejected() {
        let h = harness();
        let state = h.app_state();
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = Connection::new(1);

        handle_client_message(submit("s-none", "hi"), &tx, &state, &mut conn).await;
        let envelope = recv_envelope(&mut rx).await;
        assert_eq!(error_code(&envelope), "session-not-found");
        assert_eq!(envelope.seq, 0);
        assert_eq!(envelope.session_id.as_deref(), Some("s-none"));
        assert!(state.registry.get("s-none").is_none());
    }

    #[tokio::test]
    async fn malformed_frames_are_protocol_violations() {
        let h = harness();
        let state = h.app_state();
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = Connection::new(1);

        handle_text("{not json", &tx, &state, &mut conn).await;
        assert_eq!(error_code(&*recv_envelope(&mut rx).await), "protocol-violation");

        handle_text(r#"{"type":"turn.steer","sessionId":"s-1"}"#, &tx, &state, &mut conn).await;
        assert_eq!(error_code(&*recv_envelope(&mut rx).await), "protocol-violation");

        handle_text(
            r#"{"type":"hello","clientId":"c","sessionId":"s-1","extra":1}"#,
            &tx,
            &state,
            &mut conn,
        )
        .await;
        assert_eq!(error_code(&*recv_envelope(&mut rx).await), "protocol-violation");
        assert_eq!(state.registry.len(), 0);
    }

    #[tokio::test]
    async fn engine_and_supervisor_errors_carry_their_codes() {
        let h = harness();
        let state = h.app_state();
        let (tx, mut rx) = mpsc::channel(16);
        let mut conn = Connection::new(1);
        handle_client_message(hello("s-1", None), &tx, &state, &mut conn).await;
        recv_envelope(&mut rx).await;

        handle_client_message(
            ClientFrame::PermissionResolve {
                session_id: "s-1".into(),
                request_id: "perm-missing".into(),
                decision: opta_protocol::PermissionDecision::Allow,
                decided_by: "ada".into(),
            },
            &tx,
            &state,
            &mut conn,
        )
        .await;
        assert_eq!(error_code(&*recv_envelope(&mut rx).await), "permission-not-found");

        handle_client_message(
            ClientFrame::TurnCancel {
                session_id: "s-1".into(),
                turn_id: Some("turn-missing".into()),
                writer_id: None,
            },
            &tx,
            &state,
            &mut conn,
        )
        .await;
        assert_eq!(error_code(&*recv_envelope(&mut rx).await), "turn-not-found");

        handle_client_message(
            ClientFrame::BackgroundKill {
                process_id: "bg-missing".into(),
                signal: None,
            },
            &tx,
            &state,
            &mut conn,
        )
        .await;
        assert_eq!(error_code(&*recv_envelope(&mut rx).await), "process-not-found");

        conn.close().await;
    }

    #[tokio::test]
    async fn background_status_arrives_on_the_session_stream() {
        let h = harness();
        let state = h.app_state();
        let (tx, mut rx) = mpsc::channel(64);
        let mut conn = Connection::new(1);
        handle_client_message(hello("s-1", None), &tx, &state, &mut conn).await;
        recv_envelope(&mut rx).await;

        handle_client_message(
            ClientFrame::BackgroundStart {
                session_id: "s-1".into(),
                command: "echo hi".into(),
                cwd: std::env::temp_dir().display().to_string(),
                timeout_ms: None,
                label: None,
            },
            &tx,
            &state,
            &mut conn,
        )
        .await;

        let events = recv_until(&mut rx, "background.status").await;
        match &events.last().unwrap().event {
            DaemonEvent::BackgroundStatus {
                previous_state, ..
            } => assert_eq!(*previous_state, None),
            other => panic!("unexpected event: {:?}", other),
        }
        let mut last = 0;
        for envelope in &events {
            assert!(envelope.seq > last);
            last = envelope.seq;
        }

        conn.close().await;
    }
}
