//! One-shot HTTP surface.
//!
//! Mirrors what the WebSocket offers for clients that cannot hold a
//! connection open. Every failure is a structured `{code, message, details?}`
//! body; request bodies are decoded strictly so unknown fields are rejected
//! before any state is touched.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use opta_protocol::{
    new_prefixed_id, BackgroundProcessInfo, ClientFrame, ContractDescriptor, ErrorBody,
    HealthReport, Metadata, OperationErrorCode, OperationInfo, OperationRequest,
    OperationResponse, OutputSlice, PermissionDecision, ProtocolViolation, SessionInfo,
    SessionSnapshot, StreamFilter, TurnMode,
};

use crate::background::{StartRequest, SupervisorError};
use crate::clock::now_ms;
use crate::session::{EventPage, SessionSeed};
use crate::session_actor::SessionActorHandle;
use crate::session_command::{SessionCommand, SubmitAck};
use crate::state::AppState;
use crate::transition::{CancelTarget, EngineError, PendingTurn};
use crate::websocket::ws_handler;
use crate::VERSION;

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;
const DEFAULT_OUTPUT_LIMIT: usize = 200;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/events", get(read_events))
        .route("/sessions/{id}/turns", post(submit_turn))
        .route("/sessions/{id}/cancel", post(cancel_turn))
        .route(
            "/sessions/{id}/permissions/{request_id}",
            post(resolve_permission),
        )
        .route("/sessions/{id}/background", post(start_background))
        .route("/background", get(list_background))
        .route("/background/{id}", get(get_background))
        .route("/background/{id}/kill", post(kill_background))
        .route("/background/{id}/restart", post(restart_background))
        .route("/background/{id}/output", get(read_output))
        .route("/operations", get(list_operations))
        .route("/operations/{id}", post(execute_operation))
}

// -- Errors -------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::new(code, message),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ProtocolViolation::CODE, message)
    }

    fn session_not_found(session_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "session-not-found",
            format!("session `{session_id}` does not exist"),
        )
    }

    fn session_unavailable(session_id: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "session-unavailable",
            format!("session `{session_id}` stopped"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ProtocolViolation> for ApiError {
    fn from(violation: ProtocolViolation) -> Self {
        Self::invalid(violation.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err.code() {
            "permission-already-resolved" | "permission-already-open" => StatusCode::CONFLICT,
            _ => StatusCode::NOT_FOUND,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::NotRunning(_) | SupervisorError::StillRunning(_) => {
                StatusCode::CONFLICT
            }
            SupervisorError::InvalidSignal(_) => StatusCode::BAD_REQUEST,
            SupervisorError::Signal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Strict body decode. An empty body decodes as `{}`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        &b"{}"[..]
    } else {
        &body[..]
    };
    serde_json::from_slice(raw).map_err(|e| ApiError::invalid(format!("invalid body: {e}")))
}

fn live_session(state: &AppState, session_id: &str) -> ApiResult<SessionActorHandle> {
    state
        .registry
        .get(session_id)
        .ok_or_else(|| ApiError::session_not_found(session_id))
}

// -- Health -------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok".to_string(),
        daemon_id: state.daemon_id().to_string(),
        version: VERSION.to_string(),
        contract: Some(ContractDescriptor::current()),
        uptime_ms: state.uptime_ms(),
        sessions: state.registry.len(),
        background_running: state.supervisor.running_count(),
        backend: Some(state.registry.backend_name().to_string()),
    })
}

// -- Sessions -----------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateSession {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let request: CreateSession = parse_body(&body)?;
    let session_id = request
        .session_id
        .unwrap_or_else(|| new_prefixed_id("ses"));
    // Same id rules as `hello`.
    ClientFrame::Hello {
        client_id: "http".to_string(),
        session_id: session_id.clone(),
        after_seq: None,
        model: None,
        title: None,
    }
    .validate()?;

    let (actor, created) = state.registry.get_or_create(SessionSeed {
        session_id,
        model: request.model,
        title: request.title,
    });
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json((*actor.info()).clone())))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(
        state
            .registry
            .list()
            .into_iter()
            .map(|info| (*info).clone())
            .collect(),
    )
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionSnapshot>> {
    let actor = live_session(&state, &session_id)?;
    actor
        .request(|reply| SessionCommand::GetSnapshot { reply })
        .await
        .map(Json)
        .ok_or_else(|| ApiError::session_unavailable(&session_id))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    #[serde(default)]
    after_seq: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    client_id: Option<String>,
}

async fn read_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<EventPage>> {
    let actor = live_session(&state, &session_id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    actor
        .request(|reply| SessionCommand::ReadEvents {
            after_seq: query.after_seq.unwrap_or(0),
            limit,
            client_id: query.client_id,
            reply,
        })
        .await
        .map(Json)
        .ok_or_else(|| ApiError::session_unavailable(&session_id))
}

// -- Turns --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubmitTurn {
    client_id: String,
    writer_id: String,
    content: String,
    #[serde(default)]
    mode: TurnMode,
    #[serde(default)]
    metadata: Option<Metadata>,
}

async fn submit_turn(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SubmitAck>)> {
    let request: SubmitTurn = parse_body(&body)?;
    let frame = ClientFrame::TurnSubmit {
        client_id: request.client_id,
        writer_id: request.writer_id,
        session_id: session_id.clone(),
        content: request.content,
        mode: request.mode,
        metadata: request.metadata,
    };
    frame.validate()?;
    let ClientFrame::TurnSubmit {
        client_id,
        writer_id,
        content,
        mode,
        metadata,
        ..
    } = frame
    else {
        return Err(ApiError::invalid("turn.submit expected"));
    };

    let actor = live_session(&state, &session_id)?;
    let turn = Box::new(PendingTurn {
        turn_id: new_prefixed_id("turn"),
        writer_id,
        client_id,
        mode,
        content,
        metadata,
        queued_at: now_ms(),
    });
    let ack = actor
        .request(|reply| SessionCommand::Submit { turn, reply })
        .await
        .ok_or_else(|| ApiError::session_unavailable(&session_id))?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CancelTurn {
    #[serde(default)]
    turn_id: Option<String>,
    #[serde(default)]
    writer_id: Option<String>,
}

async fn cancel_turn(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let request: CancelTurn = parse_body(&body)?;
    ClientFrame::TurnCancel {
        session_id: session_id.clone(),
        turn_id: request.turn_id.clone(),
        writer_id: request.writer_id.clone(),
    }
    .validate()?;
    let target = match (request.turn_id, request.writer_id) {
        (Some(turn_id), _) => CancelTarget::Turn(turn_id),
        (None, Some(writer_id)) => CancelTarget::Writer(writer_id),
        (None, None) => return Err(ApiError::invalid("turnId or writerId is required")),
    };
    let actor = live_session(&state, &session_id)?;
    actor
        .request(|reply| SessionCommand::Cancel { target, reply })
        .await
        .ok_or_else(|| ApiError::session_unavailable(&session_id))??;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResolvePermission {
    decision: PermissionDecision,
    decided_by: String,
}

async fn resolve_permission(
    State(state): State<Arc<AppState>>,
    Path((session_id, request_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let request: ResolvePermission = parse_body(&body)?;
    ClientFrame::PermissionResolve {
        session_id: session_id.clone(),
        request_id: request_id.clone(),
        decision: request.decision,
        decided_by: request.decided_by.clone(),
    }
    .validate()?;

    let actor = live_session(&state, &session_id)?;
    actor
        .request(|reply| SessionCommand::ResolvePermission {
            request_id,
            decision: request.decision,
            decided_by: request.decided_by,
            reply,
        })
        .await
        .ok_or_else(|| ApiError::session_unavailable(&session_id))??;
    Ok(StatusCode::NO_CONTENT)
}

// -- Background processes -----------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StartBackground {
    command: String,
    cwd: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    label: Option<String>,
}

async fn start_background(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<BackgroundProcessInfo>)> {
    let request: StartBackground = parse_body(&body)?;
    ClientFrame::BackgroundStart {
        session_id: session_id.clone(),
        command: request.command.clone(),
        cwd: request.cwd.clone(),
        timeout_ms: request.timeout_ms,
        label: request.label.clone(),
    }
    .validate()?;
    live_session(&state, &session_id)?;

    let info = state
        .supervisor
        .start(StartRequest {
            session_id,
            command: request.command,
            cwd: request.cwd,
            timeout_ms: request.timeout_ms,
            label: request.label,
        })
        .await;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackgroundQuery {
    #[serde(default)]
    session_id: Option<String>,
}

async fn list_background(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BackgroundQuery>,
) -> Json<Vec<BackgroundProcessInfo>> {
    Json(state.supervisor.list(query.session_id.as_deref()))
}

async fn get_background(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
) -> ApiResult<Json<BackgroundProcessInfo>> {
    state
        .supervisor
        .get(&process_id)
        .map(Json)
        .ok_or_else(|| SupervisorError::NotFound(process_id).into())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct KillBackground {
    #[serde(default)]
    signal: Option<String>,
}

async fn kill_background(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<BackgroundProcessInfo>)> {
    let request: KillBackground = parse_body(&body)?;
    let info = state
        .supervisor
        .kill(&process_id, request.signal.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(info)))
}

async fn restart_background(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
) -> ApiResult<(StatusCode, Json<BackgroundProcessInfo>)> {
    let info = state.supervisor.restart(&process_id).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputQuery {
    #[serde(default)]
    after_seq: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    stream: StreamFilter,
    #[serde(default)]
    reader: Option<String>,
}

async fn read_output(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<Json<OutputSlice>> {
    let slice = state.supervisor.read_output(
        &process_id,
        query.after_seq.unwrap_or(0),
        query.limit.unwrap_or(DEFAULT_OUTPUT_LIMIT),
        query.stream,
        query.reader.as_deref(),
    )?;
    Ok(Json(slice))
}

// -- Operations ---------------------------------------------------------------

async fn list_operations(State(state): State<Arc<AppState>>) -> Json<Vec<OperationInfo>> {
    Json(state.operations.catalog())
}

fn operation_status(response: &OperationResponse) -> StatusCode {
    let Some(code) = response.error_code() else {
        return StatusCode::OK;
    };
    let status = [
        (OperationErrorCode::UnknownOperation, StatusCode::NOT_FOUND),
        (OperationErrorCode::InvalidInput, StatusCode::BAD_REQUEST),
        (
            OperationErrorCode::ConfirmationRequired,
            StatusCode::PRECONDITION_REQUIRED,
        ),
        (OperationErrorCode::NotFound, StatusCode::NOT_FOUND),
        (OperationErrorCode::Conflict, StatusCode::CONFLICT),
        (OperationErrorCode::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
        (OperationErrorCode::StorageFull, StatusCode::INSUFFICIENT_STORAGE),
    ]
    .into_iter()
    .find(|(known, _)| known.as_str() == code)
    .map(|(_, status)| status);
    status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn execute_operation(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<String>,
    body: Bytes,
) -> Response {
    let request: OperationRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                component = "http_api",
                event = "operation.body_rejected",
                operation_id = %operation_id,
                error = %e.body.message,
            );
            let response = OperationResponse::failure(ErrorBody::new(
                OperationErrorCode::InvalidInput.as_str(),
                e.body.message,
            ));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };
    let response = state.operations.execute(&operation_id, request).await;
    (operation_status(&response), Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::operations::tests::harness;

    fn body(value: serde_json::Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    #[tokio::test]
    async fn health_advertises_contract() {
        let h = harness();
        let state = h.app_state();
        let Json(report) = health(State(state)).await;
        assert_eq!(report.status, "ok");
        assert_eq!(report.daemon_id, "d-test");
        assert!(opta_protocol::ContractGate::default().verify(&report).is_ok());
    }

    #[tokio::test]
    async fn create_is_idempotent_and_rejects_unknown_fields() {
        let h = harness();
        let state = h.app_state();

        let (status, Json(info)) = create_session(
            State(state.clone()),
            body(serde_json::json!({"sessionId": "s-1", "title": "demo"})),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(info.session_id, "s-1");
        assert_eq!(info.title.as_deref(), Some("demo"));

        let (status, _) = create_session(
            State(state.clone()),
            body(serde_json::json!({"sessionId": "s-1"})),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);

        let err = create_session(
            State(state.clone()),
            body(serde_json::json!({"sessionId": "s-2", "owner": "x"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.code, "protocol-violation");

        let (status, Json(generated)) = create_session(State(state.clone()), Bytes::new())
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(generated.session_id.starts_with("ses-"));

        let Json(listed) = list_sessions(State(state)).await;
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn submit_then_poll_events() {
        let h = harness();
        let state = h.app_state();
        create_session(
            State(state.clone()),
            body(serde_json::json!({"sessionId": "s-1"})),
        )
        .await
        .unwrap();

        let (status, Json(ack)) = submit_turn(
            State(state.clone()),
            Path("s-1".to_string()),
            body(serde_json::json!({"clientId": "c", "writerId": "w", "content": "ping"})),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(ack.position, 0);

        // Poll until the turn finishes.
        let mut seen = Vec::new();
        let mut after_seq = 0;
        for _ in 0..100 {
            let Json(page) = read_events(
                State(state.clone()),
                Path("s-1".to_string()),
                Query(EventsQuery {
                    after_seq: Some(after_seq),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
            assert!(page.snapshot.is_none());
            for envelope in &page.events {
                assert_eq!(envelope.seq, after_seq + 1);
                after_seq = envelope.seq;
                seen.push(envelope.event.name());
            }
            if seen.contains(&"turn.done") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.first(), Some(&"turn.start"));
        assert_eq!(seen.last(), Some(&"turn.done"));
    }

    #[tokio::test]
    async fn session_routes_report_missing_sessions() {
        let h = harness();
        let state = h.app_state();

        let err = get_session(State(state.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.body.code, "session-not-found");

        let err = submit_turn(
            State(state.clone()),
            Path("nope".to_string()),
            body(serde_json::json!({"clientId": "c", "writerId": "w", "content": "hi"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.body.code, "session-not-found");

        // Validation runs before the session lookup.
        let err = submit_turn(
            State(state),
            Path("nope".to_string()),
            body(serde_json::json!({"clientId": "c", "writerId": "w", "content": "  "})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.body.code, "protocol-violation");
    }

    #[tokio::test]
    async fn cancel_and_permission_errors_map_to_statuses() {
        let h = harness();
        let state = h.app_state();
        create_session(
            State(state.clone()),
            body(serde_json::json!({"sessionId": "s-1"})),
        )
        .await
        .unwrap();

        let err = cancel_turn(State(state.clone()), Path("s-1".to_string()), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = cancel_turn(
            State(state.clone()),
            Path("s-1".to_string()),
            body(serde_json::json!({"turnId": "turn-x"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.body.code, "turn-not-found");

        let err = resolve_permission(
            State(state),
            Path(("s-1".to_string(), "perm-x".to_string())),
            body(serde_json::json!({"decision": "allow", "decidedBy": "ada"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.body.code, "permission-not-found");
    }

    #[tokio::test]
    async fn background_lifecycle_over_http() {
        let h = harness();
        let state = h.app_state();
        create_session(
            State(state.clone()),
            body(serde_json::json!({"sessionId": "s-1"})),
        )
        .await
        .unwrap();

        let (status, Json(started)) = start_background(
            State(state.clone()),
            Path("s-1".to_string()),
            body(serde_json::json!({
                "command": "printf 'a\\nb\\n'",
                "cwd": std::env::temp_dir().display().to_string(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let id = started.process_id.clone();

        let mut finished = None;
        for _ in 0..250 {
            let Json(info) = get_background(State(state.clone()), Path(id.clone()))
                .await
                .unwrap();
            if info.state.is_terminal() {
                finished = Some(info);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let finished = finished.expect("process did not finish");
        assert_eq!(finished.exit_code, Some(0));

        let Json(slice) = read_output(
            State(state.clone()),
            Path(id.clone()),
            Query(OutputQuery::default()),
        )
        .await
        .unwrap();
        let text: Vec<&str> = slice.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, vec!["a\n", "b\n"]);
        assert!(!slice.has_more);

        let err = kill_background(State(state.clone()), Path(id.clone()), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let (status, Json(restarted)) = restart_background(State(state.clone()), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(restarted.restarted_from.as_deref(), Some(id.as_str()));

        let Json(listed) = list_background(
            State(state.clone()),
            Query(BackgroundQuery {
                session_id: Some("s-1".into()),
            }),
        )
        .await;
        assert_eq!(listed.len(), 2);

        let err = get_background(State(state), Path("bg-none".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.body.code, "process-not-found");
    }

    #[tokio::test]
    async fn operation_status_codes_follow_error_codes() {
        let h = harness();
        let state = h.app_state();

        let response = execute_operation(
            State(state.clone()),
            Path("daemon.stop".to_string()),
            Bytes::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_REQUIRED);
        assert!(!*h.shutdown_rx.borrow());

        let response = execute_operation(
            State(state.clone()),
            Path("config.list".to_string()),
            body(serde_json::json!({"input": {}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = execute_operation(
            State(state.clone()),
            Path("no.such.op".to_string()),
            Bytes::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = execute_operation(
            State(state),
            Path("config.list".to_string()),
            body(serde_json::json!({"input": {}, "confirm": true})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
