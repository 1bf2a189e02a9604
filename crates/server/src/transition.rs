//! Pure turn-engine state transitions
//!
//! All turn lifecycle logic lives here as a pure, synchronous function:
//! `transition(state, input, now) -> (state, effects)`.
//! No IO, no async, no locking. The session actor feeds inputs in arrival
//! order and executes the returned effects.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use opta_connector_core::{
    BackendError, BackendEvent, HistoryEntry, ToolCall, ToolOutcome, TurnControl, TurnRequest,
};
use opta_protocol::{
    DaemonEvent, Metadata, PermissionDecision, PermissionRequest, TurnErrorCode, TurnMode,
    TurnState, TurnStats, TurnSummary,
};

use crate::permission::{GateError, PermissionGate, Resolution, SYSTEM_CANCEL, SYSTEM_TURN_ENDED};
use crate::persistence::ArchivedTurn;

const HISTORY_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Turn records
// ---------------------------------------------------------------------------

/// A submitted turn that has not started yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub turn_id: String,
    pub writer_id: String,
    pub client_id: String,
    pub mode: TurnMode,
    pub content: String,
    pub metadata: Option<Metadata>,
    pub queued_at: u64,
}

impl PendingTurn {
    fn summary(&self, state: TurnState, stats: Option<TurnStats>) -> TurnSummary {
        TurnSummary {
            turn_id: self.turn_id.clone(),
            writer_id: self.writer_id.clone(),
            client_id: self.client_id.clone(),
            mode: self.mode,
            state,
            queued_at: self.queued_at,
            stats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Generating,
    /// Paused on the permission gate; backend events are held.
    AwaitingPermission { request_id: String, call_id: String },
    /// Cancel sent to the backend; waiting for it to stop or the grace timer.
    Cancelling,
}

#[derive(Debug, Clone)]
pub struct ActiveTurn {
    pub turn: PendingTurn,
    pub phase: Phase,
    pub started_at: u64,
    first_token_at: Option<u64>,
    token_events: u64,
    usage: Option<(u64, u64)>,
    tool_calls: u32,
    /// call_id → tool_name for tools that started but have not ended.
    open_tools: HashMap<String, String>,
    held: VecDeque<BackendEvent>,
    output: String,
}

impl ActiveTurn {
    fn new(turn: PendingTurn, now: u64) -> Self {
        Self {
            turn,
            phase: Phase::Generating,
            started_at: now,
            first_token_at: None,
            token_events: 0,
            usage: None,
            tool_calls: 0,
            open_tools: HashMap::new(),
            held: VecDeque::new(),
            output: String::new(),
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn.turn_id
    }

    pub fn tokens(&self) -> u64 {
        match self.usage {
            Some((_, completion)) => completion.max(self.token_events),
            None => self.token_events,
        }
    }

    fn stats(&self, now: u64) -> TurnStats {
        let (prompt_tokens, completion_tokens) = self.usage.unwrap_or((0, self.token_events));
        TurnStats {
            tokens: self.tokens(),
            prompt_tokens,
            completion_tokens,
            tool_calls: self.tool_calls,
            elapsed_ms: now.saturating_sub(self.started_at),
            first_token_latency_ms: self
                .first_token_at
                .map(|at| at.saturating_sub(self.started_at)),
        }
    }
}

// ---------------------------------------------------------------------------
// TurnEngineState: everything the engine owns for one session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TurnEngineState {
    pub session_id: String,
    pub model: String,
    pub active: Option<ActiveTurn>,
    pub queue: VecDeque<PendingTurn>,
    pub gate: PermissionGate,
    pub tool_call_count: u64,
    pub recent: VecDeque<TurnSummary>,
    recent_limit: usize,
    history: VecDeque<HistoryEntry>,
}

impl TurnEngineState {
    pub fn new(session_id: impl Into<String>, model: impl Into<String>, recent_limit: usize) -> Self {
        Self {
            session_id: session_id.into(),
            model: model.into(),
            active: None,
            queue: VecDeque::new(),
            gate: PermissionGate::new(),
            tool_call_count: 0,
            recent: VecDeque::new(),
            recent_limit: recent_limit.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn active_turn_id(&self) -> Option<&str> {
        self.active.as_ref().map(ActiveTurn::turn_id)
    }

    pub fn active_summary(&self) -> Option<TurnSummary> {
        self.active
            .as_ref()
            .map(|a| a.turn.summary(TurnState::Running, None))
    }

    pub fn queued_summaries(&self) -> Vec<TurnSummary> {
        self.queue
            .iter()
            .map(|t| t.summary(TurnState::Queued, None))
            .collect()
    }

    pub fn pending_permission(&self) -> Option<PermissionRequest> {
        self.gate.pending().cloned()
    }

    /// Writers that currently own a running or queued turn.
    pub fn writer_count(&self) -> usize {
        let mut writers: Vec<&str> = self
            .queue
            .iter()
            .map(|t| t.writer_id.as_str())
            .chain(self.active.iter().map(|a| a.turn.writer_id.as_str()))
            .collect();
        writers.sort_unstable();
        writers.dedup();
        writers.len()
    }

    /// 1-based queue position, 0 when running, `None` when unknown or finished.
    pub fn position_of(&self, turn_id: &str) -> Option<usize> {
        if self.active_turn_id() == Some(turn_id) {
            return Some(0);
        }
        self.queue
            .iter()
            .position(|t| t.turn_id == turn_id)
            .map(|i| i + 1)
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }
}

impl Default for TurnEngineState {
    fn default() -> Self {
        Self::new(String::new(), String::new(), 1)
    }
}

// ---------------------------------------------------------------------------
// Input / Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    Turn(String),
    Writer(String),
}

#[derive(Debug, Clone)]
pub enum Input {
    Submit(Box<PendingTurn>),
    Backend {
        turn_id: String,
        event: BackendEvent,
    },
    /// The backend's event stream ended.
    BackendClosed {
        turn_id: String,
    },
    ResolvePermission {
        request_id: String,
        decision: PermissionDecision,
        decided_by: String,
    },
    Cancel(CancelTarget),
    CancelGraceElapsed {
        turn_id: String,
    },
    Heartbeat {
        turn_id: String,
    },
}

#[derive(Debug, Clone)]
pub enum Effect {
    Emit(Box<DaemonEvent>),
    StartBackend(Box<TurnRequest>),
    Control {
        turn_id: String,
        control: TurnControl,
    },
    ScheduleCancelGrace {
        turn_id: String,
    },
    /// The turn reached a terminal state; drop its backend handles.
    Finished(Box<ArchivedTurn>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("turn {0} is not running or queued")]
    TurnNotFound(String),
    #[error("writer {0} has no running or queued turns")]
    WriterIdle(String),
    #[error(transparent)]
    Permission(#[from] GateError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TurnNotFound(_) | Self::WriterIdle(_) => "turn-not-found",
            Self::Permission(e) => e.code(),
        }
    }
}

/// Reject inputs a client got wrong before any state changes.
pub fn validate(state: &TurnEngineState, input: &Input) -> Result<(), EngineError> {
    match input {
        Input::ResolvePermission { request_id, .. } => {
            if state.gate.is_open(request_id) {
                Ok(())
            } else if state.gate.was_resolved(request_id) {
                Err(GateError::AlreadyResolved(request_id.clone()).into())
            } else {
                Err(GateError::NotFound(request_id.clone()).into())
            }
        }
        Input::Cancel(CancelTarget::Turn(turn_id)) => {
            if state.position_of(turn_id).is_some() {
                Ok(())
            } else {
                Err(EngineError::TurnNotFound(turn_id.clone()))
            }
        }
        Input::Cancel(CancelTarget::Writer(writer_id)) => {
            let owns_active = state
                .active
                .as_ref()
                .is_some_and(|a| a.turn.writer_id == *writer_id);
            if owns_active || state.queue.iter().any(|t| t.writer_id == *writer_id) {
                Ok(())
            } else {
                Err(EngineError::WriterIdle(writer_id.clone()))
            }
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

pub fn transition(
    mut state: TurnEngineState,
    input: Input,
    now: u64,
) -> (TurnEngineState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        // -- Submission ---------------------------------------------------------
        Input::Submit(turn) => {
            if state.active.is_none() && state.queue.is_empty() {
                start_turn(&mut state, *turn, now, &mut effects);
            } else {
                let turn = *turn;
                emit(
                    &mut effects,
                    DaemonEvent::TurnQueued {
                        turn_id: turn.turn_id.clone(),
                        writer_id: turn.writer_id.clone(),
                        client_id: turn.client_id.clone(),
                        position: state.queue.len() + 1,
                    },
                );
                state.queue.push_back(turn);
            }
        }

        // -- Backend stream -----------------------------------------------------
        Input::Backend { turn_id, event } => {
            let phase = match state.active.as_ref() {
                Some(active) if active.turn.turn_id == turn_id => active.phase.clone(),
                _ => return (state, effects),
            };
            match phase {
                Phase::Cancelling => {
                    if event.is_terminal() {
                        finish(&mut state, Outcome::Cancelled, now, &mut effects);
                    }
                }
                Phase::AwaitingPermission { .. } if !event.is_terminal() => {
                    if let Some(active) = state.active.as_mut() {
                        active.held.push_back(event);
                    }
                }
                Phase::AwaitingPermission { .. } | Phase::Generating => {
                    apply_backend_event(&mut state, event, now, &mut effects);
                }
            }
        }

        Input::BackendClosed { turn_id } => {
            let Some(active) = state.active.as_ref() else {
                return (state, effects);
            };
            if active.turn.turn_id != turn_id {
                return (state, effects);
            }
            let outcome = if active.phase == Phase::Cancelling {
                Outcome::Cancelled
            } else {
                Outcome::Failed(BackendError::StreamClosed(
                    "backend stream ended before the turn finished".to_string(),
                ))
            };
            finish(&mut state, outcome, now, &mut effects);
        }

        // -- Permission gate ----------------------------------------------------
        Input::ResolvePermission {
            request_id,
            decision,
            decided_by,
        } => {
            let Ok(resolution) = state.gate.resolve(&request_id, decision, &decided_by) else {
                return (state, effects);
            };
            emit_resolution(&mut effects, &resolution);

            let call_id = resolution.request.call_id.clone();
            let turn_id = resolution.request.turn_id.clone();
            let Some(active) = state.active.as_mut() else {
                return (state, effects);
            };
            if active.turn.turn_id != turn_id {
                return (state, effects);
            }
            active.phase = Phase::Generating;

            match decision {
                PermissionDecision::Allow => {
                    effects.push(Effect::Control {
                        turn_id,
                        control: TurnControl::Approve { call_id },
                    });
                }
                PermissionDecision::Deny => {
                    let reason = format!("permission denied by {decided_by}");
                    end_tool(active, &call_id, Err(reason.clone()), &mut effects);
                    effects.push(Effect::Control {
                        turn_id,
                        control: TurnControl::Deny { call_id, reason },
                    });
                }
            }

            drain_held(&mut state, now, &mut effects);
        }

        // -- Cancellation -------------------------------------------------------
        Input::Cancel(target) => {
            let (cancel_active, queued_ids): (bool, Vec<String>) = match &target {
                CancelTarget::Turn(turn_id) => {
                    let is_active = state.active_turn_id() == Some(turn_id.as_str());
                    let queued = if is_active {
                        Vec::new()
                    } else {
                        vec![turn_id.clone()]
                    };
                    (is_active, queued)
                }
                CancelTarget::Writer(writer_id) => {
                    let is_active = state
                        .active
                        .as_ref()
                        .is_some_and(|a| a.turn.writer_id == *writer_id);
                    let queued = state
                        .queue
                        .iter()
                        .filter(|t| t.writer_id == *writer_id)
                        .map(|t| t.turn_id.clone())
                        .collect();
                    (is_active, queued)
                }
            };

            for turn_id in queued_ids {
                let Some(index) = state.queue.iter().position(|t| t.turn_id == turn_id) else {
                    continue;
                };
                let Some(turn) = state.queue.remove(index) else {
                    continue;
                };
                emit(
                    &mut effects,
                    DaemonEvent::SessionCancelled {
                        turn_id: turn.turn_id.clone(),
                        previous_state: TurnState::Queued,
                        stats: None,
                    },
                );
                remember(&mut state, turn.summary(TurnState::Cancelled, None));
            }

            if cancel_active {
                begin_cancel(&mut state, &mut effects);
            }
        }

        Input::CancelGraceElapsed { turn_id } => {
            let still_cancelling = state
                .active
                .as_ref()
                .is_some_and(|a| a.turn.turn_id == turn_id && a.phase == Phase::Cancelling);
            if still_cancelling {
                finish(&mut state, Outcome::Cancelled, now, &mut effects);
            }
        }

        // -- Heartbeat ----------------------------------------------------------
        Input::Heartbeat { turn_id } => {
            if let Some(active) = state.active.as_ref() {
                if active.turn.turn_id == turn_id && active.phase != Phase::Cancelling {
                    emit(
                        &mut effects,
                        DaemonEvent::TurnProgress {
                            turn_id,
                            elapsed_ms: now.saturating_sub(active.started_at),
                            tokens: active.tokens(),
                            awaiting_permission: matches!(
                                active.phase,
                                Phase::AwaitingPermission { .. }
                            ),
                        },
                    );
                }
            }
        }
    }

    (state, effects)
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

enum Outcome {
    Done,
    Failed(BackendError),
    Cancelled,
}

fn emit(effects: &mut Vec<Effect>, event: DaemonEvent) {
    effects.push(Effect::Emit(Box::new(event)));
}

fn emit_resolution(effects: &mut Vec<Effect>, resolution: &Resolution) {
    emit(
        effects,
        DaemonEvent::PermissionResolved {
            request_id: resolution.request.request_id.clone(),
            turn_id: resolution.request.turn_id.clone(),
            decision: resolution.decision,
            decided_by: resolution.decided_by.clone(),
        },
    );
}

fn start_turn(state: &mut TurnEngineState, turn: PendingTurn, now: u64, effects: &mut Vec<Effect>) {
    emit(
        effects,
        DaemonEvent::TurnStart {
            turn_id: turn.turn_id.clone(),
            writer_id: turn.writer_id.clone(),
            client_id: turn.client_id.clone(),
            mode: turn.mode,
        },
    );
    effects.push(Effect::StartBackend(Box::new(TurnRequest {
        session_id: state.session_id.clone(),
        turn_id: turn.turn_id.clone(),
        model: state.model.clone(),
        content: turn.content.clone(),
        mode: turn.mode,
        metadata: turn.metadata.clone(),
        history: state.history.iter().cloned().collect(),
    })));
    state.active = Some(ActiveTurn::new(turn, now));
}

fn apply_backend_event(
    state: &mut TurnEngineState,
    event: BackendEvent,
    now: u64,
    effects: &mut Vec<Effect>,
) {
    let Some(active) = state.active.as_mut() else {
        return;
    };
    let turn_id = active.turn.turn_id.clone();

    match event {
        BackendEvent::Token(text) => push_token(active, text, now, effects),
        BackendEvent::Thinking(text) => {
            emit(effects, DaemonEvent::TurnThinking { turn_id, text });
        }
        BackendEvent::ToolCall(call) => {
            active.tool_calls += 1;
            state.tool_call_count += 1;
            start_tool(state, call, now, effects);
        }
        BackendEvent::ToolFinished { call_id, outcome } => {
            let result = match outcome {
                ToolOutcome::Success(output) => Ok(output),
                ToolOutcome::Failure(error) => Err(error),
            };
            end_tool(active, &call_id, result, effects);
        }
        BackendEvent::Usage {
            prompt_tokens,
            completion_tokens,
        } => {
            active.usage = Some((prompt_tokens, completion_tokens));
        }
        BackendEvent::Completed => finish(state, Outcome::Done, now, effects),
        BackendEvent::Cancelled => finish(state, Outcome::Cancelled, now, effects),
        BackendEvent::Failed(error) => finish(state, Outcome::Failed(error), now, effects),
    }
}

fn push_token(active: &mut ActiveTurn, text: String, now: u64, effects: &mut Vec<Effect>) {
    active.first_token_at.get_or_insert(now);
    active.token_events += 1;
    active.output.push_str(&text);
    emit(
        effects,
        DaemonEvent::TurnToken {
            turn_id: active.turn.turn_id.clone(),
            text,
        },
    );
}

/// The turn is ending while paused: what the backend streamed behind the
/// open request still belongs to it. Tool calls held there never run.
fn release_held(active: &mut ActiveTurn, now: u64, effects: &mut Vec<Effect>) {
    for event in std::mem::take(&mut active.held) {
        match event {
            BackendEvent::Token(text) => push_token(active, text, now, effects),
            BackendEvent::Thinking(text) => emit(
                effects,
                DaemonEvent::TurnThinking {
                    turn_id: active.turn.turn_id.clone(),
                    text,
                },
            ),
            BackendEvent::ToolFinished { call_id, outcome } => {
                let result = match outcome {
                    ToolOutcome::Success(output) => Ok(output),
                    ToolOutcome::Failure(error) => Err(error),
                };
                end_tool(active, &call_id, result, effects);
            }
            BackendEvent::Usage {
                prompt_tokens,
                completion_tokens,
            } => active.usage = Some((prompt_tokens, completion_tokens)),
            BackendEvent::ToolCall(_)
            | BackendEvent::Completed
            | BackendEvent::Cancelled
            | BackendEvent::Failed(_) => {}
        }
    }
}

fn start_tool(state: &mut TurnEngineState, call: ToolCall, now: u64, effects: &mut Vec<Effect>) {
    let Some(active) = state.active.as_mut() else {
        return;
    };
    let turn_id = active.turn.turn_id.clone();
    active
        .open_tools
        .insert(call.call_id.clone(), call.tool_name.clone());
    emit(
        effects,
        DaemonEvent::ToolStart {
            turn_id: turn_id.clone(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
        },
    );

    if !call.requires_approval {
        return;
    }

    match state
        .gate
        .request(&turn_id, &call.call_id, &call.tool_name, call.arguments, now)
    {
        Ok(request) => {
            active.phase = Phase::AwaitingPermission {
                request_id: request.request_id.clone(),
                call_id: call.call_id,
            };
            emit(effects, DaemonEvent::PermissionRequest(request));
        }
        Err(error) => {
            // Cannot pause twice; refuse this call locally.
            let reason = error.to_string();
            end_tool(active, &call.call_id, Err(reason.clone()), effects);
            effects.push(Effect::Control {
                turn_id,
                control: TurnControl::Deny {
                    call_id: call.call_id,
                    reason,
                },
            });
        }
    }
}

fn end_tool(
    active: &mut ActiveTurn,
    call_id: &str,
    result: Result<String, String>,
    effects: &mut Vec<Effect>,
) {
    let Some(tool_name) = active.open_tools.remove(call_id) else {
        return;
    };
    let (ok, output, error) = match result {
        Ok(output) => (true, Some(output), None),
        Err(error) => (false, None, Some(error)),
    };
    emit(
        effects,
        DaemonEvent::ToolEnd {
            turn_id: active.turn.turn_id.clone(),
            call_id: call_id.to_string(),
            tool_name,
            ok,
            output,
            error,
        },
    );
}

/// Replay events that arrived while paused, until the turn pauses again or ends.
fn drain_held(state: &mut TurnEngineState, now: u64, effects: &mut Vec<Effect>) {
    loop {
        let Some(active) = state.active.as_mut() else {
            return;
        };
        if active.phase != Phase::Generating {
            return;
        }
        let Some(event) = active.held.pop_front() else {
            return;
        };
        apply_backend_event(state, event, now, effects);
    }
}

fn begin_cancel(state: &mut TurnEngineState, effects: &mut Vec<Effect>) {
    let Some(active) = state.active.as_mut() else {
        return;
    };
    if active.phase == Phase::Cancelling {
        return;
    }
    let turn_id = active.turn.turn_id.clone();

    if let Some(resolution) = state.gate.force_deny_for_turn(&turn_id, SYSTEM_CANCEL) {
        emit_resolution(effects, &resolution);
        end_tool(
            active,
            &resolution.request.call_id,
            Err(format!("permission denied by {SYSTEM_CANCEL}")),
            effects,
        );
    }

    active.phase = Phase::Cancelling;
    active.held.clear();
    effects.push(Effect::Control {
        turn_id: turn_id.clone(),
        control: TurnControl::Cancel,
    });
    effects.push(Effect::ScheduleCancelGrace { turn_id });
}

fn finish(state: &mut TurnEngineState, outcome: Outcome, now: u64, effects: &mut Vec<Effect>) {
    let Some(mut active) = state.active.take() else {
        return;
    };
    let turn_id = active.turn.turn_id.clone();

    if let Some(resolution) = state.gate.force_deny_for_turn(&turn_id, SYSTEM_TURN_ENDED) {
        emit_resolution(effects, &resolution);
    }
    release_held(&mut active, now, effects);
    let mut open: Vec<String> = active.open_tools.keys().cloned().collect();
    open.sort();
    for call_id in open {
        end_tool(
            &mut active,
            &call_id,
            Err("turn ended before the tool finished".to_string()),
            effects,
        );
    }

    let stats = active.stats(now);
    let final_state = match outcome {
        Outcome::Done => {
            emit(
                effects,
                DaemonEvent::TurnDone {
                    turn_id: turn_id.clone(),
                    stats: stats.clone(),
                },
            );
            state.history.push_back(HistoryEntry {
                prompt: active.turn.content.clone(),
                response: active.output.clone(),
            });
            while state.history.len() > HISTORY_LIMIT {
                state.history.pop_front();
            }
            TurnState::Done
        }
        Outcome::Failed(error) => {
            let code: TurnErrorCode = error.code();
            emit(
                effects,
                DaemonEvent::TurnError {
                    turn_id: turn_id.clone(),
                    code,
                    message: error.to_string(),
                    remediation: code.remediation().to_string(),
                    stats: stats.clone(),
                },
            );
            TurnState::Error
        }
        Outcome::Cancelled => {
            emit(
                effects,
                DaemonEvent::SessionCancelled {
                    turn_id: turn_id.clone(),
                    previous_state: TurnState::Running,
                    stats: Some(stats.clone()),
                },
            );
            TurnState::Cancelled
        }
    };

    remember(state, active.turn.summary(final_state, Some(stats.clone())));
    effects.push(Effect::Finished(Box::new(ArchivedTurn {
        turn_id,
        session_id: state.session_id.clone(),
        writer_id: active.turn.writer_id.clone(),
        client_id: active.turn.client_id.clone(),
        mode: active.turn.mode,
        state: final_state,
        prompt: active.turn.content,
        response: active.output,
        stats: Some(stats),
        queued_at: active.turn.queued_at,
        finished_at: now,
    })));

    if let Some(next) = state.queue.pop_front() {
        start_turn(state, next, now, effects);
    }
}

fn remember(state: &mut TurnEngineState, summary: TurnSummary) {
    state.recent.push_back(summary);
    while state.recent.len() > state.recent_limit {
        state.recent.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_000;

    fn test_state() -> TurnEngineState {
        TurnEngineState::new("s-1", "qwen3", 10)
    }

    fn pending(turn_id: &str, writer_id: &str) -> Box<PendingTurn> {
        Box::new(PendingTurn {
            turn_id: turn_id.to_string(),
            writer_id: writer_id.to_string(),
            client_id: format!("client-{writer_id}"),
            mode: TurnMode::Chat,
            content: format!("prompt for {turn_id}"),
            metadata: None,
            queued_at: NOW,
        })
    }

    fn backend(turn_id: &str, event: BackendEvent) -> Input {
        Input::Backend {
            turn_id: turn_id.to_string(),
            event,
        }
    }

    fn events(effects: &[Effect]) -> Vec<&'static str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event.name()),
                _ => None,
            })
            .collect()
    }

    fn tool_call(call_id: &str, requires_approval: bool) -> BackendEvent {
        BackendEvent::ToolCall(ToolCall {
            call_id: call_id.to_string(),
            tool_name: "shell".to_string(),
            arguments: json!({"cmd": "ls"}),
            requires_approval,
        })
    }

    fn open_request_id(state: &TurnEngineState) -> String {
        state
            .pending_permission()
            .map(|r| r.request_id)
            .expect("an open permission request")
    }

    #[test]
    fn submit_on_idle_session_starts_immediately() {
        let (state, effects) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);

        assert_eq!(events(&effects), vec!["turn.start"]);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartBackend(req) if req.turn_id == "t-1" && req.model == "qwen3")));
        assert_eq!(state.active_turn_id(), Some("t-1"));
    }

    #[test]
    fn second_submit_queues_until_first_is_done() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, effects) = transition(state, Input::Submit(pending("t-2", "w-2")), NOW);

        assert_eq!(events(&effects), vec!["turn.queued"]);
        match &effects[0] {
            Effect::Emit(event) => match event.as_ref() {
                DaemonEvent::TurnQueued { position, .. } => assert_eq!(*position, 1),
                other => panic!("unexpected variant: {:?}", other),
            },
            other => panic!("unexpected effect: {:?}", other),
        }
        assert_eq!(state.active_turn_id(), Some("t-1"));
        assert_eq!(state.position_of("t-2"), Some(1));

        let (state, effects) = transition(state, backend("t-1", BackendEvent::Completed), NOW + 50);
        assert_eq!(events(&effects), vec!["turn.done", "turn.start"]);
        assert_eq!(state.active_turn_id(), Some("t-2"));
        assert!(state.queue.is_empty());
    }

    #[test]
    fn tokens_and_usage_feed_final_stats() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", BackendEvent::Token("Hel".into())), NOW + 40);
        let (state, _) = transition(state, backend("t-1", BackendEvent::Token("lo".into())), NOW + 60);
        let (state, _) = transition(
            state,
            backend(
                "t-1",
                BackendEvent::Usage {
                    prompt_tokens: 12,
                    completion_tokens: 2,
                },
            ),
            NOW + 70,
        );
        let (state, effects) = transition(state, backend("t-1", BackendEvent::Completed), NOW + 100);

        let stats = effects
            .iter()
            .find_map(|e| match e {
                Effect::Emit(event) => match event.as_ref() {
                    DaemonEvent::TurnDone { stats, .. } => Some(stats.clone()),
                    _ => None,
                },
                _ => None,
            })
            .expect("turn.done");
        assert_eq!(stats.prompt_tokens, 12);
        assert_eq!(stats.completion_tokens, 2);
        assert_eq!(stats.elapsed_ms, 100);
        assert_eq!(stats.first_token_latency_ms, Some(40));

        let history: Vec<_> = state.history().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].response, "Hello");
    }

    #[test]
    fn stale_backend_events_are_dropped() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, effects) = transition(state, backend("t-old", BackendEvent::Token("x".into())), NOW);
        assert!(effects.is_empty());
        assert_eq!(state.active_turn_id(), Some("t-1"));
    }

    #[test]
    fn approval_pauses_and_holds_events() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, effects) = transition(state, backend("t-1", tool_call("call-0", true)), NOW);
        assert_eq!(events(&effects), vec!["tool.start", "permission.request"]);
        assert_eq!(state.tool_call_count, 1);

        // Anything that sneaks through while paused is held, not emitted.
        let (state, effects) = transition(state, backend("t-1", BackendEvent::Token("x".into())), NOW);
        assert!(effects.is_empty());

        let request_id = open_request_id(&state);
        let (state, effects) = transition(
            state,
            Input::ResolvePermission {
                request_id,
                decision: PermissionDecision::Allow,
                decided_by: "user:1".into(),
            },
            NOW,
        );
        assert_eq!(events(&effects), vec!["permission.resolved", "turn.token"]);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Control { control: TurnControl::Approve { call_id }, .. } if call_id == "call-0"
        )));
        assert_eq!(state.active.as_ref().map(|a| a.phase.clone()), Some(Phase::Generating));
    }

    #[test]
    fn turn_ending_while_paused_keeps_held_tokens() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", BackendEvent::Token("Hel".into())), NOW + 10);
        let (state, _) = transition(state, backend("t-1", tool_call("call-0", true)), NOW + 20);
        let (state, _) = transition(state, backend("t-1", BackendEvent::Token("lo".into())), NOW + 30);

        let (state, effects) = transition(state, backend("t-1", BackendEvent::Completed), NOW + 40);
        assert_eq!(
            events(&effects),
            vec!["permission.resolved", "turn.token", "tool.end", "turn.done"]
        );
        let archived = effects
            .iter()
            .find_map(|e| match e {
                Effect::Finished(turn) => Some(turn.clone()),
                _ => None,
            })
            .expect("archived turn");
        assert_eq!(archived.response, "Hello");
        assert_eq!(archived.stats.map(|s| s.completion_tokens), Some(2));
        assert!(state.active.is_none());
        assert!(state.pending_permission().is_none());
    }

    #[test]
    fn deny_fails_the_tool_not_the_turn() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", tool_call("call-0", true)), NOW);
        let request_id = open_request_id(&state);

        let (state, effects) = transition(
            state,
            Input::ResolvePermission {
                request_id,
                decision: PermissionDecision::Deny,
                decided_by: "user:1".into(),
            },
            NOW,
        );
        assert_eq!(events(&effects), vec!["permission.resolved", "tool.end"]);
        let tool_end_ok = effects.iter().find_map(|e| match e {
            Effect::Emit(event) => match event.as_ref() {
                DaemonEvent::ToolEnd { ok, error, .. } => Some((*ok, error.clone())),
                _ => None,
            },
            _ => None,
        });
        assert_eq!(
            tool_end_ok,
            Some((false, Some("permission denied by user:1".to_string())))
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Control { control: TurnControl::Deny { .. }, .. }
        )));
        assert_eq!(state.active_turn_id(), Some("t-1"));

        // A late tool result for the denied call cannot flip it to success.
        let (_, effects) = transition(
            state,
            backend(
                "t-1",
                BackendEvent::ToolFinished {
                    call_id: "call-0".into(),
                    outcome: ToolOutcome::Success("ran anyway".into()),
                },
            ),
            NOW,
        );
        assert!(events(&effects).is_empty());
    }

    #[test]
    fn duplicate_resolution_is_rejected_by_validate() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", tool_call("call-0", true)), NOW);
        let request_id = open_request_id(&state);
        let resolve = Input::ResolvePermission {
            request_id: request_id.clone(),
            decision: PermissionDecision::Allow,
            decided_by: "user:1".into(),
        };
        assert!(validate(&state, &resolve).is_ok());
        let (state, _) = transition(state, resolve.clone(), NOW);

        let err = validate(&state, &resolve).unwrap_err();
        assert_eq!(err.code(), "permission-already-resolved");
        let err = validate(
            &state,
            &Input::ResolvePermission {
                request_id: "perm-nope".into(),
                decision: PermissionDecision::Allow,
                decided_by: "u".into(),
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "permission-not-found");
    }

    #[test]
    fn cancel_running_turn_force_denies_and_waits_for_backend() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", tool_call("call-0", true)), NOW);

        let (state, effects) =
            transition(state, Input::Cancel(CancelTarget::Turn("t-1".into())), NOW + 10);
        assert_eq!(events(&effects), vec!["permission.resolved", "tool.end"]);
        match &effects[0] {
            Effect::Emit(event) => match event.as_ref() {
                DaemonEvent::PermissionResolved {
                    decision,
                    decided_by,
                    ..
                } => {
                    assert_eq!(*decision, PermissionDecision::Deny);
                    assert_eq!(decided_by, SYSTEM_CANCEL);
                }
                other => panic!("unexpected variant: {:?}", other),
            },
            other => panic!("unexpected effect: {:?}", other),
        }
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Control { control: TurnControl::Cancel, .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleCancelGrace { turn_id } if turn_id == "t-1")));

        // Tokens after cancel are swallowed; the backend ack ends the turn.
        let (state, effects) = transition(state, backend("t-1", BackendEvent::Token("late".into())), NOW + 20);
        assert!(effects.is_empty());
        let (state, effects) = transition(state, backend("t-1", BackendEvent::Cancelled), NOW + 30);
        assert_eq!(events(&effects), vec!["session.cancelled"]);
        assert!(state.active.is_none());
        assert_eq!(state.recent.back().map(|t| t.state), Some(TurnState::Cancelled));
    }

    #[test]
    fn unresponsive_backend_is_cancelled_after_grace() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-2", "w-1")), NOW);
        let (state, _) = transition(state, Input::Cancel(CancelTarget::Turn("t-1".into())), NOW);

        let (state, effects) = transition(
            state,
            Input::CancelGraceElapsed {
                turn_id: "t-1".into(),
            },
            NOW + 3_000,
        );
        assert_eq!(events(&effects), vec!["session.cancelled", "turn.start"]);
        assert_eq!(state.active_turn_id(), Some("t-2"));

        // A late grace timer for a finished turn does nothing.
        let (_, effects) = transition(
            state,
            Input::CancelGraceElapsed {
                turn_id: "t-1".into(),
            },
            NOW + 4_000,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn cancel_queued_turn_only_removes_it() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-2", "w-2")), NOW);

        let (state, effects) = transition(state, Input::Cancel(CancelTarget::Turn("t-2".into())), NOW);
        assert_eq!(events(&effects), vec!["session.cancelled"]);
        match &effects[0] {
            Effect::Emit(event) => match event.as_ref() {
                DaemonEvent::SessionCancelled {
                    previous_state,
                    stats,
                    ..
                } => {
                    assert_eq!(*previous_state, TurnState::Queued);
                    assert!(stats.is_none());
                }
                other => panic!("unexpected variant: {:?}", other),
            },
            other => panic!("unexpected effect: {:?}", other),
        }
        assert_eq!(state.active_turn_id(), Some("t-1"));
        assert!(state.queue.is_empty());
    }

    #[test]
    fn cancel_by_writer_hits_running_and_queued_turns() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-2", "w-2")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-3", "w-1")), NOW);

        let cancel = Input::Cancel(CancelTarget::Writer("w-1".into()));
        assert!(validate(&state, &cancel).is_ok());
        let (state, effects) = transition(state, cancel, NOW);
        assert_eq!(events(&effects), vec!["session.cancelled"]);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].turn_id, "t-2");
        assert_eq!(state.active.as_ref().map(|a| a.phase.clone()), Some(Phase::Cancelling));

        let err = validate(&state, &Input::Cancel(CancelTarget::Writer("w-9".into()))).unwrap_err();
        assert_eq!(err.code(), "turn-not-found");
    }

    #[test]
    fn backend_failure_maps_to_turn_error_and_promotes_next() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-2", "w-1")), NOW);
        let (state, effects) = transition(
            state,
            backend(
                "t-1",
                BackendEvent::Failed(BackendError::NoModelLoaded("qwen3".into())),
            ),
            NOW,
        );
        assert_eq!(events(&effects), vec!["turn.error", "turn.start"]);
        match &effects[0] {
            Effect::Emit(event) => match event.as_ref() {
                DaemonEvent::TurnError {
                    code, remediation, ..
                } => {
                    assert_eq!(*code, TurnErrorCode::NoModelLoaded);
                    assert!(!remediation.is_empty());
                }
                other => panic!("unexpected variant: {:?}", other),
            },
            other => panic!("unexpected effect: {:?}", other),
        }
        assert_eq!(state.active_turn_id(), Some("t-2"));
    }

    #[test]
    fn stream_closing_without_terminal_event_is_ws_closed() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (_, effects) = transition(
            state,
            Input::BackendClosed {
                turn_id: "t-1".into(),
            },
            NOW,
        );
        let code = effects.iter().find_map(|e| match e {
            Effect::Emit(event) => match event.as_ref() {
                DaemonEvent::TurnError { code, .. } => Some(*code),
                _ => None,
            },
            _ => None,
        });
        assert_eq!(code, Some(TurnErrorCode::LmxWsClosed));
    }

    #[test]
    fn open_tools_are_closed_when_turn_fails() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", tool_call("call-0", false)), NOW);
        let (_, effects) = transition(
            state,
            backend("t-1", BackendEvent::Failed(BackendError::Timeout(120))),
            NOW,
        );
        assert_eq!(events(&effects), vec!["tool.end", "turn.error"]);
        assert!(effects.iter().any(|e| matches!(e, Effect::Finished(t) if t.state == TurnState::Error)));
    }

    #[test]
    fn heartbeat_reports_pause_state() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, backend("t-1", tool_call("call-0", true)), NOW);
        let (_, effects) = transition(
            state,
            Input::Heartbeat {
                turn_id: "t-1".into(),
            },
            NOW + 2_000,
        );
        match &effects[..] {
            [Effect::Emit(event)] => match event.as_ref() {
                DaemonEvent::TurnProgress {
                    elapsed_ms,
                    awaiting_permission,
                    ..
                } => {
                    assert_eq!(*elapsed_ms, 2_000);
                    assert!(*awaiting_permission);
                }
                other => panic!("unexpected variant: {:?}", other),
            },
            other => panic!("unexpected effects: {:?}", other),
        }
    }

    #[test]
    fn writer_count_deduplicates() {
        let (state, _) = transition(test_state(), Input::Submit(pending("t-1", "w-1")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-2", "w-1")), NOW);
        let (state, _) = transition(state, Input::Submit(pending("t-3", "w-2")), NOW);
        assert_eq!(state.writer_count(), 2);
    }
}
