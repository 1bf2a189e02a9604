//! Daemon → client frames

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Envelope format version. Bumped on any breaking change to event payloads.
pub const PROTOCOL_VERSION: u32 = 3;

/// Versioned, sequenced frame around every outbound event.
///
/// `seq` is per-session, starts at 1 and never skips. Connection-scoped
/// frames (protocol errors) use `seq == 0` and sit outside any session order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    #[serde(flatten)]
    pub event: DaemonEvent,
    pub daemon_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub seq: u64,
    pub timestamp: u64,
}

impl Envelope {
    pub fn is_sequenced(&self) -> bool {
        self.seq > 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Every event the daemon can emit. Serialized as `{"event": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum DaemonEvent {
    #[serde(rename = "session.snapshot")]
    SessionSnapshot {
        reason: SnapshotReason,
        snapshot: Box<SessionSnapshot>,
    },

    // Turn lifecycle
    #[serde(rename = "turn.queued")]
    TurnQueued {
        turn_id: String,
        writer_id: String,
        client_id: String,
        position: usize,
    },
    #[serde(rename = "turn.start")]
    TurnStart {
        turn_id: String,
        writer_id: String,
        client_id: String,
        mode: TurnMode,
    },
    #[serde(rename = "turn.token")]
    TurnToken { turn_id: String, text: String },
    #[serde(rename = "turn.thinking")]
    TurnThinking { turn_id: String, text: String },
    #[serde(rename = "turn.progress")]
    TurnProgress {
        turn_id: String,
        elapsed_ms: u64,
        tokens: u64,
        awaiting_permission: bool,
    },
    #[serde(rename = "turn.done")]
    TurnDone { turn_id: String, stats: TurnStats },
    #[serde(rename = "turn.error")]
    TurnError {
        turn_id: String,
        code: TurnErrorCode,
        message: String,
        remediation: String,
        stats: TurnStats,
    },
    #[serde(rename = "session.cancelled")]
    SessionCancelled {
        turn_id: String,
        previous_state: TurnState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<TurnStats>,
    },

    // Tools
    #[serde(rename = "tool.start")]
    ToolStart {
        turn_id: String,
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    #[serde(rename = "tool.end")]
    ToolEnd {
        turn_id: String,
        call_id: String,
        tool_name: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // Permission gate
    #[serde(rename = "permission.request")]
    PermissionRequest(PermissionRequest),
    #[serde(rename = "permission.resolved")]
    PermissionResolved {
        request_id: String,
        turn_id: String,
        decision: PermissionDecision,
        decided_by: String,
    },

    // Background processes
    #[serde(rename = "background.status")]
    BackgroundStatus {
        process: BackgroundProcessInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_state: Option<BackgroundState>,
        reason: StatusReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    #[serde(rename = "background.output")]
    BackgroundOutput {
        process_id: String,
        chunk: OutputChunk,
    },

    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl DaemonEvent {
    /// Wire name of the event, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionSnapshot { .. } => "session.snapshot",
            Self::TurnQueued { .. } => "turn.queued",
            Self::TurnStart { .. } => "turn.start",
            Self::TurnToken { .. } => "turn.token",
            Self::TurnThinking { .. } => "turn.thinking",
            Self::TurnProgress { .. } => "turn.progress",
            Self::TurnDone { .. } => "turn.done",
            Self::TurnError { .. } => "turn.error",
            Self::SessionCancelled { .. } => "session.cancelled",
            Self::ToolStart { .. } => "tool.start",
            Self::ToolEnd { .. } => "tool.end",
            Self::PermissionRequest(_) => "permission.request",
            Self::PermissionResolved { .. } => "permission.resolved",
            Self::BackgroundStatus { .. } => "background.status",
            Self::BackgroundOutput { .. } => "background.output",
            Self::Error(_) => "error",
        }
    }

    /// Turn this event belongs to, if any.
    pub fn turn_id(&self) -> Option<&str> {
        match self {
            Self::TurnQueued { turn_id, .. }
            | Self::TurnStart { turn_id, .. }
            | Self::TurnToken { turn_id, .. }
            | Self::TurnThinking { turn_id, .. }
            | Self::TurnProgress { turn_id, .. }
            | Self::TurnDone { turn_id, .. }
            | Self::TurnError { turn_id, .. }
            | Self::SessionCancelled { turn_id, .. }
            | Self::ToolStart { turn_id, .. }
            | Self::ToolEnd { turn_id, .. }
            | Self::PermissionResolved { turn_id, .. } => Some(turn_id),
            Self::PermissionRequest(request) => Some(&request.turn_id),
            _ => None,
        }
    }
}
