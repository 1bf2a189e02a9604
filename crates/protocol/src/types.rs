//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// How the agent should treat a submitted turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// Conversational turn; tool calls go through the permission gate.
    #[default]
    Chat,
    /// Autonomous task execution.
    Do,
}

impl fmt::Display for TurnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => f.write_str("chat"),
            Self::Do => f.write_str("do"),
        }
    }
}

/// Token, tool, and timing counters finalized when a turn ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStats {
    pub tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_calls: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_token_latency_ms: Option<u64>,
}

/// Turn failure taxonomy. Each code carries its own remediation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnErrorCode {
    NoModelLoaded,
    LmxWsClosed,
    LmxTimeout,
    LmxConnectionRefused,
    StorageFull,
    BackendError,
}

impl TurnErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoModelLoaded => "no-model-loaded",
            Self::LmxWsClosed => "lmx-ws-closed",
            Self::LmxTimeout => "lmx-timeout",
            Self::LmxConnectionRefused => "lmx-connection-refused",
            Self::StorageFull => "storage-full",
            Self::BackendError => "backend-error",
        }
    }

    pub fn remediation(self) -> &'static str {
        match self {
            Self::NoModelLoaded => {
                "Load a model in LMX or pick a loaded model for this session, then retry."
            }
            Self::LmxWsClosed => {
                "The LMX stream closed mid-turn. Check that LMX is still running and resubmit."
            }
            Self::LmxTimeout => {
                "LMX stopped responding. Retry, or raise backend.idle_timeout_ms for slow models."
            }
            Self::LmxConnectionRefused => {
                "Could not reach LMX. Start it or point backend.lmx_ws_url at the right host."
            }
            Self::StorageFull => "The disk is full. Free some space and resubmit the turn.",
            Self::BackendError => "The inference backend failed. See the daemon log for details.",
        }
    }
}

impl fmt::Display for TurnErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// A tool call waiting on human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub request_id: String,
    pub turn_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub requested_at: u64,
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_turn_id: Option<String>,
    pub queued_turn_count: usize,
    pub tool_call_count: u64,
    pub writer_count: usize,
    pub last_seq: u64,
}

/// Turn as seen in snapshots and listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub turn_id: String,
    pub writer_id: String,
    pub client_id: String,
    pub mode: TurnMode,
    pub state: TurnState,
    pub queued_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<TurnStats>,
}

/// Full reconciliation payload sent when replay is not possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: SessionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_turn: Option<TurnSummary>,
    pub queued_turns: Vec<TurnSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_turns: Vec<TurnSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_permission: Option<PermissionRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub background_processes: Vec<BackgroundProcessInfo>,
}

/// Why a snapshot was sent instead of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotReason {
    /// Client attached without a cursor.
    Initial,
    /// The requested cursor is older than the retained replay window.
    ReplayUnavailable,
    /// The live stream outran the client and history was dropped.
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundState {
    Running,
    Completed,
    Failed,
    Killed,
    Timeout,
}

impl BackgroundState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for BackgroundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause attached to a background status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusReason {
    Started,
    Exited,
    NonZeroExit,
    SpawnError,
    Signaled,
    Killed,
    Timeout,
    Lost,
}

impl StatusReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Exited => "exited",
            Self::NonZeroExit => "non-zero-exit",
            Self::SpawnError => "spawn-error",
            Self::Signaled => "signaled",
            Self::Killed => "killed",
            Self::Timeout => "timeout",
            Self::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "exited" => Some(Self::Exited),
            "non-zero-exit" => Some(Self::NonZeroExit),
            "spawn-error" => Some(Self::SpawnError),
            "signaled" => Some(Self::Signaled),
            "killed" => Some(Self::Killed),
            "timeout" => Some(Self::Timeout),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

/// Record of a supervised background command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundProcessInfo {
    pub process_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: BackgroundState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restarted_from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Stream selector for output reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFilter {
    Stdout,
    Stderr,
    #[default]
    Both,
}

impl StreamFilter {
    pub fn accepts(self, stream: OutputStream) -> bool {
        match self {
            Self::Both => true,
            Self::Stdout => stream == OutputStream::Stdout,
            Self::Stderr => stream == OutputStream::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub seq: u64,
    pub timestamp: u64,
    pub stream: OutputStream,
    pub text: String,
}

/// Result of reading a process's buffered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSlice {
    pub process_id: String,
    pub chunks: Vec<OutputChunk>,
    /// Cursor to pass as `afterSeq` on the next read.
    pub next_seq: u64,
    pub has_more: bool,
    /// Chunks newer than `afterSeq` were dropped before this read.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_seq: Option<u64>,
}

/// Safety class of an administrative operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Safety {
    Read,
    Write,
    Dangerous,
}

/// Structured error body used on every surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_kebab_case() {
        let json = serde_json::to_string(&TurnErrorCode::LmxConnectionRefused).unwrap();
        assert_eq!(json, "\"lmx-connection-refused\"");
        assert_eq!(TurnErrorCode::NoModelLoaded.as_str(), "no-model-loaded");
    }

    #[test]
    fn remediations_are_distinct() {
        let codes = [
            TurnErrorCode::NoModelLoaded,
            TurnErrorCode::LmxWsClosed,
            TurnErrorCode::LmxTimeout,
            TurnErrorCode::LmxConnectionRefused,
            TurnErrorCode::StorageFull,
            TurnErrorCode::BackendError,
        ];
        let mut seen = std::collections::HashSet::new();
        for code in codes {
            assert!(seen.insert(code.remediation()), "duplicate remediation for {code}");
        }
    }

    #[test]
    fn stream_filter_matches_streams() {
        assert!(StreamFilter::Both.accepts(OutputStream::Stderr));
        assert!(StreamFilter::Stdout.accepts(OutputStream::Stdout));
        assert!(!StreamFilter::Stdout.accepts(OutputStream::Stderr));
    }

    #[test]
    fn background_state_parses_its_own_names() {
        for state in [
            BackgroundState::Running,
            BackgroundState::Completed,
            BackgroundState::Failed,
            BackgroundState::Killed,
            BackgroundState::Timeout,
        ] {
            assert_eq!(BackgroundState::parse(state.as_str()), Some(state));
        }
        assert!(!BackgroundState::Running.is_terminal());
        assert!(BackgroundState::Timeout.is_terminal());
    }
}
