//! Opta Connector Core
//!
//! The seam between the daemon's turn engine and whatever produces tokens.
//! A backend receives a [`TurnRequest`], streams [`BackendEvent`]s back, and
//! listens for [`TurnControl`] messages (tool decisions, cancellation).

use futures::future::BoxFuture;
use opta_protocol::{Metadata, TurnErrorCode, TurnMode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod scripted;

pub use scripted::{ScriptStep, ScriptedBackend};

/// Capacity of the per-turn event and control channels.
pub const TURN_CHANNEL_CAPACITY: usize = 256;

/// One finished exchange, handed to the backend as context.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub prompt: String,
    pub response: String,
}

/// Everything a backend needs to run one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub turn_id: String,
    pub model: String,
    pub content: String,
    pub mode: TurnMode,
    pub metadata: Option<Metadata>,
    pub history: Vec<HistoryEntry>,
}

/// A tool invocation proposed by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(String),
    Failure(String),
}

/// Events streamed by a backend for a single turn.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Token(String),
    Thinking(String),
    ToolCall(ToolCall),
    ToolFinished {
        call_id: String,
        outcome: ToolOutcome,
    },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Completed,
    /// Backend acknowledged a cancel request and stopped.
    Cancelled,
    Failed(BackendError),
}

impl BackendEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed(_))
    }
}

/// Messages from the daemon to a running backend turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnControl {
    Approve { call_id: String },
    Deny { call_id: String, reason: String },
    Cancel,
}

/// Errors a backend can end a turn with
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("model `{0}` is not loaded")]
    NoModelLoaded(String),

    #[error("backend stream closed: {0}")]
    StreamClosed(String),

    #[error("backend timed out after {0}ms")]
    Timeout(u64),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn code(&self) -> TurnErrorCode {
        match self {
            Self::NoModelLoaded(_) => TurnErrorCode::NoModelLoaded,
            Self::StreamClosed(_) => TurnErrorCode::LmxWsClosed,
            Self::Timeout(_) => TurnErrorCode::LmxTimeout,
            Self::ConnectionRefused(_) => TurnErrorCode::LmxConnectionRefused,
            Self::StorageFull(_) => TurnErrorCode::StorageFull,
            Self::Other(_) => TurnErrorCode::BackendError,
        }
    }

    /// Classify a free-text error reported by an inference server.
    pub fn from_message(model: &str, message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("not loaded") || lowered.contains("no model loaded") {
            Self::NoModelLoaded(model.to_string())
        } else if lowered.contains("no space left") || lowered.contains("disk full") {
            Self::StorageFull(message.to_string())
        } else {
            Self::Other(message.to_string())
        }
    }
}

/// Daemon-side ends of a running turn.
pub struct TurnHandle {
    pub events: mpsc::Receiver<BackendEvent>,
    pub control: mpsc::Sender<TurnControl>,
}

/// Backend-side ends of a running turn.
pub struct TurnChannels {
    pub events: mpsc::Sender<BackendEvent>,
    pub control: mpsc::Receiver<TurnControl>,
}

/// Create the paired channels for one turn.
pub fn turn_channels() -> (TurnHandle, TurnChannels) {
    let (event_tx, event_rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
    (
        TurnHandle {
            events: event_rx,
            control: control_tx,
        },
        TurnChannels {
            events: event_tx,
            control: control_rx,
        },
    )
}

/// Something that can run turns.
///
/// `start_turn` must not block: implementations spawn their own task and
/// return the channel pair immediately.
pub trait TurnBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn start_turn(&self, request: TurnRequest) -> TurnHandle;
}

/// Runs approved tool calls. Tool behavior itself lives outside the daemon.
pub trait ToolExecutor: Send + Sync + 'static {
    /// OpenAI-style function definitions offered to the model.
    fn definitions(&self) -> Vec<Value> {
        Vec::new()
    }

    fn execute(&self, call: ToolCall) -> BoxFuture<'static, ToolOutcome>;
}

/// Executor for daemons with no tools wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableTools;

impl ToolExecutor for UnavailableTools {
    fn execute(&self, call: ToolCall) -> BoxFuture<'static, ToolOutcome> {
        Box::pin(async move {
            ToolOutcome::Failure(format!(
                "tool `{}` is not available on this daemon",
                call.tool_name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_turn_codes() {
        assert_eq!(
            BackendError::Timeout(30_000).code(),
            TurnErrorCode::LmxTimeout
        );
        assert_eq!(
            BackendError::StreamClosed("eof".into()).code(),
            TurnErrorCode::LmxWsClosed
        );
        assert_eq!(
            BackendError::ConnectionRefused("127.0.0.1:1234".into()).code(),
            TurnErrorCode::LmxConnectionRefused
        );
    }

    #[test]
    fn classifies_server_messages() {
        assert_eq!(
            BackendError::from_message("qwen", "Model 'qwen' is not loaded"),
            BackendError::NoModelLoaded("qwen".into())
        );
        assert!(matches!(
            BackendError::from_message("qwen", "OSError: No space left on device"),
            BackendError::StorageFull(_)
        ));
        assert!(matches!(
            BackendError::from_message("qwen", "boom"),
            BackendError::Other(_)
        ));
    }

    #[tokio::test]
    async fn unavailable_tools_fail_with_tool_name() {
        let outcome = UnavailableTools
            .execute(ToolCall {
                call_id: "c-1".into(),
                tool_name: "edit_file".into(),
                arguments: Value::Null,
                requires_approval: true,
            })
            .await;
        match outcome {
            ToolOutcome::Failure(message) => assert!(message.contains("edit_file")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
