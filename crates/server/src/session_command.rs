//! Commands sent to a session actor from websocket/http/supervisor callers.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use opta_protocol::{DaemonEvent, Envelope, PermissionDecision, SessionSnapshot};

use crate::session::EventPage;
use crate::transition::{CancelTarget, EngineError, Input, PendingTurn};

/// What a client receives before live forwarding starts.
#[derive(Debug)]
pub enum AttachFrames {
    /// Every retained envelope after the client's cursor, in order.
    Replay(Vec<Arc<Envelope>>),
    /// Full state; carries the session's current `last_seq`.
    Snapshot(Box<Envelope>),
}

/// Result of attaching a client to a session.
pub struct Attachment {
    pub frames: AttachFrames,
    /// Highest seq delivered to this client; the forwarder advances it.
    pub cursor: Arc<AtomicU64>,
    pub rx: broadcast::Receiver<Arc<Envelope>>,
    pub last_seq: u64,
}

/// Reply to a turn submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAck {
    pub turn_id: String,
    /// 0 when the turn started immediately.
    pub position: usize,
}

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    // -- Clients --
    Attach {
        client_id: String,
        after_seq: Option<u64>,
        reply: oneshot::Sender<Attachment>,
    },
    /// A live forwarder lagged behind the broadcast and needs to catch up.
    Resync {
        client_id: String,
        after_seq: u64,
        reply: oneshot::Sender<Attachment>,
    },
    Detach {
        client_id: String,
    },

    // -- Turns --
    Submit {
        turn: Box<PendingTurn>,
        reply: oneshot::Sender<SubmitAck>,
    },
    ResolvePermission {
        request_id: String,
        decision: PermissionDecision,
        decided_by: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        target: CancelTarget,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// Backend stream, heartbeat, and timer inputs from the turn runner.
    Engine(Box<Input>),

    // -- Other producers --
    /// Sequence and publish an event from outside the turn engine.
    Emit {
        event: Box<DaemonEvent>,
    },

    // -- Queries --
    GetSnapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    ReadEvents {
        after_seq: u64,
        limit: usize,
        client_id: Option<String>,
        reply: oneshot::Sender<EventPage>,
    },

    /// Stop the actor, abandoning any running turn.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Resync { .. } => "resync",
            Self::Detach { .. } => "detach",
            Self::Submit { .. } => "submit",
            Self::ResolvePermission { .. } => "resolve_permission",
            Self::Cancel { .. } => "cancel",
            Self::Engine(_) => "engine",
            Self::Emit { .. } => "emit",
            Self::GetSnapshot { .. } => "get_snapshot",
            Self::ReadEvents { .. } => "read_events",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}
