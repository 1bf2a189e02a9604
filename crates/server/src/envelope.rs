//! Outbound frame construction.
//!
//! `EnvelopeCodec::emit` is the only way a sequenced envelope is produced.
//! Each session actor owns exactly one codec, so seq allocation is serialized
//! by the actor's command loop.

use opta_protocol::{DaemonEvent, Envelope, ErrorBody, PROTOCOL_VERSION};

#[derive(Debug)]
pub struct EnvelopeCodec {
    daemon_id: String,
    session_id: String,
    last_seq: u64,
}

impl EnvelopeCodec {
    pub fn new(daemon_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            session_id: session_id.into(),
            last_seq: 0,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Assign the next seq (first is 1, no gaps) and stamp `now`.
    pub fn emit(&mut self, event: DaemonEvent, now: u64) -> Envelope {
        self.last_seq += 1;
        Envelope {
            version: PROTOCOL_VERSION,
            event,
            daemon_id: self.daemon_id.clone(),
            session_id: Some(self.session_id.clone()),
            seq: self.last_seq,
            timestamp: now,
        }
    }

    /// Snapshot frames reuse the current `last_seq` so they do not consume a
    /// slot; a client resuming from a snapshot passes that seq as `afterSeq`.
    pub fn snapshot_frame(&self, event: DaemonEvent, now: u64) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            event,
            daemon_id: self.daemon_id.clone(),
            session_id: Some(self.session_id.clone()),
            seq: self.last_seq,
            timestamp: now,
        }
    }
}

/// Connection-level error frame. Carries seq 0: it belongs to no session stream.
pub fn error_frame(
    daemon_id: &str,
    session_id: Option<&str>,
    error: ErrorBody,
    now: u64,
) -> Envelope {
    Envelope {
        version: PROTOCOL_VERSION,
        event: DaemonEvent::Error(error),
        daemon_id: daemon_id.to_string(),
        session_id: session_id.map(str::to_string),
        seq: 0,
        timestamp: now,
    }
}
