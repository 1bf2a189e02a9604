//! Session management
//!
//! `SessionHandle` is the state a single session actor owns: the envelope
//! codec, the replay buffer, the live broadcast, the turn engine state, and
//! the cursors of every client that has attached.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::broadcast;

use opta_protocol::{
    BackgroundProcessInfo, DaemonEvent, Envelope, SessionInfo, SessionSnapshot, SnapshotReason,
};

use crate::config::SessionSettings;
use crate::envelope::EnvelopeCodec;
use crate::replay::{Replay, ReplayBuffer};
use crate::session_command::{AttachFrames, Attachment};
use crate::transition::{self, Effect, EngineError, Input, TurnEngineState};

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub session_id: String,
    pub model: Option<String>,
    pub title: Option<String>,
}

/// One page of `GET /sessions/{id}/events`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<Envelope>,
    pub next_seq: u64,
    pub has_more: bool,
    /// Present when the cursor fell outside the replay window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Envelope>,
}

struct ClientCursor {
    acked: Arc<AtomicU64>,
    attachments: usize,
    detached_at: Option<u64>,
}

/// Handle to a running session
pub struct SessionHandle {
    id: String,
    model: String,
    title: Option<String>,
    created_at: u64,
    updated_at: u64,
    codec: EnvelopeCodec,
    replay: ReplayBuffer,
    events_tx: broadcast::Sender<Arc<Envelope>>,
    engine: TurnEngineState,
    clients: HashMap<String, ClientCursor>,
    background: BTreeMap<String, BackgroundProcessInfo>,
    client_retention_ms: u64,
    info: Arc<ArcSwap<SessionInfo>>,
}

impl SessionHandle {
    pub fn new(
        seed: SessionSeed,
        default_model: &str,
        daemon_id: &str,
        settings: &SessionSettings,
        now: u64,
    ) -> Self {
        let model = seed
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model.to_string());
        let (events_tx, _) = broadcast::channel(settings.broadcast_capacity.max(16));
        let mut handle = Self {
            engine: TurnEngineState::new(&seed.session_id, &model, settings.recent_turns),
            codec: EnvelopeCodec::new(daemon_id, &seed.session_id),
            replay: ReplayBuffer::new(settings.replay_capacity, settings.replay_hard_limit),
            id: seed.session_id,
            model,
            title: seed.title,
            created_at: now,
            updated_at: now,
            events_tx,
            clients: HashMap::new(),
            background: BTreeMap::new(),
            client_retention_ms: settings.client_retention().as_millis() as u64,
            info: Arc::new(ArcSwap::from_pointee(placeholder_info())),
        };
        handle.refresh_info();
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_seq(&self) -> u64 {
        self.codec.last_seq()
    }

    pub fn engine(&self) -> &TurnEngineState {
        &self.engine
    }

    pub fn info_arc(&self) -> Arc<ArcSwap<SessionInfo>> {
        self.info.clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            model: self.model.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            active_turn_id: self.engine.active_turn_id().map(str::to_string),
            queued_turn_count: self.engine.queue.len(),
            tool_call_count: self.engine.tool_call_count,
            writer_count: self.engine.writer_count(),
            last_seq: self.codec.last_seq(),
        }
    }

    /// Publish the current info for lock-free readers.
    pub fn refresh_info(&self) {
        self.info.store(Arc::new(self.info()));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.info(),
            active_turn: self.engine.active_summary(),
            queued_turns: self.engine.queued_summaries(),
            recent_turns: self.engine.recent.iter().cloned().collect(),
            pending_permission: self.engine.pending_permission(),
            background_processes: self.background.values().cloned().collect(),
        }
    }

    fn snapshot_frame(&self, reason: SnapshotReason, now: u64) -> Envelope {
        self.codec.snapshot_frame(
            DaemonEvent::SessionSnapshot {
                reason,
                snapshot: Box::new(self.snapshot()),
            },
            now,
        )
    }

    // -- Turn engine ------------------------------------------------------------

    pub fn validate(&self, input: &Input) -> Result<(), EngineError> {
        transition::validate(&self.engine, input)
    }

    /// Run one input through the engine. Emit effects are left to the caller
    /// so they are sequenced in the same order as the rest.
    pub fn apply(&mut self, input: Input, now: u64) -> Vec<Effect> {
        let state = std::mem::take(&mut self.engine);
        let (state, effects) = transition::transition(state, input, now);
        self.engine = state;
        effects
    }

    // -- Emission ---------------------------------------------------------------

    /// Sequence `event`, retain it for replay, and fan it out live.
    pub fn emit(&mut self, event: DaemonEvent, now: u64) -> Arc<Envelope> {
        if let DaemonEvent::BackgroundStatus { process, .. } = &event {
            self.background
                .insert(process.process_id.clone(), process.clone());
        }
        let envelope = Arc::new(self.codec.emit(event, now));
        self.updated_at = now;
        self.replay.push(envelope.clone(), self.min_ack());
        // No receivers is fine; replay still has it.
        let _ = self.events_tx.send(envelope.clone());
        envelope
    }

    fn min_ack(&self) -> Option<u64> {
        self.clients
            .values()
            .map(|c| c.acked.load(Ordering::Relaxed))
            .min()
    }

    // -- Clients ----------------------------------------------------------------

    /// Attach a client. The broadcast receiver is created before the replay
    /// is cut, so nothing emitted afterwards can fall between the two.
    pub fn attach(&mut self, client_id: &str, after_seq: Option<u64>, now: u64) -> Attachment {
        let rx = self.events_tx.subscribe();
        let last_seq = self.codec.last_seq();

        let frames = match after_seq {
            Some(after) => match self.replay.since(after, last_seq) {
                Replay::Events(events) => AttachFrames::Replay(events),
                Replay::Gap => AttachFrames::Snapshot(Box::new(
                    self.snapshot_frame(SnapshotReason::ReplayUnavailable, now),
                )),
            },
            None => AttachFrames::Snapshot(Box::new(
                self.snapshot_frame(SnapshotReason::Initial, now),
            )),
        };
        let start = match &frames {
            AttachFrames::Replay(_) => after_seq.unwrap_or(0),
            AttachFrames::Snapshot(_) => last_seq,
        };

        let cursor = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientCursor {
                acked: Arc::new(AtomicU64::new(start)),
                attachments: 0,
                detached_at: None,
            });
        cursor.acked.store(start, Ordering::Relaxed);
        cursor.attachments += 1;
        cursor.detached_at = None;

        Attachment {
            frames,
            cursor: cursor.acked.clone(),
            rx,
            last_seq,
        }
    }

    /// Re-attach a live forwarder that lagged behind the broadcast.
    pub fn resync(&mut self, client_id: &str, after_seq: u64, now: u64) -> Attachment {
        let mut attachment = self.attach(client_id, Some(after_seq), now);
        if let Some(cursor) = self.clients.get_mut(client_id) {
            // `attach` counted this as a new connection.
            cursor.attachments = cursor.attachments.saturating_sub(1).max(1);
        }
        if let AttachFrames::Snapshot(frame) = &mut attachment.frames {
            if let DaemonEvent::SessionSnapshot { reason, .. } = &mut frame.event {
                *reason = SnapshotReason::Resync;
            }
        }
        attachment
    }

    pub fn detach(&mut self, client_id: &str, now: u64) {
        if let Some(cursor) = self.clients.get_mut(client_id) {
            cursor.attachments = cursor.attachments.saturating_sub(1);
            if cursor.attachments == 0 {
                cursor.detached_at = Some(now);
            }
        }
    }

    /// Forget clients detached longer than the retention window, then let the
    /// replay buffer release what only they were holding.
    pub fn expire_clients(&mut self, now: u64) -> usize {
        let retention = self.client_retention_ms;
        let before = self.clients.len();
        self.clients.retain(|_, c| match c.detached_at {
            Some(at) => now.saturating_sub(at) < retention,
            None => true,
        });
        let expired = before - self.clients.len();
        self.replay.evict(self.min_ack());
        expired
    }

    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Cursor-based polling. A known `client_id` acknowledges `after_seq`.
    pub fn read_events(
        &mut self,
        after_seq: u64,
        limit: usize,
        client_id: Option<&str>,
        now: u64,
    ) -> EventPage {
        if let Some(client_id) = client_id {
            let cursor = self
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientCursor {
                    acked: Arc::new(AtomicU64::new(after_seq)),
                    attachments: 0,
                    detached_at: None,
                });
            cursor.acked.fetch_max(after_seq, Ordering::Relaxed);
            if cursor.attachments == 0 {
                cursor.detached_at = Some(now);
            }
        }

        let last_seq = self.codec.last_seq();
        match self.replay.page(after_seq, last_seq, limit.max(1)) {
            Replay::Events(events) => {
                let next_seq = events.last().map(|e| e.seq).unwrap_or(after_seq);
                EventPage {
                    events: events.iter().map(|e| e.as_ref().clone()).collect(),
                    next_seq,
                    has_more: next_seq < last_seq,
                    snapshot: None,
                }
            }
            Replay::Gap => EventPage {
                events: Vec::new(),
                next_seq: last_seq,
                has_more: false,
                snapshot: Some(self.snapshot_frame(SnapshotReason::ReplayUnavailable, now)),
            },
        }
    }
}

fn placeholder_info() -> SessionInfo {
    SessionInfo {
        session_id: String::new(),
        model: String::new(),
        title: None,
        created_at: 0,
        updated_at: 0,
        active_turn_id: None,
        queued_turn_count: 0,
        tool_call_count: 0,
        writer_count: 0,
        last_seq: 0,
    }
}
