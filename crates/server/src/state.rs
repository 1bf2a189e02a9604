//! Application state

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info};

use opta_protocol::{DaemonEvent, SessionInfo};

use crate::background::{EventSink, Supervisor};
use crate::clock::now_ms;
use crate::config::SessionSettings;
use crate::operations::OperationExecutor;
use crate::session::{SessionHandle, SessionSeed};
use crate::session_actor::{ActorContext, SessionActorHandle};
use crate::session_command::SessionCommand;

/// Live sessions, one actor each.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionActorHandle>,
    daemon_id: String,
    default_model: String,
    settings: SessionSettings,
    ctx: ActorContext,
}

impl SessionRegistry {
    pub fn new(
        daemon_id: impl Into<String>,
        default_model: impl Into<String>,
        settings: SessionSettings,
        ctx: ActorContext,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            daemon_id: daemon_id.into(),
            default_model: default_model.into(),
            settings,
            ctx,
        }
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    pub fn backend_name(&self) -> &'static str {
        self.ctx.backend.name()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionActorHandle> {
        self.sessions
            .get(session_id)
            .map(|h| h.value().clone())
            .filter(|h| !h.is_closed())
    }

    /// Returns the session's actor and whether it was created by this call.
    pub fn get_or_create(&self, seed: SessionSeed) -> (SessionActorHandle, bool) {
        match self.sessions.entry(seed.session_id.clone()) {
            Entry::Occupied(existing) if !existing.get().is_closed() => {
                (existing.get().clone(), false)
            }
            Entry::Occupied(mut stale) => {
                let actor = self.spawn(seed);
                stale.insert(actor.clone());
                (actor, true)
            }
            Entry::Vacant(slot) => {
                let actor = self.spawn(seed);
                slot.insert(actor.clone());
                (actor, true)
            }
        }
    }

    fn spawn(&self, seed: SessionSeed) -> SessionActorHandle {
        info!(
            component = "registry",
            event = "session.created",
            session_id = %seed.session_id,
            model = ?seed.model,
        );
        let handle = SessionHandle::new(
            seed,
            &self.default_model,
            &self.daemon_id,
            &self.settings,
            now_ms(),
        );
        SessionActorHandle::spawn(handle, self.ctx.clone())
    }

    /// Info of every live session, oldest first.
    pub fn list(&self) -> Vec<Arc<SessionInfo>> {
        let mut infos: Vec<_> = self
            .sessions
            .iter()
            .filter(|h| !h.is_closed())
            .map(|h| h.info())
            .collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Stop and drop a session. Returns whether it was live.
    pub async fn remove(&self, session_id: &str) -> bool {
        let Some((_, actor)) = self.sessions.remove(session_id) else {
            return false;
        };
        actor
            .request(|reply| SessionCommand::Shutdown { reply })
            .await
            .is_some()
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|h| h.key().clone()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }
}

impl EventSink for SessionRegistry {
    fn publish(&self, session_id: &str, event: DaemonEvent) -> BoxFuture<'static, ()> {
        let Some(actor) = self.get(session_id) else {
            debug!(
                component = "registry",
                event = "registry.publish.no_session",
                session_id = %session_id,
                kind = event.name(),
            );
            return Box::pin(async {});
        };
        Box::pin(async move {
            actor
                .send(SessionCommand::Emit {
                    event: Box::new(event),
                })
                .await;
        })
    }
}

/// Shared state behind the HTTP and WebSocket routes.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub operations: Arc<OperationExecutor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn daemon_id(&self) -> &str {
        self.registry.daemon_id()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
