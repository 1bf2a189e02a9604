//! `sessions.*`: live registry plus the finished-turn archive.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use opta_protocol::{Safety, SessionInfo, SessionSnapshot, TurnMode, TurnState, TurnStats};

use super::{op, NoInput, OpContext, OperationError, OperationSpec};
use crate::persistence::{
    archived_session_ids, load_session_turns, search_turns, ArchivedTurn, PersistCommand,
};
use crate::session_command::SessionCommand;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 200;

pub(super) fn specs() -> Vec<OperationSpec> {
    vec![
        op(
            "sessions.list",
            "List sessions",
            "Live sessions and sessions with archived turns.",
            Safety::Read,
            sessions_list,
        ),
        op(
            "sessions.search",
            "Search sessions",
            "Find finished turns whose prompt or response contains the query.",
            Safety::Read,
            sessions_search,
        ),
        op(
            "sessions.export",
            "Export session",
            "Current snapshot and full archived transcript of one session.",
            Safety::Read,
            sessions_export,
        ),
        op(
            "sessions.delete",
            "Delete session",
            "Stop a session, kill its background processes, and erase its archive.",
            Safety::Dangerous,
            sessions_delete,
        ),
    ]
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnRecord {
    turn_id: String,
    session_id: String,
    writer_id: String,
    client_id: String,
    mode: TurnMode,
    state: TurnState,
    prompt: String,
    response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<TurnStats>,
    queued_at: u64,
    finished_at: u64,
}

impl From<ArchivedTurn> for TurnRecord {
    fn from(turn: ArchivedTurn) -> Self {
        Self {
            turn_id: turn.turn_id,
            session_id: turn.session_id,
            writer_id: turn.writer_id,
            client_id: turn.client_id,
            mode: turn.mode,
            state: turn.state,
            prompt: turn.prompt,
            response: turn.response,
            stats: turn.stats,
            queued_at: turn.queued_at,
            finished_at: turn.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchivedSession {
    session_id: String,
    turn_count: u64,
    live: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListing {
    live: Vec<SessionInfo>,
    archived: Vec<ArchivedSession>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Search {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionRef {
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionExport {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<SessionSnapshot>,
    turns: Vec<TurnRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDeleted {
    session_id: String,
    was_live: bool,
    processes_removed: usize,
}

async fn sessions_list(ctx: Arc<OpContext>, _: NoInput) -> Result<SessionListing, OperationError> {
    let live: Vec<SessionInfo> = ctx
        .registry
        .list()
        .into_iter()
        .map(|info| (*info).clone())
        .collect();
    let archived = ctx
        .store
        .run(|s| Ok(archived_session_ids(s.db_path())?))
        .await?
        .into_iter()
        .map(|(session_id, turn_count)| ArchivedSession {
            live: live.iter().any(|i| i.session_id == session_id),
            session_id,
            turn_count,
        })
        .collect();
    Ok(SessionListing { live, archived })
}

async fn sessions_search(ctx: Arc<OpContext>, input: Search) -> Result<Vec<TurnRecord>, OperationError> {
    let query = input.query.trim().to_string();
    if query.is_empty() {
        return Err(OperationError::InvalidInput("query must not be empty".into()));
    }
    let limit = input
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    let turns = ctx
        .store
        .run(move |s| Ok(search_turns(s.db_path(), &query, limit)?))
        .await?;
    Ok(turns.into_iter().map(TurnRecord::from).collect())
}

async fn sessions_export(ctx: Arc<OpContext>, input: SessionRef) -> Result<SessionExport, OperationError> {
    let snapshot = match ctx.registry.get(&input.session_id) {
        Some(actor) => {
            actor
                .request(|reply| SessionCommand::GetSnapshot { reply })
                .await
        }
        None => None,
    };
    let session_id = input.session_id.clone();
    let turns = ctx
        .store
        .run(move |s| Ok(load_session_turns(s.db_path(), &session_id)?))
        .await?;

    if snapshot.is_none() && turns.is_empty() {
        return Err(OperationError::NotFound(format!(
            "session `{}`",
            input.session_id
        )));
    }
    Ok(SessionExport {
        session_id: input.session_id,
        snapshot,
        turns: turns.into_iter().map(TurnRecord::from).collect(),
    })
}

async fn sessions_delete(ctx: Arc<OpContext>, input: SessionRef) -> Result<SessionDeleted, OperationError> {
    let session_id = input.session_id;
    let was_live = ctx.registry.remove(&session_id).await;
    let processes_removed = ctx.supervisor.remove_session(&session_id).await;

    let (reply, flushed) = oneshot::channel();
    let sent = ctx
        .persist_tx
        .send(PersistCommand::SessionArchiveDelete {
            session_id: session_id.clone(),
        })
        .await
        .is_ok()
        && ctx
            .persist_tx
            .send(PersistCommand::Flush { reply })
            .await
            .is_ok();
    if !sent || flushed.await.is_err() {
        warn!(
            component = "operations",
            event = "sessions.delete.unflushed",
            session_id = %session_id,
        );
        return Err(OperationError::Unavailable(
            "persistence is not running".into(),
        ));
    }

    info!(
        component = "operations",
        event = "sessions.deleted",
        session_id = %session_id,
        was_live = was_live,
        processes_removed = processes_removed,
    );
    Ok(SessionDeleted {
        session_id,
        was_live,
        processes_removed,
    })
}
