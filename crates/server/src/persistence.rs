//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Batches writes so bursts of process status changes and finished turns
//! cost one transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use opta_protocol::{
    BackgroundProcessInfo, BackgroundState, StatusReason, TurnMode, TurnState, TurnStats,
};

use crate::migration_runner::CONNECTION_PRAGMAS;

/// A background process row plus the highest output seq it may have used,
/// so a restart after a daemon restart continues past every issued chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub info: BackgroundProcessInfo,
    pub last_seq: u64,
}

/// A finished turn, kept for search and export.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedTurn {
    pub turn_id: String,
    pub session_id: String,
    pub writer_id: String,
    pub client_id: String,
    pub mode: TurnMode,
    pub state: TurnState,
    pub prompt: String,
    pub response: String,
    pub stats: Option<TurnStats>,
    pub queued_at: u64,
    pub finished_at: u64,
}

/// Commands that can be persisted
#[derive(Debug)]
pub enum PersistCommand {
    ProcessUpsert(Box<ProcessRecord>),
    /// Raise a process's stored output seq; never lowers it.
    ProcessSeqReserve { process_id: String, last_seq: u64 },
    ProcessDelete { process_id: String },
    SessionProcessesDelete { session_id: String },
    TurnArchive(Box<ArchivedTurn>),
    SessionArchiveDelete { session_id: String },
    /// Flush everything queued so far, then reply.
    Flush { reply: oneshot::Sender<()> },
}

pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>) {
    mpsc::channel(1_024)
}

/// Open a connection with the daemon-wide pragmas applied.
pub fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;
    Ok(conn)
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run until every sender is dropped, flushing what is left on the way out.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(PersistCommand::Flush { reply }) => {
                        self.flush().await;
                        let _ = reply.send(());
                    }
                    Some(cmd) => {
                        self.batch.push(cmd);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.flush().await;
        info!(
            component = "persistence",
            event = "persistence.stopped",
        );
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    count = count,
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                );
            }
        }
    }
}

fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open_db(db_path)?;
    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
            );
        }
    }

    tx.commit()?;
    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::ProcessUpsert(record) => {
            let info = &record.info;
            conn.execute(
                "INSERT INTO background_processes (
                    process_id, session_id, pid, command, cwd, label, state, reason,
                    exit_code, signal, started_at, ended_at, runtime_ms, timeout_ms,
                    restarted_from, last_seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(process_id) DO UPDATE SET
                    pid = ?3, state = ?7, reason = ?8, exit_code = ?9, signal = ?10,
                    ended_at = ?12, runtime_ms = ?13, last_seq = MAX(last_seq, ?16)",
                params![
                    info.process_id,
                    info.session_id,
                    info.pid,
                    info.command,
                    info.cwd,
                    info.label,
                    info.state.as_str(),
                    info.reason.map(StatusReason::as_str),
                    info.exit_code,
                    info.signal,
                    info.started_at as i64,
                    info.ended_at.map(|v| v as i64),
                    info.runtime_ms.map(|v| v as i64),
                    info.timeout_ms.map(|v| v as i64),
                    info.restarted_from,
                    record.last_seq as i64,
                ],
            )?;
        }

        PersistCommand::ProcessSeqReserve {
            process_id,
            last_seq,
        } => {
            conn.execute(
                "UPDATE background_processes SET last_seq = MAX(last_seq, ?2) WHERE process_id = ?1",
                params![process_id, last_seq as i64],
            )?;
        }

        PersistCommand::ProcessDelete { process_id } => {
            conn.execute(
                "DELETE FROM background_processes WHERE process_id = ?1",
                params![process_id],
            )?;
        }

        PersistCommand::SessionProcessesDelete { session_id } => {
            conn.execute(
                "DELETE FROM background_processes WHERE session_id = ?1",
                params![session_id],
            )?;
        }

        PersistCommand::TurnArchive(turn) => {
            let stats = turn
                .stats
                .as_ref()
                .and_then(|s| serde_json::to_string(s).ok());
            conn.execute(
                "INSERT OR REPLACE INTO session_turns (
                    turn_id, session_id, writer_id, client_id, mode, state,
                    prompt, response, stats, queued_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    turn.turn_id,
                    turn.session_id,
                    turn.writer_id,
                    turn.client_id,
                    turn.mode.to_string(),
                    turn.state.as_str(),
                    turn.prompt,
                    turn.response,
                    stats,
                    turn.queued_at as i64,
                    turn.finished_at as i64,
                ],
            )?;
        }

        PersistCommand::SessionArchiveDelete { session_id } => {
            conn.execute(
                "DELETE FROM session_turns WHERE session_id = ?1",
                params![session_id],
            )?;
        }

        PersistCommand::Flush { reply } => {
            let _ = reply.send(());
        }
    }

    Ok(())
}

fn parse_turn_mode(value: &str) -> TurnMode {
    match value {
        "do" => TurnMode::Do,
        _ => TurnMode::Chat,
    }
}

// ---------------------------------------------------------------------------
// Loaders (sync; call from spawn_blocking or startup)
// ---------------------------------------------------------------------------

/// Every background process row, oldest first.
pub fn load_process_records(db_path: &Path) -> rusqlite::Result<Vec<ProcessRecord>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT process_id, session_id, pid, command, cwd, label, state, reason,
                exit_code, signal, started_at, ended_at, runtime_ms, timeout_ms,
                restarted_from, last_seq
         FROM background_processes
         ORDER BY started_at ASC",
    )?;

    let rows = stmt.query_map([], |row| {
        let state: String = row.get(6)?;
        let reason: Option<String> = row.get(7)?;
        Ok(ProcessRecord {
            info: BackgroundProcessInfo {
                process_id: row.get(0)?,
                session_id: row.get(1)?,
                pid: row.get(2)?,
                command: row.get(3)?,
                cwd: row.get(4)?,
                label: row.get(5)?,
                state: BackgroundState::parse(&state).unwrap_or(BackgroundState::Failed),
                reason: reason.as_deref().and_then(StatusReason::parse),
                exit_code: row.get(8)?,
                signal: row.get(9)?,
                started_at: row.get::<_, i64>(10)? as u64,
                ended_at: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
                runtime_ms: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
                timeout_ms: row.get::<_, Option<i64>>(13)?.map(|v| v as u64),
                restarted_from: row.get(14)?,
            },
            last_seq: row.get::<_, i64>(15)? as u64,
        })
    })?;

    rows.collect()
}

fn archived_turn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchivedTurn> {
    let mode: String = row.get(4)?;
    let state: String = row.get(5)?;
    let stats: Option<String> = row.get(8)?;
    Ok(ArchivedTurn {
        turn_id: row.get(0)?,
        session_id: row.get(1)?,
        writer_id: row.get(2)?,
        client_id: row.get(3)?,
        mode: parse_turn_mode(&mode),
        state: TurnState::parse(&state).unwrap_or(TurnState::Error),
        prompt: row.get(6)?,
        response: row.get(7)?,
        stats: stats.and_then(|s| serde_json::from_str(&s).ok()),
        queued_at: row.get::<_, i64>(9)? as u64,
        finished_at: row.get::<_, i64>(10)? as u64,
    })
}

const TURN_COLUMNS: &str = "turn_id, session_id, writer_id, client_id, mode, state,
                            prompt, response, stats, queued_at, finished_at";

/// Archived turns of one session in completion order.
pub fn load_session_turns(db_path: &Path, session_id: &str) -> rusqlite::Result<Vec<ArchivedTurn>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURN_COLUMNS} FROM session_turns WHERE session_id = ?1 ORDER BY finished_at ASC"
    ))?;
    let rows = stmt.query_map(params![session_id], archived_turn_from_row)?;
    rows.collect()
}

/// Case-insensitive substring search over prompts and responses, newest first.
pub fn search_turns(db_path: &Path, query: &str, limit: usize) -> rusqlite::Result<Vec<ArchivedTurn>> {
    let conn = open_db(db_path)?;
    let pattern = format!(
        "%{}%",
        query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    );
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURN_COLUMNS} FROM session_turns
         WHERE prompt LIKE ?1 ESCAPE '\\' OR response LIKE ?1 ESCAPE '\\'
         ORDER BY finished_at DESC
         LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![pattern, limit as i64], archived_turn_from_row)?;
    rows.collect()
}

/// Session ids present in the archive with their turn counts.
pub fn archived_session_ids(db_path: &Path) -> rusqlite::Result<Vec<(String, u64)>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT session_id, COUNT(*) FROM session_turns GROUP BY session_id ORDER BY MAX(finished_at) DESC",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?;
    rows.collect()
}

#[cfg(test)]
fn process_exists(db_path: &Path, process_id: &str) -> rusqlite::Result<bool> {
    use rusqlite::OptionalExtension;

    let conn = open_db(db_path)?;
    conn.query_row(
        "SELECT 1 FROM background_processes WHERE process_id = ?1",
        params![process_id],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}
