//! Background process supervisor.
//!
//! Every process runs as `sh -c <command>` in its own process group, so a
//! signal reaches everything the command spawned. Status changes and output
//! are published to the owning session through an [`EventSink`], and each
//! status change is mirrored to SQLite so a restarted daemon can reconcile or
//! adopt whatever was still running.

mod monitor;
mod output;
mod signal;

pub use output::OutputBuffer;
pub use signal::{parse_signal, process_alive, signal_name};

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use opta_protocol::{
    new_prefixed_id, BackgroundProcessInfo, BackgroundState, DaemonEvent, OutputSlice,
    OutputStream, StatusReason, StreamFilter,
};

use crate::clock::now_ms;
use crate::config::BackgroundSettings;
use crate::persistence::{PersistCommand, ProcessRecord};

/// Output seqs are reserved in SQLite this many at a time, ahead of use, so
/// a daemon that dies mid-run never hands out a seq twice after recovery.
const SEQ_RESERVE_BLOCK: u64 = 256;

/// Where supervisor events go. Implemented by the session registry.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, session_id: &str, event: DaemonEvent) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("background process {0} not found")]
    NotFound(String),
    #[error("background process {0} is not running")]
    NotRunning(String),
    #[error("background process {0} is still running")]
    StillRunning(String),
    #[error("unsupported signal: {0}")]
    InvalidSignal(String),
    #[error("failed to signal {process_id}: {source}")]
    Signal {
        process_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "process-not-found",
            Self::NotRunning(_) => "process-not-running",
            Self::StillRunning(_) => "process-running",
            Self::InvalidSignal(_) => "invalid-signal",
            Self::Signal { .. } => "signal-failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    pub timeout_ms: Option<u64>,
    pub label: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub reconciled: usize,
    pub adopted: usize,
}

struct ProcessEntry {
    info: Mutex<BackgroundProcessInfo>,
    output: Mutex<OutputBuffer>,
    /// Highest output seq already reserved in the database.
    seq_reserved: Mutex<u64>,
    /// Signal of the most recent explicit kill request.
    kill_signal: Mutex<Option<i32>>,
}

impl ProcessEntry {
    fn new(info: BackgroundProcessInfo, output: OutputBuffer) -> Self {
        let reserved = output.last_seq();
        Self {
            info: Mutex::new(info),
            output: Mutex::new(output),
            seq_reserved: Mutex::new(reserved),
            kill_signal: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> BackgroundProcessInfo {
        lock(&self.info).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Supervisor {
    processes: DashMap<String, Arc<ProcessEntry>>,
    settings: BackgroundSettings,
    sink: Arc<dyn EventSink>,
    persist_tx: mpsc::Sender<PersistCommand>,
}

impl Supervisor {
    pub fn new(
        settings: BackgroundSettings,
        sink: Arc<dyn EventSink>,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
            settings,
            sink,
            persist_tx,
        })
    }

    pub async fn start(self: &Arc<Self>, request: StartRequest) -> BackgroundProcessInfo {
        self.launch(new_prefixed_id("bg"), request, 0, None).await
    }

    /// Run a finished process's command again under a new id.
    pub async fn restart(
        self: &Arc<Self>,
        process_id: &str,
    ) -> Result<BackgroundProcessInfo, SupervisorError> {
        let entry = self.entry(process_id)?;
        let (request, last_seq) = {
            let info = lock(&entry.info);
            if !info.state.is_terminal() {
                return Err(SupervisorError::StillRunning(process_id.to_string()));
            }
            let request = StartRequest {
                session_id: info.session_id.clone(),
                command: info.command.clone(),
                cwd: info.cwd.clone(),
                timeout_ms: info.timeout_ms,
                label: info.label.clone(),
            };
            (request, lock(&entry.output).last_seq())
        };
        Ok(self
            .launch(
                new_prefixed_id("bg"),
                request,
                last_seq,
                Some(process_id.to_string()),
            )
            .await)
    }

    async fn launch(
        self: &Arc<Self>,
        process_id: String,
        request: StartRequest,
        start_seq: u64,
        restarted_from: Option<String>,
    ) -> BackgroundProcessInfo {
        let timeout_ms = request
            .timeout_ms
            .or(self.settings.default_timeout_ms)
            .filter(|ms| *ms > 0);
        let info = BackgroundProcessInfo {
            process_id: process_id.clone(),
            session_id: request.session_id.clone(),
            pid: None,
            command: request.command.clone(),
            cwd: request.cwd.clone(),
            label: request.label.clone(),
            state: BackgroundState::Running,
            reason: Some(StatusReason::Started),
            exit_code: None,
            signal: None,
            started_at: now_ms(),
            ended_at: None,
            runtime_ms: None,
            timeout_ms,
            restarted_from,
        };
        let output = OutputBuffer::new(
            self.settings.output_retention,
            self.settings.output_hard_limit,
            start_seq,
        );
        let entry = Arc::new(ProcessEntry::new(info, output));
        self.processes.insert(process_id.clone(), entry.clone());

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    component = "background",
                    event = "background.spawn_failed",
                    process_id = %process_id,
                    session_id = %request.session_id,
                    error = %err,
                    "Failed to spawn background process"
                );
                return self
                    .finish(&entry, BackgroundState::Failed, StatusReason::SpawnError, None, None)
                    .await;
            }
        };

        let started = {
            let mut info = lock(&entry.info);
            info.pid = child.id();
            info.clone()
        };
        info!(
            component = "background",
            event = "background.started",
            process_id = %process_id,
            session_id = %started.session_id,
            pid = ?started.pid,
            timeout_ms = ?timeout_ms,
        );

        self.record(&entry).await;
        self.sink
            .publish(
                &started.session_id,
                DaemonEvent::BackgroundStatus {
                    process: started.clone(),
                    previous_state: None,
                    reason: StatusReason::Started,
                    signal: None,
                },
            )
            .await;

        monitor::spawn_child_monitor(
            self.clone(),
            entry,
            child,
            timeout_ms.map(Duration::from_millis),
        );
        started
    }

    /// Request termination. The process exits asynchronously; the returned
    /// info is the state at the time of the request.
    pub async fn kill(
        self: &Arc<Self>,
        process_id: &str,
        signal: Option<&str>,
    ) -> Result<BackgroundProcessInfo, SupervisorError> {
        let entry = self.entry(process_id)?;
        let sig = match signal {
            Some(name) => {
                parse_signal(name).ok_or_else(|| SupervisorError::InvalidSignal(name.to_string()))?
            }
            None => libc::SIGTERM,
        };

        let info = entry.snapshot();
        let pgid = match (info.state, info.pid) {
            (BackgroundState::Running, Some(pid)) => pid,
            _ => return Err(SupervisorError::NotRunning(process_id.to_string())),
        };

        *lock(&entry.kill_signal) = Some(sig);
        if let Err(source) = signal::signal_group(pgid, sig) {
            // Already gone; the monitor will record the exit.
            if source.raw_os_error() != Some(libc::ESRCH) {
                return Err(SupervisorError::Signal {
                    process_id: process_id.to_string(),
                    source,
                });
            }
        }
        info!(
            component = "background",
            event = "background.kill_requested",
            process_id = %process_id,
            signal = %signal_name(sig),
        );

        if sig != libc::SIGKILL {
            let grace = self.settings.kill_grace();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if lock(&entry.info).state == BackgroundState::Running {
                    *lock(&entry.kill_signal) = Some(libc::SIGKILL);
                    let _ = signal::signal_group(pgid, libc::SIGKILL);
                }
            });
        }

        Ok(info)
    }

    pub fn get(&self, process_id: &str) -> Option<BackgroundProcessInfo> {
        self.processes.get(process_id).map(|e| e.snapshot())
    }

    pub fn list(&self, session_id: Option<&str>) -> Vec<BackgroundProcessInfo> {
        let mut processes: Vec<_> = self
            .processes
            .iter()
            .map(|e| e.snapshot())
            .filter(|info| session_id.map_or(true, |id| info.session_id == id))
            .collect();
        processes.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.process_id.cmp(&b.process_id))
        });
        processes
    }

    pub fn running_count(&self) -> usize {
        self.processes
            .iter()
            .filter(|e| lock(&e.info).state == BackgroundState::Running)
            .count()
    }

    pub fn read_output(
        &self,
        process_id: &str,
        after_seq: u64,
        limit: usize,
        filter: StreamFilter,
        reader: Option<&str>,
    ) -> Result<OutputSlice, SupervisorError> {
        let entry = self.entry(process_id)?;
        let limit = limit.clamp(1, self.settings.read_limit_max.max(1));
        let slice = lock(&entry.output).read(process_id, after_seq, limit, filter, reader);
        Ok(slice)
    }

    /// Force-kill and forget every process of a deleted session.
    pub async fn remove_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .processes
            .iter()
            .filter(|e| lock(&e.info).session_id == session_id)
            .map(|e| e.key().clone())
            .collect();

        for id in &ids {
            let Some((_, entry)) = self.processes.remove(id) else {
                continue;
            };
            let info = entry.snapshot();
            if let (BackgroundState::Running, Some(pgid)) = (info.state, info.pid) {
                *lock(&entry.kill_signal) = Some(libc::SIGKILL);
                let _ = signal::signal_group(pgid, libc::SIGKILL);
            }
        }

        self.persist(PersistCommand::SessionProcessesDelete {
            session_id: session_id.to_string(),
        })
        .await;
        ids.len()
    }

    /// Load persisted rows at startup. Rows still `running` are adopted when
    /// their pid is alive and failed otherwise.
    pub async fn recover(self: &Arc<Self>, records: Vec<ProcessRecord>) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for ProcessRecord { info, last_seq } in records {
            let output = OutputBuffer::new(
                self.settings.output_retention,
                self.settings.output_hard_limit,
                last_seq,
            );
            let process_id = info.process_id.clone();
            let running = info.state == BackgroundState::Running;
            let pid = info.pid;
            let entry = Arc::new(ProcessEntry::new(info, output));
            self.processes.insert(process_id.clone(), entry.clone());
            report.loaded += 1;

            if !running {
                continue;
            }
            match pid.filter(|pid| process_alive(*pid)) {
                Some(pid) => {
                    report.adopted += 1;
                    info!(
                        component = "background",
                        event = "background.adopted",
                        process_id = %process_id,
                        pid = pid,
                    );
                    monitor::spawn_adopted_monitor(self.clone(), entry, pid);
                }
                None => {
                    report.reconciled += 1;
                    self.finish(&entry, BackgroundState::Failed, StatusReason::SpawnError, None, None)
                        .await;
                }
            }
        }

        info!(
            component = "background",
            event = "background.recovered",
            loaded = report.loaded,
            reconciled = report.reconciled,
            adopted = report.adopted,
        );
        report
    }

    fn entry(&self, process_id: &str) -> Result<Arc<ProcessEntry>, SupervisorError> {
        self.processes
            .get(process_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SupervisorError::NotFound(process_id.to_string()))
    }

    async fn record(&self, entry: &ProcessEntry) {
        let last_seq = lock(&entry.output).last_seq();
        let record = ProcessRecord {
            info: entry.snapshot(),
            last_seq: last_seq.max(*lock(&entry.seq_reserved)),
        };
        // A deleted session's processes must not come back.
        if !self.processes.contains_key(&record.info.process_id) {
            return;
        }
        self.persist(PersistCommand::ProcessUpsert(Box::new(record)))
            .await;
    }

    async fn persist(&self, cmd: PersistCommand) {
        if self.persist_tx.send(cmd).await.is_err() {
            warn!(
                component = "background",
                event = "background.persist_dropped",
                "Persistence channel closed"
            );
        }
    }

    /// Append one chunk to the process's buffer and publish it. Crossing the
    /// reserved seq extends the reservation before the chunk goes out.
    async fn emit_output(&self, entry: &ProcessEntry, stream: OutputStream, text: String) {
        let chunk = lock(&entry.output).push(stream, text, now_ms());
        let reserve = {
            let mut reserved = lock(&entry.seq_reserved);
            if chunk.seq > *reserved {
                *reserved = chunk.seq + SEQ_RESERVE_BLOCK;
                Some(*reserved)
            } else {
                None
            }
        };
        let (process_id, session_id) = {
            let info = lock(&entry.info);
            (info.process_id.clone(), info.session_id.clone())
        };

        if let Some(last_seq) = reserve {
            self.persist(PersistCommand::ProcessSeqReserve {
                process_id: process_id.clone(),
                last_seq,
            })
            .await;
        }
        if self.settings.stream_output_events {
            self.sink
                .publish(
                    &session_id,
                    DaemonEvent::BackgroundOutput { process_id, chunk },
                )
                .await;
        }
    }

    /// Move a running process to a terminal state, persist, and publish.
    /// A second call for the same process is a no-op.
    async fn finish(
        &self,
        entry: &ProcessEntry,
        state: BackgroundState,
        reason: StatusReason,
        exit_code: Option<i32>,
        signal: Option<String>,
    ) -> BackgroundProcessInfo {
        let now = now_ms();
        let (info, previous) = {
            let mut info = lock(&entry.info);
            let previous = info.state;
            if previous.is_terminal() {
                return info.clone();
            }
            info.state = state;
            info.reason = Some(reason);
            info.exit_code = exit_code;
            info.signal = signal.clone();
            info.ended_at = Some(now);
            info.runtime_ms = Some(now.saturating_sub(info.started_at));
            (info.clone(), previous)
        };

        info!(
            component = "background",
            event = "background.finished",
            process_id = %info.process_id,
            session_id = %info.session_id,
            state = info.state.as_str(),
            reason = reason.as_str(),
            exit_code = ?exit_code,
            signal = ?signal,
            runtime_ms = ?info.runtime_ms,
        );

        self.record(entry).await;
        self.sink
            .publish(
                &info.session_id,
                DaemonEvent::BackgroundStatus {
                    process: info.clone(),
                    previous_state: Some(previous),
                    reason,
                    signal,
                },
            )
            .await;
        info
    }
}
