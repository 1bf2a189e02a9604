//! Per-process monitor tasks.
//!
//! A spawned child gets one task that waits for exit or its deadline plus one
//! reader task per output pipe. A process adopted after a daemon restart is
//! not our child, so it is polled with `kill(pid, 0)` instead.

use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use opta_protocol::{BackgroundState, OutputStream, StatusReason};

use super::signal::{process_alive, signal_group, signal_name};
use super::{lock, ProcessEntry, Supervisor};
use crate::clock::now_ms;

/// Bound on waiting for pipes to drain after exit; a grandchild may hold them.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Largest chunk a reader emits, in bytes. Longer lines are split.
pub(super) const OUTPUT_CHUNK_MAX: usize = 8 * 1024;

/// A partial line is held at most this long before it is emitted.
const PARTIAL_FLUSH: Duration = Duration::from_millis(100);

/// How a process ended, before it is folded into a status.
enum Exit {
    Status(std::process::ExitStatus),
    TimedOut(i32),
    WaitFailed,
}

pub(super) fn spawn_child_monitor(
    sup: Arc<Supervisor>,
    entry: Arc<ProcessEntry>,
    mut child: Child,
    timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let readers = [
            spawn_reader(sup.clone(), entry.clone(), child.stdout.take(), OutputStream::Stdout),
            spawn_reader(sup.clone(), entry.clone(), child.stderr.take(), OutputStream::Stderr),
        ];
        let pgid = lock(&entry.info).pid;

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Exit::Status(status),
                Err(_) => Exit::WaitFailed,
            },
            _ = &mut deadline => {
                let mut sent = libc::SIGTERM;
                if let Some(pgid) = pgid {
                    let _ = signal_group(pgid, sent);
                }
                if tokio::time::timeout(sup.settings.kill_grace(), child.wait()).await.is_err() {
                    sent = libc::SIGKILL;
                    if let Some(pgid) = pgid {
                        let _ = signal_group(pgid, sent);
                    }
                    let _ = child.wait().await;
                }
                Exit::TimedOut(sent)
            }
        };

        for reader in readers {
            let _ = tokio::time::timeout(READER_DRAIN, reader).await;
        }

        let kill_signal = *lock(&entry.kill_signal);
        let (state, reason, exit_code, signal) = match (exit, kill_signal) {
            (Exit::TimedOut(sig), _) => (
                BackgroundState::Timeout,
                StatusReason::Timeout,
                None,
                Some(signal_name(sig)),
            ),
            (exit, Some(sig)) => (
                BackgroundState::Killed,
                StatusReason::Killed,
                match exit {
                    Exit::Status(status) => status.code(),
                    _ => None,
                },
                Some(signal_name(sig)),
            ),
            (Exit::Status(status), None) => classify(status),
            (Exit::WaitFailed, None) => (BackgroundState::Failed, StatusReason::Lost, None, None),
        };

        sup.finish(&entry, state, reason, exit_code, signal).await;
    })
}

fn classify(
    status: std::process::ExitStatus,
) -> (BackgroundState, StatusReason, Option<i32>, Option<String>) {
    if status.success() {
        return (BackgroundState::Completed, StatusReason::Exited, Some(0), None);
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => (BackgroundState::Failed, StatusReason::NonZeroExit, Some(code), None),
        (None, Some(sig)) => (
            BackgroundState::Failed,
            StatusReason::Signaled,
            None,
            Some(signal_name(sig)),
        ),
        (None, None) => (BackgroundState::Failed, StatusReason::Lost, None, None),
    }
}

fn spawn_reader<R>(
    sup: Arc<Supervisor>,
    entry: Arc<ProcessEntry>,
    pipe: Option<R>,
    stream: OutputStream,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let process_id = lock(&entry.info).process_id.clone();

        let mut buf = vec![0u8; OUTPUT_CHUNK_MAX];
        let mut pending: Vec<u8> = Vec::with_capacity(OUTPUT_CHUNK_MAX);
        let mut flush_at: Option<Instant> = None;

        loop {
            let read = match flush_at {
                Some(at) => match tokio::time::timeout_at(at, pipe.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        let cut = char_boundary(&pending);
                        sup.emit_output(&entry, stream, take_text(&mut pending, cut))
                            .await;
                        flush_at = (!pending.is_empty()).then(|| Instant::now() + PARTIAL_FLUSH);
                        continue;
                    }
                },
                None => pipe.read(&mut buf).await,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(cut) = next_cut(&pending) {
                        sup.emit_output(&entry, stream, take_text(&mut pending, cut))
                            .await;
                    }
                    flush_at = match (pending.is_empty(), flush_at) {
                        (true, _) => None,
                        (false, Some(at)) => Some(at),
                        (false, None) => Some(Instant::now() + PARTIAL_FLUSH),
                    };
                }
                Err(err) => {
                    warn!(
                        component = "background",
                        event = "background.output.read_failed",
                        process_id = %process_id,
                        error = %err,
                    );
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let len = pending.len();
            sup.emit_output(&entry, stream, take_text(&mut pending, len))
                .await;
        }
    })
}

/// End of the next chunk: just past a newline, or at the size cap when no
/// newline comes first.
fn next_cut(pending: &[u8]) -> Option<usize> {
    let window = &pending[..pending.len().min(OUTPUT_CHUNK_MAX)];
    if let Some(pos) = window.iter().position(|b| *b == b'\n') {
        return Some(pos + 1);
    }
    (pending.len() >= OUTPUT_CHUNK_MAX).then(|| char_boundary(window))
}

/// Longest prefix that does not end inside a multi-byte character. Falls
/// back to the whole slice when there is no such prefix or the bytes are
/// not UTF-8 anyway.
fn char_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => bytes.len(),
    }
}

fn take_text(pending: &mut Vec<u8>, cut: usize) -> String {
    let bytes: Vec<u8> = pending.drain(..cut).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Poll an adopted process until it disappears, honoring what is left of
/// its deadline.
pub(super) fn spawn_adopted_monitor(
    sup: Arc<Supervisor>,
    entry: Arc<ProcessEntry>,
    pid: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = {
            let info = lock(&entry.info);
            info.timeout_ms.map(|t| info.started_at.saturating_add(t))
        };
        let mut poll = tokio::time::interval(sup.settings.liveness_poll());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut timeout_signal: Option<(i32, u64)> = None;

        loop {
            poll.tick().await;
            if !process_alive(pid) {
                break;
            }
            let now = now_ms();
            match timeout_signal {
                None if deadline.is_some_and(|d| now >= d) => {
                    let _ = signal_group(pid, libc::SIGTERM);
                    timeout_signal = Some((libc::SIGTERM, now));
                }
                Some((libc::SIGTERM, sent_at))
                    if now.saturating_sub(sent_at) >= sup.settings.kill_grace_ms =>
                {
                    let _ = signal_group(pid, libc::SIGKILL);
                    timeout_signal = Some((libc::SIGKILL, now));
                }
                _ => {}
            }
        }

        let kill_signal = *lock(&entry.kill_signal);
        let (state, reason, signal) = match (timeout_signal, kill_signal) {
            (Some((sig, _)), _) => (BackgroundState::Timeout, StatusReason::Timeout, Some(sig)),
            (None, Some(sig)) => (BackgroundState::Killed, StatusReason::Killed, Some(sig)),
            (None, None) => (BackgroundState::Failed, StatusReason::Lost, None),
        };
        sup.finish(&entry, state, reason, None, signal.map(signal_name))
            .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuts_after_newline_or_at_cap() {
        assert_eq!(next_cut(b"abc"), None);
        assert_eq!(next_cut(b"ab\ncd"), Some(3));

        let long = vec![b'x'; OUTPUT_CHUNK_MAX + 10];
        assert_eq!(next_cut(&long), Some(OUTPUT_CHUNK_MAX));

        let mut late_newline = vec![b'x'; OUTPUT_CHUNK_MAX];
        late_newline.push(b'\n');
        assert_eq!(next_cut(&late_newline), Some(OUTPUT_CHUNK_MAX));
    }

    #[test]
    fn cap_never_splits_a_character() {
        // "é" is two bytes; place one across the cap.
        let mut bytes = vec![b'x'; OUTPUT_CHUNK_MAX - 1];
        bytes.extend_from_slice("é".as_bytes());
        let cut = next_cut(&bytes).unwrap();
        assert_eq!(cut, OUTPUT_CHUNK_MAX - 1);

        let mut pending = bytes;
        assert_eq!(take_text(&mut pending, cut).len(), OUTPUT_CHUNK_MAX - 1);
        assert_eq!(take_text(&mut pending, 2), "é");
    }

    #[test]
    fn char_boundary_keeps_incomplete_tail() {
        let bytes = "aé".as_bytes();
        assert_eq!(char_boundary(&bytes[..2]), 1);
        assert_eq!(char_boundary(&bytes[1..2]), 1);
        assert_eq!(char_boundary(&[b'a', 0xff, b'b']), 3);
    }
}
