//! Session actor: owns a SessionHandle and processes commands sequentially.
//!
//! Each session runs as an independent tokio task. External callers
//! communicate via `SessionActorHandle` which sends `SessionCommand`
//! messages over an mpsc channel. Lock-free reads go through `ArcSwap`.
//! Because every emission happens inside this loop, envelope seq order is
//! exactly command arrival order.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use opta_connector_core::{TurnBackend, TurnControl, TurnHandle};
use opta_protocol::SessionInfo;

use crate::clock::now_ms;
use crate::persistence::PersistCommand;
use crate::session::SessionHandle;
use crate::session_command::{SessionCommand, SubmitAck};
use crate::transition::{Effect, Input};
use crate::turn_runner::spawn_turn_runner;

const COMMAND_CAPACITY: usize = 256;
const CLIENT_EXPIRY_TICK: Duration = Duration::from_secs(30);

/// Everything an actor needs beyond its own session state.
#[derive(Clone)]
pub struct ActorContext {
    pub backend: Arc<dyn TurnBackend>,
    pub persist_tx: mpsc::Sender<PersistCommand>,
    pub cancel_grace: Duration,
    pub progress_interval: Duration,
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    info: Arc<ArcSwap<SessionInfo>>,
}

impl SessionActorHandle {
    pub fn spawn(handle: SessionHandle, ctx: ActorContext) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let info = handle.info_arc();
        let id = handle.id().to_string();
        handle.refresh_info();

        tokio::spawn(actor_loop(handle, command_rx, command_tx.downgrade(), ctx));

        SessionActorHandle {
            id,
            command_tx,
            info,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Send a command built around a reply channel and wait for the answer.
    /// `None` means the actor is gone.
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await;
        rx.await.ok()
    }

    /// Lock-free info read.
    pub fn info(&self) -> Arc<SessionInfo> {
        self.info.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

struct TurnRun {
    control: mpsc::Sender<TurnControl>,
    runner: JoinHandle<()>,
}

async fn actor_loop(
    mut handle: SessionHandle,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    self_tx: mpsc::WeakSender<SessionCommand>,
    ctx: ActorContext,
) {
    let mut runs: HashMap<String, TurnRun> = HashMap::new();
    let mut expiry = tokio::time::interval(CLIENT_EXPIRY_TICK);
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown_reply: Option<oneshot::Sender<()>> = None;

    info!(
        component = "session_actor",
        event = "session.actor.started",
        session_id = %handle.id(),
    );

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let flow = handle_command(cmd, &mut handle, &mut runs, &self_tx, &ctx).await;
                handle.refresh_info();
                if let ControlFlow::Break(reply) = flow {
                    shutdown_reply = reply;
                    break;
                }
            }
            _ = expiry.tick() => {
                handle.expire_clients(now_ms());
            }
        }
    }

    drop(command_rx);
    for (_, run) in runs.drain() {
        run.runner.abort();
    }
    info!(
        component = "session_actor",
        event = "session.actor.stopped",
        session_id = %handle.id(),
        last_seq = handle.last_seq(),
    );
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

async fn handle_command(
    cmd: SessionCommand,
    handle: &mut SessionHandle,
    runs: &mut HashMap<String, TurnRun>,
    self_tx: &mpsc::WeakSender<SessionCommand>,
    ctx: &ActorContext,
) -> ControlFlow<Option<oneshot::Sender<()>>> {
    let now = now_ms();
    match cmd {
        SessionCommand::Attach {
            client_id,
            after_seq,
            reply,
        } => {
            let attachment = handle.attach(&client_id, after_seq, now);
            info!(
                component = "session_actor",
                event = "session.client.attached",
                session_id = %handle.id(),
                client_id = %client_id,
                after_seq = ?after_seq,
                last_seq = attachment.last_seq,
            );
            let _ = reply.send(attachment);
        }
        SessionCommand::Resync {
            client_id,
            after_seq,
            reply,
        } => {
            let _ = reply.send(handle.resync(&client_id, after_seq, now));
        }
        SessionCommand::Detach { client_id } => {
            handle.detach(&client_id, now);
        }

        SessionCommand::Submit { turn, reply } => {
            let turn_id = turn.turn_id.clone();
            let effects = handle.apply(Input::Submit(turn), now);
            run_effects(effects, handle, runs, self_tx, ctx, now).await;
            let position = handle.engine().position_of(&turn_id).unwrap_or(0);
            let _ = reply.send(SubmitAck { turn_id, position });
        }
        SessionCommand::ResolvePermission {
            request_id,
            decision,
            decided_by,
            reply,
        } => {
            let input = Input::ResolvePermission {
                request_id,
                decision,
                decided_by,
            };
            let result = apply_checked(input, handle, runs, self_tx, ctx, now).await;
            let _ = reply.send(result);
        }
        SessionCommand::Cancel { target, reply } => {
            let result = apply_checked(Input::Cancel(target), handle, runs, self_tx, ctx, now).await;
            let _ = reply.send(result);
        }
        SessionCommand::Engine(input) => {
            let effects = handle.apply(*input, now);
            run_effects(effects, handle, runs, self_tx, ctx, now).await;
        }

        SessionCommand::Emit { event } => {
            handle.emit(*event, now);
        }

        SessionCommand::GetSnapshot { reply } => {
            let _ = reply.send(handle.snapshot());
        }
        SessionCommand::ReadEvents {
            after_seq,
            limit,
            client_id,
            reply,
        } => {
            let _ = reply.send(handle.read_events(after_seq, limit, client_id.as_deref(), now));
        }

        SessionCommand::Shutdown { reply } => return ControlFlow::Break(Some(reply)),
    }
    ControlFlow::Continue(())
}

async fn apply_checked(
    input: Input,
    handle: &mut SessionHandle,
    runs: &mut HashMap<String, TurnRun>,
    self_tx: &mpsc::WeakSender<SessionCommand>,
    ctx: &ActorContext,
    now: u64,
) -> Result<(), crate::transition::EngineError> {
    handle.validate(&input)?;
    let effects = handle.apply(input, now);
    run_effects(effects, handle, runs, self_tx, ctx, now).await;
    Ok(())
}

async fn run_effects(
    effects: Vec<Effect>,
    handle: &mut SessionHandle,
    runs: &mut HashMap<String, TurnRun>,
    self_tx: &mpsc::WeakSender<SessionCommand>,
    ctx: &ActorContext,
    now: u64,
) {
    for effect in effects {
        match effect {
            Effect::Emit(event) => {
                handle.emit(*event, now);
            }
            Effect::StartBackend(request) => {
                let turn_id = request.turn_id.clone();
                info!(
                    component = "session_actor",
                    event = "turn.started",
                    session_id = %handle.id(),
                    turn_id = %turn_id,
                    backend = ctx.backend.name(),
                    history = request.history.len(),
                );
                let TurnHandle { events, control } = ctx.backend.start_turn(*request);
                let runner = spawn_turn_runner(
                    handle.id().to_string(),
                    turn_id.clone(),
                    events,
                    self_tx.clone(),
                    ctx.progress_interval,
                );
                runs.insert(turn_id, TurnRun { control, runner });
            }
            Effect::Control { turn_id, control } => {
                let Some(run) = runs.get(&turn_id) else {
                    continue;
                };
                if let Err(e) = run.control.try_send(control) {
                    warn!(
                        component = "session_actor",
                        event = "turn.control.dropped",
                        session_id = %handle.id(),
                        turn_id = %turn_id,
                        error = %e,
                    );
                }
            }
            Effect::ScheduleCancelGrace { turn_id } => {
                let tx = self_tx.clone();
                let grace = ctx.cancel_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(tx) = tx.upgrade() {
                        let input = Input::CancelGraceElapsed { turn_id };
                        let _ = tx.send(SessionCommand::Engine(Box::new(input))).await;
                    }
                });
            }
            Effect::Finished(archived) => {
                if let Some(run) = runs.remove(&archived.turn_id) {
                    run.runner.abort();
                }
                info!(
                    component = "session_actor",
                    event = "turn.finished",
                    session_id = %handle.id(),
                    turn_id = %archived.turn_id,
                    state = archived.state.as_str(),
                    elapsed_ms = archived.stats.as_ref().map(|s| s.elapsed_ms).unwrap_or(0),
                );
                if ctx
                    .persist_tx
                    .send(PersistCommand::TurnArchive(archived))
                    .await
                    .is_err()
                {
                    warn!(
                        component = "session_actor",
                        event = "turn.archive.dropped",
                        session_id = %handle.id(),
                        "Persistence channel closed"
                    );
                }
            }
        }
    }
}
