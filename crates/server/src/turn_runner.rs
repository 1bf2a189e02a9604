//! Bridges one backend turn into its session actor.
//!
//! The runner drains the backend's event channel, forwarding each event as
//! engine input, and injects a heartbeat on a fixed interval. It holds only a
//! weak sender so a dead session is never kept alive by its turns.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use opta_connector_core::BackendEvent;

use crate::session_command::SessionCommand;
use crate::transition::Input;

pub fn spawn_turn_runner(
    session_id: String,
    turn_id: String,
    mut events: mpsc::Receiver<BackendEvent>,
    actor: mpsc::WeakSender<SessionCommand>,
    heartbeat: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let input = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        let input = Input::Backend { turn_id: turn_id.clone(), event };
                        if !forward(&actor, input).await || terminal {
                            break;
                        }
                        continue;
                    }
                    None => Input::BackendClosed { turn_id: turn_id.clone() },
                },
                _ = ticker.tick() => Input::Heartbeat { turn_id: turn_id.clone() },
            };

            let closed = matches!(input, Input::BackendClosed { .. });
            if !forward(&actor, input).await || closed {
                break;
            }
        }

        debug!(
            component = "turn_runner",
            event = "turn.runner.stopped",
            session_id = %session_id,
            turn_id = %turn_id,
        );
    })
}

async fn forward(actor: &mpsc::WeakSender<SessionCommand>, input: Input) -> bool {
    let Some(tx) = actor.upgrade() else {
        return false;
    };
    tx.send(SessionCommand::Engine(Box::new(input))).await.is_ok()
}
