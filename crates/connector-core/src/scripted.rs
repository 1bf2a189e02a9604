//! Deterministic backend driven by step scripts.
//!
//! Used for offline development (`backend.kind = "scripted"`, which echoes
//! the prompt back) and as the backend in daemon tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    turn_channels, BackendError, BackendEvent, ToolCall, ToolOutcome, TurnBackend, TurnControl,
    TurnHandle, TurnRequest,
};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Token(String),
    Thinking(String),
    /// Propose a tool call. Approved or auto-approved calls finish with `output`.
    Tool {
        name: String,
        arguments: Value,
        requires_approval: bool,
        output: String,
    },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Delay(Duration),
    Fail(BackendError),
    /// Stop responding entirely, cancellation included.
    Hang,
}

type ScriptFn = dyn Fn(&TurnRequest) -> Vec<ScriptStep> + Send + Sync;

#[derive(Clone)]
pub struct ScriptedBackend {
    script: Arc<ScriptFn>,
}

impl ScriptedBackend {
    /// Run the same steps for every turn.
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::from_fn(move |_| steps.clone())
    }

    pub fn from_fn<F>(script: F) -> Self
    where
        F: Fn(&TurnRequest) -> Vec<ScriptStep> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
        }
    }

    /// Echo the prompt back word by word.
    pub fn echo() -> Self {
        Self::from_fn(|request| {
            let words: Vec<&str> = request.content.split_whitespace().collect();
            let mut steps = Vec::with_capacity(words.len() + 2);
            steps.push(ScriptStep::Token("echo:".to_string()));
            for word in &words {
                steps.push(ScriptStep::Token(format!(" {word}")));
            }
            steps.push(ScriptStep::Usage {
                prompt_tokens: words.len() as u64,
                completion_tokens: words.len() as u64 + 1,
            });
            steps
        })
    }
}

impl TurnBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start_turn(&self, request: TurnRequest) -> TurnHandle {
        let steps = (self.script)(&request);
        let (handle, channels) = turn_channels();
        tokio::spawn(run_script(
            request.turn_id,
            steps,
            channels.events,
            channels.control,
        ));
        handle
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn run_script(
    turn_id: String,
    steps: Vec<ScriptStep>,
    events: mpsc::Sender<BackendEvent>,
    mut control: mpsc::Receiver<TurnControl>,
) {
    debug!(
        component = "scripted_backend",
        event = "scripted.turn.started",
        turn_id = %turn_id,
        steps = steps.len(),
    );

    for (index, step) in steps.into_iter().enumerate() {
        if let Flow::Stop = drain_control(&events, &mut control).await {
            return;
        }

        let flow = match step {
            ScriptStep::Token(text) => send(&events, BackendEvent::Token(text)).await,
            ScriptStep::Thinking(text) => send(&events, BackendEvent::Thinking(text)).await,
            ScriptStep::Usage {
                prompt_tokens,
                completion_tokens,
            } => {
                send(
                    &events,
                    BackendEvent::Usage {
                        prompt_tokens,
                        completion_tokens,
                    },
                )
                .await
            }
            ScriptStep::Delay(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Flow::Continue,
                    msg = control.recv() => match msg {
                        Some(TurnControl::Cancel) => {
                            let _ = events.send(BackendEvent::Cancelled).await;
                            Flow::Stop
                        }
                        None => Flow::Stop,
                        Some(_) => Flow::Continue,
                    },
                }
            }
            ScriptStep::Tool {
                name,
                arguments,
                requires_approval,
                output,
            } => {
                let call_id = format!("call-{index}");
                run_tool(
                    &events,
                    &mut control,
                    ToolCall {
                        call_id,
                        tool_name: name,
                        arguments,
                        requires_approval,
                    },
                    output,
                )
                .await
            }
            ScriptStep::Fail(error) => {
                let _ = events.send(BackendEvent::Failed(error)).await;
                Flow::Stop
            }
            ScriptStep::Hang => {
                // Ignore everything until the daemon drops the control channel.
                while control.recv().await.is_some() {}
                Flow::Stop
            }
        };

        if let Flow::Stop = flow {
            return;
        }
    }

    if let Flow::Continue = drain_control(&events, &mut control).await {
        let _ = events.send(BackendEvent::Completed).await;
    }
}

async fn send(events: &mpsc::Sender<BackendEvent>, event: BackendEvent) -> Flow {
    match events.send(event).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Stop,
    }
}

/// Pick up a pending cancel between steps.
async fn drain_control(
    events: &mpsc::Sender<BackendEvent>,
    control: &mut mpsc::Receiver<TurnControl>,
) -> Flow {
    while let Ok(msg) = control.try_recv() {
        if msg == TurnControl::Cancel {
            let _ = events.send(BackendEvent::Cancelled).await;
            return Flow::Stop;
        }
    }
    Flow::Continue
}

async fn run_tool(
    events: &mpsc::Sender<BackendEvent>,
    control: &mut mpsc::Receiver<TurnControl>,
    call: ToolCall,
    output: String,
) -> Flow {
    let call_id = call.call_id.clone();
    let needs_approval = call.requires_approval;
    if let Flow::Stop = send(events, BackendEvent::ToolCall(call)).await {
        return Flow::Stop;
    }

    if needs_approval {
        loop {
            match control.recv().await {
                Some(TurnControl::Approve { call_id: approved }) if approved == call_id => break,
                Some(TurnControl::Deny { call_id: denied, .. }) if denied == call_id => {
                    // The daemon already reported the failure; the model just moves on.
                    return Flow::Continue;
                }
                Some(TurnControl::Cancel) => {
                    let _ = events.send(BackendEvent::Cancelled).await;
                    return Flow::Stop;
                }
                Some(_) => continue,
                None => return Flow::Stop,
            }
        }
    }

    send(
        events,
        BackendEvent::ToolFinished {
            call_id,
            outcome: ToolOutcome::Success(output),
        },
    )
    .await
}
