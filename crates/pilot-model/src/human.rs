// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use pilot_schema::{Action, Message, Usage};

use crate::{AgentLoop, ModelError, TurnRequest, TurnResult};

/// Create a human-in-the-loop adapter and its controller handle.
///
/// The adapter makes no LLM call: each `step` blocks until the controller
/// supplies the next canonical messages.  A terminal `assistant` message
/// ends the run like any other adapter's would.
pub fn human_channel() -> (HumanLoop, HumanController) {
    let (tx, rx) = mpsc::channel(8);
    (HumanLoop { rx: Mutex::new(rx) }, HumanController { tx })
}

/// Sink through which an external operator supplies the next step.
#[derive(Clone)]
pub struct HumanController {
    tx: mpsc::Sender<Vec<Message>>,
}

impl HumanController {
    /// Supply the next turn's canonical messages.
    pub async fn provide(&self, messages: Vec<Message>) -> Result<(), ModelError> {
        self.tx
            .send(messages)
            .await
            .map_err(|_| ModelError::target("human loop is no longer listening"))
    }

    /// Convenience: supply a single action as the next step.
    pub async fn provide_action(&self, action: Action) -> Result<(), ModelError> {
        self.provide(vec![Message::computer_call(Message::new_call_id(), action)])
            .await
    }

    /// Convenience: finish the run with an assistant message.
    pub async fn finish(&self, text: impl Into<String>) -> Result<(), ModelError> {
        self.provide(vec![Message::assistant(text)]).await
    }
}

/// The adapter half: blocks on the channel inside `step`.
pub struct HumanLoop {
    rx: Mutex<mpsc::Receiver<Vec<Message>>>,
}

#[async_trait]
impl AgentLoop for HumanLoop {
    fn model_name(&self) -> &str {
        "human"
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        let mut rx = self.rx.lock().await;
        let messages = tokio::select! {
            _ = turn.cancel.cancelled() => {
                return Err(ModelError::Port(pilot_schema::PortError::Cancelled))
            }
            m = rx.recv() => m.ok_or_else(|| {
                ModelError::target("human controller dropped without finishing the run")
            })?,
        };
        Ok(TurnResult::new(messages, Usage::default()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
