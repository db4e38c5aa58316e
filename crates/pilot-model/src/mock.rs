// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use pilot_schema::{Action, Message, PortError, Usage};

use crate::{AgentLoop, GroundRequest, Grounder, ModelError, TurnRequest, TurnResult};

/// Owned snapshot of a [`TurnRequest`], recorded so tests can inspect what
/// an adapter (or the orchestrator) actually sent.
#[derive(Debug, Clone)]
pub struct RecordedTurn {
    pub messages: Vec<Message>,
    pub display: (u32, u32),
    pub image_retention_window: Option<usize>,
    pub cache_hint: Option<usize>,
}

/// A pre-scripted agent loop.  Each call to `step` pops the next result
/// from the front of the queue.  This lets tests specify exact turn
/// sequences – including transport failures for retry tests – without
/// network access.
pub struct ScriptedLoop {
    name: String,
    scripts: Mutex<VecDeque<Result<TurnResult, ModelError>>>,
    requests: Mutex<Vec<RecordedTurn>>,
}

impl ScriptedLoop {
    pub fn new(scripts: Vec<Result<TurnResult, ModelError>>) -> Self {
        Self {
            name: "scripted".into(),
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a loop that performs one click then finishes.
    pub fn click_then_text(x: i32, y: i32, final_text: impl Into<String>) -> Self {
        Self::new(vec![
            Ok(TurnResult::new(
                vec![Message::computer_call("call_1", Action::click(x, y))],
                Usage::new(10, 5, 0.0),
            )),
            Ok(TurnResult::new(
                vec![Message::assistant(final_text)],
                Usage::new(12, 3, 0.0),
            )),
        ])
    }

    /// Convenience: a loop that immediately finishes with `text`.
    pub fn always_text(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(TurnResult::new(
            vec![Message::assistant(text)],
            Usage::new(5, 5, 0.0),
        ))])
    }

    /// All requests seen so far, in order.
    pub fn requests(&self) -> Vec<RecordedTurn> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of `step` calls made.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentLoop for ScriptedLoop {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        self.requests.lock().unwrap().push(RecordedTurn {
            messages: turn.messages.to_vec(),
            display: turn.display,
            image_retention_window: turn.image_retention_window,
            cache_hint: turn.cache_hint,
        });
        match self.scripts.lock().unwrap().pop_front() {
            Some(result) => result,
            // Scripts exhausted: finish the run rather than hanging it.
            None => Ok(TurnResult::new(
                vec![Message::assistant("[no more scripts]")],
                Usage::default(),
            )),
        }
    }
}

/// An agent loop that always fails with the configured port error.
///
/// For tests that exercise the retry and `on_error` machinery end to end:
/// a transport-failing loop drives the back-off path until the cap, a
/// target-failing loop goes straight to the error callbacks.
pub struct FailingLoop {
    error: PortError,
    calls: Mutex<usize>,
}

impl FailingLoop {
    pub fn new(error: PortError) -> Self {
        Self { error, calls: Mutex::new(0) }
    }

    /// A loop whose every turn fails retryably.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(PortError::Transport(msg.into()))
    }

    /// A loop whose every turn fails fatally.
    pub fn target(msg: impl Into<String>) -> Self {
        Self::new(PortError::Target(msg.into()))
    }

    /// Number of `step` calls made.
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl AgentLoop for FailingLoop {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn step(&self, _turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        *self.calls.lock().unwrap() += 1;
        Err(ModelError::Port(self.error.clone()))
    }
}

/// A pre-scripted grounder.  Records each intent it is asked to ground.
pub struct ScriptedGrounder {
    actions: Mutex<VecDeque<(Action, Usage)>>,
    intents: Mutex<Vec<String>>,
}

impl ScriptedGrounder {
    pub fn new(actions: Vec<(Action, Usage)>) -> Self {
        Self {
            actions: Mutex::new(actions.into()),
            intents: Mutex::new(Vec::new()),
        }
    }

    pub fn intents(&self) -> Vec<String> {
        self.intents.lock().unwrap().clone()
    }
}

#[async_trait]
impl Grounder for ScriptedGrounder {
    async fn ground(&self, req: GroundRequest<'_>) -> Result<(Action, Usage), ModelError> {
        self.intents.lock().unwrap().push(req.intent.to_string());
        self.actions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ModelError::target("scripted grounder exhausted"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
