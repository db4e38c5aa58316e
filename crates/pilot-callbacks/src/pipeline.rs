// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Symmetric middleware around the run loop.
//!
//! Callbacks compose like onion layers: input-shaping hooks
//! (`before_turn`, `before_llm`, `before_action`, `on_screenshot`) run
//! left-to-right in registration order; output-shaping hooks (`after_llm`,
//! `after_action`, `on_error`) run right-to-left.  Every hook is pure
//! rewriting – values in, new values out – and the pipeline owns no state
//! beyond the ordered list.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use pilot_schema::{Action, Message, PortError, Usage};

/// Error raised by a hook.
#[derive(Debug, Clone)]
pub enum HookError {
    /// The budget gate tripped.  The orchestrator ends the run cleanly
    /// (`status=completed`) with a terminal message naming the reason.
    Budget(String),
    /// Any other hook failure; fails the run.
    Fatal(String),
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookError::Budget(m) => write!(f, "budget exceeded: {m}"),
            HookError::Fatal(m) => write!(f, "{m}"),
        }
    }
}

/// Verdict of the `before_action` chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionDecision {
    Proceed(Action),
    /// Drop the action silently; the orchestrator substitutes a synthetic
    /// output so call/output pairing stays balanced.
    Skip,
}

/// What happened to a dispatched action, as seen by `after_action`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Success,
    Skipped,
    Failed(String),
}

/// Verdict of the `on_error` chain.
#[derive(Debug)]
pub enum ErrorDecision {
    /// No callback recovered; the run fails with this description.
    Propagate(String),
    /// Resume the loop at the next turn with these messages appended.
    Recover(Vec<Message>),
}

/// The `before_llm` payload: messages plus the cache hint for providers
/// with explicit prompt caching.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub messages: Vec<Message>,
    pub cache_hint: Option<usize>,
}

/// The `after_llm` payload: the adapter's canonical output.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub messages: Vec<Message>,
    pub usage: Usage,
}

/// Final result summary handed to `on_run_end`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: String,
    pub usage: Usage,
    pub error: Option<String>,
}

/// Per-run context shared with every hook.
pub struct RunContext {
    pub run_id: String,
    pub session_id: String,
    pub model: String,
    usage: Mutex<Usage>,
    turns: AtomicU32,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            model: model.into(),
            usage: Mutex::new(Usage::default()),
            turns: AtomicU32::new(0),
        }
    }

    pub fn add_usage(&self, usage: &Usage) {
        self.usage.lock().unwrap().add(usage);
    }

    pub fn usage(&self) -> Usage {
        self.usage.lock().unwrap().clone()
    }

    pub fn next_turn(&self) -> u32 {
        self.turns.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn turn(&self) -> u32 {
        self.turns.load(Ordering::SeqCst)
    }
}

/// A callback implements any subset of hooks; defaults are identity.
#[allow(unused_variables)]
pub trait Callback: Send + Sync {
    fn name(&self) -> &str;

    fn on_run_start(&self, ctx: &RunContext) {}
    fn on_run_end(&self, ctx: &RunContext, result: &RunSummary) {}

    /// Notification for every canonical message as it is emitted, in
    /// stream order.  Observational only – trajectory capture hangs here.
    fn on_message(&self, ctx: &RunContext, message: &Message) {}

    fn before_turn(
        &self,
        ctx: &RunContext,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, HookError> {
        Ok(messages)
    }

    fn before_llm(&self, ctx: &RunContext, input: TurnInput) -> Result<TurnInput, HookError> {
        Ok(input)
    }

    fn after_llm(&self, ctx: &RunContext, output: TurnOutput) -> Result<TurnOutput, HookError> {
        Ok(output)
    }

    fn before_action(
        &self,
        ctx: &RunContext,
        action: Action,
    ) -> Result<ActionDecision, HookError> {
        Ok(ActionDecision::Proceed(action))
    }

    fn after_action(
        &self,
        ctx: &RunContext,
        action: &Action,
        outcome: ActionOutcome,
    ) -> Result<ActionOutcome, HookError> {
        Ok(outcome)
    }

    fn on_screenshot(&self, ctx: &RunContext, png: Vec<u8>) -> Result<Vec<u8>, HookError> {
        Ok(png)
    }

    /// Inspect an error before it fails the run.  Return
    /// [`ErrorDecision::Recover`] to resume with replacement messages.
    fn on_error(&self, ctx: &RunContext, error: &PortError) -> ErrorDecision {
        ErrorDecision::Propagate(error.to_string())
    }
}

/// Ordered callback list.  Copy-on-register: [`with`](Self::with) returns
/// a new pipeline, and iteration never takes a lock.
#[derive(Clone, Default)]
pub struct CallbackPipeline {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_run_start(&self, ctx: &RunContext) {
        for cb in &self.callbacks {
            cb.on_run_start(ctx);
        }
    }

    pub fn on_run_end(&self, ctx: &RunContext, result: &RunSummary) {
        for cb in self.callbacks.iter().rev() {
            cb.on_run_end(ctx, result);
        }
    }

    pub fn on_message(&self, ctx: &RunContext, message: &Message) {
        for cb in &self.callbacks {
            cb.on_message(ctx, message);
        }
    }

    pub fn before_turn(
        &self,
        ctx: &RunContext,
        mut messages: Vec<Message>,
    ) -> Result<Vec<Message>, HookError> {
        for cb in &self.callbacks {
            messages = cb.before_turn(ctx, messages)?;
        }
        Ok(messages)
    }

    pub fn before_llm(&self, ctx: &RunContext, mut input: TurnInput) -> Result<TurnInput, HookError> {
        for cb in &self.callbacks {
            input = cb.before_llm(ctx, input)?;
        }
        Ok(input)
    }

    pub fn after_llm(
        &self,
        ctx: &RunContext,
        mut output: TurnOutput,
    ) -> Result<TurnOutput, HookError> {
        for cb in self.callbacks.iter().rev() {
            output = cb.after_llm(ctx, output)?;
        }
        Ok(output)
    }

    /// `Skip` short-circuits: later callbacks never see a dropped action.
    pub fn before_action(
        &self,
        ctx: &RunContext,
        mut action: Action,
    ) -> Result<ActionDecision, HookError> {
        for cb in &self.callbacks {
            match cb.before_action(ctx, action)? {
                ActionDecision::Proceed(a) => action = a,
                ActionDecision::Skip => return Ok(ActionDecision::Skip),
            }
        }
        Ok(ActionDecision::Proceed(action))
    }

    pub fn after_action(
        &self,
        ctx: &RunContext,
        action: &Action,
        mut outcome: ActionOutcome,
    ) -> Result<ActionOutcome, HookError> {
        for cb in self.callbacks.iter().rev() {
            outcome = cb.after_action(ctx, action, outcome)?;
        }
        Ok(outcome)
    }

    pub fn on_screenshot(&self, ctx: &RunContext, mut png: Vec<u8>) -> Result<Vec<u8>, HookError> {
        for cb in &self.callbacks {
            png = cb.on_screenshot(ctx, png)?;
        }
        Ok(png)
    }

    /// The first `Recover` (scanning right-to-left) wins.
    pub fn on_error(&self, ctx: &RunContext, error: &PortError) -> ErrorDecision {
        for cb in self.callbacks.iter().rev() {
            if let ErrorDecision::Recover(messages) = cb.on_error(ctx, error) {
                return ErrorDecision::Recover(messages);
            }
        }
        ErrorDecision::Propagate(error.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
