// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The run state machine.
//!
//! ```text
//! INIT → CAPTURE → ASK → ACT → OBSERVE → (ASK | DONE | FAIL)
//! ```
//!
//! One run is strictly sequential: the orchestrator never issues two LLM
//! turns in parallel.  Cancellation is checked before every state
//! transition and at retry boundaries.  Exactly one of
//! `{completed, failed, cancelled}` is emitted, the output always contains
//! a user message and a terminal assistant message, and every
//! `computer_call` is balanced by a `computer_call_output`.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pilot_callbacks::{
    ActionDecision, ActionOutcome, CallbackPipeline, ErrorDecision, HookError, RunContext,
    RunSummary, TurnInput, TurnOutput,
};
use pilot_computer::{png_data_url, Computer};
use pilot_config::{AgentConfig, EnvSnapshot};
use pilot_model::{AgentLoop, ModelError, TurnRequest, TurnResult};
use pilot_schema::{
    Action, ContentPart, Message, MouseButton, PortError, Usage, UserContent,
};

use crate::{retry::RetryPolicy, RunError, RunStatus, ToolRouter};

/// Knobs for one run.  Budget enforcement lives in the `BudgetCap`
/// callback, not here.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_steps: u32,
    pub image_retention_window: Option<usize>,
    pub llm_timeout: Duration,
    pub action_timeout: Duration,
    pub run_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            image_retention_window: Some(3),
            llm_timeout: Duration::from_secs(120),
            action_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(1800),
        }
    }
}

impl From<&AgentConfig> for RunConfig {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            max_steps: cfg.max_steps,
            image_retention_window: cfg.image_retention_window,
            llm_timeout: Duration::from_secs(cfg.llm_timeout_secs),
            action_timeout: Duration::from_secs(cfg.action_timeout_secs),
            run_timeout: Duration::from_secs(cfg.run_timeout_secs),
        }
    }
}

/// The caller's task: plain text or pre-built canonical messages.
pub enum TaskInput {
    Text(String),
    Messages(Vec<Message>),
}

/// Everything one run needs, borrowed from the session layer.
pub struct RunRequest<'a> {
    pub task: TaskInput,
    pub agent: &'a dyn AgentLoop,
    pub computer: &'a dyn Computer,
    pub env: &'a EnvSnapshot,
    pub session_id: String,
    pub cancel: CancellationToken,
}

/// The structured result every run yields – errors are folded in, never
/// raised past this boundary.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub output: Vec<Message>,
    pub usage: Usage,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunOutcome {
    /// A run that failed before any state was created (e.g. pool
    /// exhaustion, unknown model).
    pub fn failed_early(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            run_id: Uuid::new_v4().to_string(),
            output: vec![Message::assistant(format!("Run failed: {error}"))],
            usage: Usage::default(),
            status: RunStatus::Failed,
            error: Some(error),
        }
    }
}

/// Drives one run to termination.
pub struct Orchestrator {
    config: RunConfig,
    pipeline: CallbackPipeline,
    tools: ToolRouter,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self { config, pipeline: CallbackPipeline::new(), tools: ToolRouter::new() }
    }

    pub fn with_pipeline(mut self, pipeline: CallbackPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_tools(mut self, tools: ToolRouter) -> Self {
        self.tools = tools;
        self
    }

    /// Run to termination.  Never returns an error: all failure modes are
    /// folded into the outcome.
    pub async fn run(&self, req: RunRequest<'_>) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let ctx = RunContext::new(
            run_id.clone(),
            req.session_id.clone(),
            req.agent.model_name(),
        );
        info!(run_id = %run_id, model = %ctx.model, "run starting");
        self.pipeline.on_run_start(&ctx);

        let mut output: Vec<Message> = Vec::new();
        let result = self.drive(&req, &ctx, &mut output).await;

        // A run always yields at least the user turn, even when it failed
        // before the capture phase got to emit it.
        if !output.iter().any(|m| matches!(m, Message::User { .. })) {
            let msg = match &req.task {
                TaskInput::Text(t) => Message::user(t.clone()),
                TaskInput::Messages(msgs) => msgs
                    .iter()
                    .find(|m| matches!(m, Message::User { .. }))
                    .cloned()
                    .unwrap_or_else(|| Message::user("")),
            };
            self.pipeline.on_message(&ctx, &msg);
            output.insert(0, msg);
        }

        // Balance any dangling computer_call before the terminal message.
        self.balance_calls(&ctx, &mut output);

        let (status, error) = match result {
            Ok(()) => (RunStatus::Completed, None),
            Err(e) => {
                let status = e.status();
                let text = match &e {
                    RunError::BudgetExceeded(msg) => format!("Stopping: {msg}."),
                    RunError::StepLimitReached(n) => {
                        format!("Stopping: step limit of {n} reached.")
                    }
                    RunError::Cancelled => "Run cancelled by caller.".to_string(),
                    other => format!("Run failed: {other}"),
                };
                self.emit(&ctx, &mut output, Message::assistant(text));
                let error = match status {
                    RunStatus::Failed => Some(e.to_string()),
                    RunStatus::Cancelled => Some("cancelled".to_string()),
                    RunStatus::Completed => None,
                };
                (status, error)
            }
        };

        if !matches!(output.last(), Some(Message::Assistant { .. })) {
            self.emit(&ctx, &mut output, Message::assistant("Task completed."));
        }

        let usage = ctx.usage();
        let summary = RunSummary {
            status: status.as_str().to_string(),
            usage: usage.clone(),
            error: error.clone(),
        };
        self.pipeline.on_run_end(&ctx, &summary);
        info!(run_id = %run_id, status = %status, turns = ctx.turn(), "run finished");

        RunOutcome { run_id, output, usage, status, error }
    }

    /// INIT through DONE.  Returns `Ok(())` only for a natural terminal
    /// assistant turn; every other exit is a typed `RunError`.
    async fn drive(
        &self,
        req: &RunRequest<'_>,
        ctx: &RunContext,
        output: &mut Vec<Message>,
    ) -> Result<(), RunError> {
        let deadline = Instant::now() + self.config.run_timeout;
        let cancel = &req.cancel;

        // ── INIT ──────────────────────────────────────────────────────────────
        check_cancel(cancel)?;
        let display = self
            .computer_op(cancel, || req.computer.dimensions())
            .await?;

        let mut history: Vec<Message> = match &req.task {
            TaskInput::Text(t) => vec![Message::user(t.clone())],
            TaskInput::Messages(msgs) if msgs.is_empty() => {
                return Err(RunError::Configuration("input contains no messages".into()))
            }
            TaskInput::Messages(msgs) => msgs.clone(),
        };
        if !history.iter().any(|m| matches!(m, Message::User { .. })) {
            return Err(RunError::Configuration("input contains no user message".into()));
        }

        // ── CAPTURE ───────────────────────────────────────────────────────────
        check_cancel(cancel)?;
        let png = self
            .computer_op(cancel, || req.computer.screenshot())
            .await?;
        let png = self.hook(self.pipeline.on_screenshot(ctx, png))?;
        attach_screenshot_to_user_turn(&mut history, &png_data_url(&png));
        for msg in &history {
            self.pipeline.on_message(ctx, msg);
        }
        output.extend(history.iter().cloned());

        loop {
            // ── ASK ───────────────────────────────────────────────────────────
            check_cancel(cancel)?;
            if Instant::now() > deadline {
                return Err(RunError::Transport("run wall-clock limit exceeded".into()));
            }
            let turn_no = ctx.next_turn();
            if turn_no > self.config.max_steps {
                return Err(RunError::StepLimitReached(self.config.max_steps));
            }

            history = self.hook(self.pipeline.before_turn(ctx, history))?;
            let input = self.hook(self.pipeline.before_llm(
                ctx,
                TurnInput { messages: history, cache_hint: None },
            ))?;
            history = input.messages;

            let reply = match self.ask(req, &history, input.cache_hint, display).await {
                Ok(reply) => reply,
                Err(RunError::Transport(m)) => {
                    self.consult_on_error(ctx, PortError::Transport(m), &mut history, output)?;
                    continue;
                }
                Err(RunError::Target(m)) => {
                    self.consult_on_error(ctx, PortError::Target(m), &mut history, output)?;
                    continue;
                }
                Err(other) => return Err(other),
            };

            let shaped = self.hook(self.pipeline.after_llm(
                ctx,
                TurnOutput { messages: reply.messages, usage: reply.usage },
            ))?;
            ctx.add_usage(&shaped.usage);
            for msg in &shaped.messages {
                self.emit_ref(ctx, output, msg);
            }
            history.extend(shaped.messages.iter().cloned());

            // ── ACT ───────────────────────────────────────────────────────────
            let computer_call = shaped.messages.iter().rev().find_map(|m| match m {
                Message::ComputerCall { call_id, action, .. } => {
                    Some((call_id.clone(), action.clone()))
                }
                _ => None,
            });

            if let Some((call_id, action)) = computer_call {
                self.act_and_observe(req, ctx, &mut history, output, call_id, action)
                    .await?;
                continue;
            }

            let function_call = shaped.messages.iter().rev().find_map(|m| match m {
                Message::FunctionCall { call_id, name, arguments, .. } => {
                    Some((call_id.clone(), name.clone(), arguments.clone()))
                }
                _ => None,
            });

            if let Some((call_id, name, arguments)) = function_call {
                check_cancel(cancel)?;
                match self.tools.route(&name, &arguments).await {
                    Ok(result) => {
                        let msg = Message::function_call_output(call_id, result);
                        self.emit_ref(ctx, output, &msg);
                        history.push(msg);
                    }
                    Err(e) => {
                        // Balance the function call before consulting the
                        // error chain.
                        let msg =
                            Message::function_call_output(call_id, format!("error: {e}"));
                        self.emit_ref(ctx, output, &msg);
                        history.push(msg);
                        self.consult_on_error(ctx, e, &mut history, output)?;
                    }
                }
                continue;
            }

            // ── DONE ──────────────────────────────────────────────────────────
            debug!(turn = turn_no, "terminal turn, no trailing call");
            return Ok(());
        }
    }

    /// ACT + OBSERVE for one computer call.
    async fn act_and_observe(
        &self,
        req: &RunRequest<'_>,
        ctx: &RunContext,
        history: &mut Vec<Message>,
        output: &mut Vec<Message>,
        call_id: String,
        action: Action,
    ) -> Result<(), RunError> {
        let cancel = &req.cancel;
        check_cancel(cancel)?;

        let decision = self.hook(self.pipeline.before_action(ctx, action.clone()))?;
        let action = match decision {
            ActionDecision::Proceed(a) => a,
            ActionDecision::Skip => {
                // Silently dropped: substitute a synthetic output so the
                // call/output pairing stays balanced.
                debug!(call_id = %call_id, "action skipped by callback");
                let _ = self.hook(self.pipeline.after_action(
                    ctx,
                    &action,
                    ActionOutcome::Skipped,
                ))?;
                let msg = synthetic_output(history, &call_id, "[action skipped]");
                self.emit_ref(ctx, output, &msg);
                history.push(msg);
                return Ok(());
            }
        };

        if let Err(e) = action.validate() {
            let msg = synthetic_output(history, &call_id, "[invalid action]");
            self.emit_ref(ctx, output, &msg);
            history.push(msg);
            self.consult_on_error(ctx, PortError::Target(e.to_string()), history, output)?;
            return Ok(());
        }

        let dispatched = self
            .dispatch_with_retry(req.computer, &action, cancel)
            .await;
        match dispatched {
            Ok(()) => {
                let _ = self.hook(self.pipeline.after_action(
                    ctx,
                    &action,
                    ActionOutcome::Success,
                ))?;
            }
            Err(PortError::Cancelled) => return Err(RunError::Cancelled),
            Err(e) => {
                let _ = self.hook(self.pipeline.after_action(
                    ctx,
                    &action,
                    ActionOutcome::Failed(e.to_string()),
                ))?;
                let msg = synthetic_output(history, &call_id, "[action failed]");
                self.emit_ref(ctx, output, &msg);
                history.push(msg);
                self.consult_on_error(ctx, e, history, output)?;
                return Ok(());
            }
        }

        // ── OBSERVE ───────────────────────────────────────────────────────────
        check_cancel(cancel)?;
        let png = self
            .computer_op(cancel, || req.computer.screenshot())
            .await?;
        let png = self.hook(self.pipeline.on_screenshot(ctx, png))?;
        let msg = Message::computer_call_output(call_id, png_data_url(&png));
        self.emit_ref(ctx, output, &msg);
        history.push(msg);
        Ok(())
    }

    /// One LLM turn with the per-turn timeout and transport retry policy.
    /// Retries are internal: `on_error` callbacks never see a transport
    /// failure that a later attempt recovered from.
    async fn ask(
        &self,
        req: &RunRequest<'_>,
        history: &[Message],
        cache_hint: Option<usize>,
        display: (u32, u32),
    ) -> Result<TurnResult, RunError> {
        let policy = RetryPolicy::llm();
        let mut attempt = 0;
        loop {
            attempt += 1;
            check_cancel(&req.cancel)?;

            let turn = TurnRequest {
                messages: history,
                display,
                os_type: req.computer.os_type(),
                image_retention_window: self.config.image_retention_window,
                cache_hint,
                env: req.env,
                cancel: req.cancel.clone(),
            };
            let outcome = tokio::time::timeout(self.config.llm_timeout, req.agent.step(turn)).await;

            let port_err = match outcome {
                Err(_) => PortError::Transport(format!(
                    "llm turn exceeded {:?}",
                    self.config.llm_timeout
                )),
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(ModelError::Port(p))) => p,
                Ok(Err(other)) => return Err(other.into()),
            };

            match port_err {
                PortError::Cancelled => return Err(RunError::Cancelled),
                PortError::Transport(m) if attempt < policy.max_tries => {
                    warn!(attempt, error = %m, "llm transport error, retrying");
                    sleep_or_cancel(policy.delay(attempt), &req.cancel).await?;
                }
                other => return Err(other.into()),
            }
        }
    }

    /// Map one canonical action onto the computer port.
    async fn dispatch(computer: &dyn Computer, action: &Action) -> Result<(), PortError> {
        match action {
            Action::Click { button, x, y } => {
                computer.move_cursor(*x, *y).await?;
                match button {
                    MouseButton::Left => computer.left_click(*x, *y).await,
                    MouseButton::Right => computer.right_click(*x, *y).await,
                    // Wheel/back/forward have no dedicated click op.
                    other => {
                        computer.mouse_down(*x, *y, *other).await?;
                        computer.mouse_up(*x, *y, *other).await
                    }
                }
            }
            Action::DoubleClick { x, y, .. } => {
                computer.move_cursor(*x, *y).await?;
                computer.double_click(*x, *y).await
            }
            Action::Drag { button, path } => computer.drag(path, *button, 500).await,
            Action::Move { x, y } => computer.move_cursor(*x, *y).await,
            Action::Scroll { x, y, scroll_x, scroll_y } => {
                computer.scroll(*x, *y, *scroll_x, *scroll_y).await
            }
            Action::Keypress { keys } => computer.press_keys(keys).await,
            Action::Type { text } => computer.type_text(text).await,
            // The observe step captures the screen anyway.
            Action::Screenshot => Ok(()),
            Action::Wait => computer.wait(1000).await,
            Action::LeftMouseDown { x, y } => {
                computer.mouse_down(*x, *y, MouseButton::Left).await
            }
            Action::LeftMouseUp { x, y } => computer.mouse_up(*x, *y, MouseButton::Left).await,
        }
    }

    /// Dispatch with the computer retry policy and per-action timeout.
    async fn dispatch_with_retry(
        &self,
        computer: &dyn Computer,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<(), PortError> {
        let policy = RetryPolicy::computer();
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(PortError::Cancelled);
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(PortError::Cancelled),
                r = tokio::time::timeout(self.config.action_timeout, Self::dispatch(computer, action)) => r,
            };
            let err = match outcome {
                Err(_) => PortError::Transport(format!(
                    "action {} exceeded {:?}",
                    action.kind(),
                    self.config.action_timeout
                )),
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
            };
            match err {
                PortError::Transport(m) if attempt < policy.max_tries => {
                    warn!(attempt, error = %m, "computer transport error, retrying");
                    if sleep_or_cancel(policy.delay(attempt), cancel).await.is_err() {
                        return Err(PortError::Cancelled);
                    }
                }
                other => return Err(other),
            }
        }
    }

    /// A computer-port read (dimensions / screenshot) with retry.
    async fn computer_op<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PortError>>,
    {
        let policy = RetryPolicy::computer();
        let mut attempt = 0;
        loop {
            attempt += 1;
            check_cancel(cancel)?;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                r = tokio::time::timeout(self.config.action_timeout, op()) => r,
            };
            let err = match outcome {
                Err(_) => PortError::Transport("computer op timed out".into()),
                Ok(Ok(v)) => return Ok(v),
                Ok(Err(e)) => e,
            };
            match err {
                PortError::Transport(m) if attempt < policy.max_tries => {
                    warn!(attempt, error = %m, "computer transport error, retrying");
                    sleep_or_cancel(policy.delay(attempt), cancel).await?;
                }
                other => return Err(other.into()),
            }
        }
    }

    /// Feed a port error through the `on_error` chain.  `Recover` appends
    /// the replacement messages and lets the loop continue; `Propagate`
    /// fails the run.
    fn consult_on_error(
        &self,
        ctx: &RunContext,
        error: PortError,
        history: &mut Vec<Message>,
        output: &mut Vec<Message>,
    ) -> Result<(), RunError> {
        warn!(error = %error, "consulting error callbacks");
        match self.pipeline.on_error(ctx, &error) {
            ErrorDecision::Recover(messages) => {
                for msg in &messages {
                    self.emit_ref(ctx, output, msg);
                }
                history.extend(messages);
                Ok(())
            }
            ErrorDecision::Propagate(text) => Err(RunError::Fatal(text)),
        }
    }

    fn hook<T>(&self, result: Result<T, HookError>) -> Result<T, RunError> {
        result.map_err(|e| match e {
            HookError::Budget(m) => RunError::BudgetExceeded(m),
            HookError::Fatal(m) => RunError::Fatal(m),
        })
    }

    fn emit(&self, ctx: &RunContext, output: &mut Vec<Message>, msg: Message) {
        self.pipeline.on_message(ctx, &msg);
        output.push(msg);
    }

    fn emit_ref(&self, ctx: &RunContext, output: &mut Vec<Message>, msg: &Message) {
        self.pipeline.on_message(ctx, msg);
        output.push(msg.clone());
    }

    /// Append placeholder outputs for any computer_call that never got one
    /// (cancellation or failure mid-flight).
    fn balance_calls(&self, ctx: &RunContext, output: &mut Vec<Message>) {
        let answered: std::collections::HashSet<String> = output
            .iter()
            .filter_map(|m| match m {
                Message::ComputerCallOutput { call_id, .. } => Some(call_id.clone()),
                _ => None,
            })
            .collect();
        let dangling: Vec<String> = output
            .iter()
            .filter_map(|m| match m {
                Message::ComputerCall { call_id, .. } if !answered.contains(call_id) => {
                    Some(call_id.clone())
                }
                _ => None,
            })
            .collect();
        for call_id in dangling {
            let msg = Message::ComputerCallOutput {
                call_id,
                output: ContentPart::input_text("[no output: run ended]"),
            };
            self.emit_ref(ctx, output, &msg);
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), RunError> {
    if cancel.is_cancelled() {
        Err(RunError::Cancelled)
    } else {
        Ok(())
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), RunError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Append the initial screenshot to the last user turn as an
/// `input_image` part.
fn attach_screenshot_to_user_turn(history: &mut [Message], image_url: &str) {
    let Some(user) = history
        .iter_mut()
        .rev()
        .find(|m| matches!(m, Message::User { .. }))
    else {
        return;
    };
    if let Message::User { content } = user {
        let mut parts = std::mem::replace(content, UserContent::Text(String::new())).into_parts();
        parts.push(ContentPart::InputImage { image_url: image_url.to_string() });
        *content = UserContent::Parts(parts);
    }
}

/// A synthetic `computer_call_output`: the last known screenshot when one
/// exists, a text placeholder otherwise.
fn synthetic_output(history: &[Message], call_id: &str, placeholder: &str) -> Message {
    let last_screenshot = history.iter().rev().find_map(|m| match m {
        Message::ComputerCallOutput {
            output: ContentPart::ComputerScreenshot { image_url },
            ..
        } => Some(image_url.clone()),
        _ => None,
    });
    match last_screenshot {
        Some(url) => Message::computer_call_output(call_id, url),
        None => Message::ComputerCallOutput {
            call_id: call_id.to_string(),
            output: ContentPart::input_text(placeholder),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
