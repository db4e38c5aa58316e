// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pilot_config::EnvSnapshot;
use pilot_schema::{Action, Message, OsType, Usage};

use crate::ModelError;

/// One canonical turn handed to an adapter.
///
/// Borrowed views keep the orchestrator's history authoritative; adapters
/// never mutate it, they only emit new messages.
pub struct TurnRequest<'a> {
    /// Full canonical conversation so far (user turn first).
    pub messages: &'a [Message],
    /// Display size of the bound computer in pixels.
    pub display: (u32, u32),
    pub os_type: OsType,
    /// At most this many recent screenshots expanded in the provider prompt.
    pub image_retention_window: Option<usize>,
    /// Mark the trailing N messages cache-eligible on providers that support
    /// explicit prompt caching.  Ignored elsewhere.
    pub cache_hint: Option<usize>,
    /// Per-request environment view: API keys and base-URL overrides are
    /// resolved through this, never through `std::env` directly.
    pub env: &'a EnvSnapshot,
    pub cancel: CancellationToken,
}

/// Canonical messages produced by one adapter round-trip.
#[derive(Debug, Default)]
pub struct TurnResult {
    pub messages: Vec<Message>,
    pub usage: Usage,
}

impl TurnResult {
    pub fn new(messages: Vec<Message>, usage: Usage) -> Self {
        Self { messages, usage }
    }

    /// The last `computer_call` in this turn, if any.
    pub fn computer_call(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m, Message::ComputerCall { .. }))
    }
}

/// An agent loop adapter: maps one canonical turn to one provider
/// round-trip and decodes the response back into canonical messages.
///
/// Adapters never perform I/O on the computer port; they only describe
/// actions.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    /// The model string this adapter was resolved from.
    fn model_name(&self) -> &str;

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError>;
}

/// Grounding request: turn a high-level intent plus the current screenshot
/// into one concrete action.
pub struct GroundRequest<'a> {
    /// Data URL (or HTTPS URL) of the current screenshot.
    pub screenshot_url: &'a str,
    /// Natural-language intent from the planner, e.g. "the Submit button".
    pub intent: &'a str,
    pub display: (u32, u32),
    pub env: &'a EnvSnapshot,
    pub cancel: CancellationToken,
}

/// The grounder side of a composite model (`planner+grounder`).
#[async_trait]
pub trait Grounder: Send + Sync {
    async fn ground(&self, req: GroundRequest<'_>) -> Result<(Action, Usage), ModelError>;
}
