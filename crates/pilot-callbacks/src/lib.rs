// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod budget;
mod cache;
mod pii;
mod pipeline;
mod retention;
mod trajectory;

pub use budget::BudgetCap;
pub use cache::PromptCacheHinter;
pub use pii::PiiScrubber;
pub use pipeline::{
    ActionDecision, ActionOutcome, Callback, CallbackPipeline, ErrorDecision, HookError,
    RunContext, RunSummary, TurnInput, TurnOutput,
};
pub use retention::ImageRetention;
pub use trajectory::TrajectoryWriter;
