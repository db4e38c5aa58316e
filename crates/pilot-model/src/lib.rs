// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;

mod anthropic;
mod composite;
mod error;
mod http;
mod human;
pub mod mock;
mod omniparser;
mod openai;
mod spec;
mod turn;
mod uitars;
mod vlm;

pub use anthropic::AnthropicCuaLoop;
pub use composite::{CompositeLoop, GROUND_TOOL};
pub use error::ModelError;
pub use human::{human_channel, HumanController, HumanLoop};
pub use mock::{FailingLoop, RecordedTurn, ScriptedGrounder, ScriptedLoop};
pub use omniparser::{OmniparserGrounder, SomElement};
pub use openai::OpenAiCuaLoop;
pub use registry::{get_driver, list_drivers, DriverMeta};
pub use spec::{ModelRef, ModelSpec};
pub use turn::{AgentLoop, GroundRequest, Grounder, TurnRequest, TurnResult};
pub use uitars::UiTarsLoop;
pub use vlm::VlmChatLoop;

use std::sync::Arc;

/// Resolution-time options that cannot be derived from the model string.
#[derive(Default)]
pub struct LoopOptions {
    /// Adapter half of [`human_channel`].  Required when resolving the
    /// `human` provider; ignored otherwise.
    pub human: Option<HumanLoop>,
}

/// Construct a boxed [`AgentLoop`] from a model string.
///
/// Simple strings resolve to one driver; `planner+grounder` strings
/// resolve both sides and bind them in a [`CompositeLoop`].  Adapter
/// instances are fresh per call – they carry per-run provider state –
/// while the parsed [`ModelSpec`] itself is cached per string.
pub fn resolve(model: &str, opts: LoopOptions) -> Result<Box<dyn AgentLoop>, ModelError> {
    let spec = ModelSpec::parse(model)?;

    let Some(grounder_ref) = &spec.grounder else {
        return build_planner(&spec.planner, opts);
    };

    let planner = build_planner(&spec.planner, opts)?;
    let grounder = build_grounder(grounder_ref)?;
    Ok(Box::new(CompositeLoop::new(model, planner, grounder)))
}

fn build_planner(r: &ModelRef, opts: LoopOptions) -> Result<Box<dyn AgentLoop>, ModelError> {
    match r.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiCuaLoop::new(r.name.clone()))),
        "anthropic" => Ok(Box::new(AnthropicCuaLoop::new(r.name.clone()))),
        "ollama_chat" => Ok(Box::new(VlmChatLoop::new("ollama_chat", r.name.clone()))),
        // Local servers: UI-TARS-family models get the box-token parser,
        // everything else the strict-JSON protocol.  Both speak the same
        // chat-completions wire.
        "huggingface-local" => Ok(local_loop("huggingface-local", &r.name)),
        "mlx" => Ok(local_loop("mlx", &r.name)),
        "omniparser" => Err(ModelError::Configuration(
            "omniparser is grounder-only; use it as `planner+omniparser`".into(),
        )),
        "human" => match opts.human {
            Some(h) => Ok(Box::new(h)),
            None => Err(ModelError::Configuration(
                "the human driver needs a controller; create one with human_channel()".into(),
            )),
        },
        other => Err(ModelError::UnknownModel(other.to_string())),
    }
}

fn local_loop(provider: &'static str, name: &str) -> Box<dyn AgentLoop> {
    if UiTarsLoop::matches_model(name) {
        Box::new(UiTarsLoop::new(provider, name.to_string()))
    } else {
        Box::new(VlmChatLoop::new(provider, name.to_string()))
    }
}

fn build_grounder(r: &ModelRef) -> Result<Arc<dyn Grounder>, ModelError> {
    match r.provider.as_str() {
        "omniparser" => Ok(Arc::new(OmniparserGrounder::new())),
        "huggingface-local" | "mlx" if UiTarsLoop::matches_model(&r.name) => {
            let provider = if r.provider == "mlx" { "mlx" } else { "huggingface-local" };
            Ok(Arc::new(UiTarsLoop::new(provider, r.name.clone())))
        }
        other => Err(ModelError::Configuration(format!(
            "{other}/{} cannot serve as a grounder",
            r.name
        ))),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
