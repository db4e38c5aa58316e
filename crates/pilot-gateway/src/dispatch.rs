// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use pilot_callbacks::{
    BudgetCap, CallbackPipeline, ImageRetention, PiiScrubber, PromptCacheHinter, TrajectoryWriter,
};
use pilot_config::{ComputerSpec, Config, EnvSnapshot};
use pilot_core::{Orchestrator, RunConfig, RunOutcome, RunRequest, TaskInput};
use pilot_model::{AgentLoop, LoopOptions, ModelError};
use pilot_schema::{Message, Usage};
use pilot_session::SessionManager;

/// Adapter factory used per request.  Injectable so tests can substitute
/// scripted loops for the registry resolution.
type Resolver = Box<dyn Fn(&str) -> Result<Box<dyn AgentLoop>, ModelError> + Send + Sync>;

/// `POST /responses` body; one data-channel message mirrors it exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesRequest {
    /// Model string; falls back to `CUA_MODEL_NAME`, then the configured
    /// default.
    pub model: Option<String>,
    pub input: Option<InputPayload>,
    #[serde(default)]
    pub agent_kwargs: AgentKwargs,
    pub computer_kwargs: Option<ComputerSpec>,
    /// Per-request environment overrides, scoped to the adapter call.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputPayload {
    Text(String),
    Messages(Vec<Message>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentKwargs {
    pub save_trajectory: Option<bool>,
    pub max_trajectory_budget: Option<f64>,
    pub max_steps: Option<u32>,
    pub image_retention_window: Option<usize>,
    pub session_id: Option<String>,
}

/// The structured reply.  The proxy never raises: every failure mode is a
/// `status=failed` reply with an `error` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesReply {
    pub output: Vec<Message>,
    pub usage: Usage,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsesReply {
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            output: vec![Message::assistant(format!("Run failed: {error}"))],
            usage: Usage::default(),
            status: "failed".into(),
            error: Some(error),
        }
    }
}

impl From<RunOutcome> for ResponsesReply {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            output: outcome.output,
            usage: outcome.usage,
            status: outcome.status.as_str().to_string(),
            error: outcome.error,
        }
    }
}

/// Stateless request dispatcher shared by the HTTP and P2P surfaces.
pub struct Dispatcher {
    manager: Arc<SessionManager>,
    config: Arc<Config>,
    resolver: Resolver,
}

impl Dispatcher {
    pub fn new(manager: Arc<SessionManager>, config: Arc<Config>) -> Self {
        Self {
            manager,
            config,
            resolver: Box::new(|model| pilot_model::resolve(model, LoopOptions::default())),
        }
    }

    /// Substitute the adapter factory (tests).
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Health check for `GET /health`: a real probe acquire+release against
    /// the configured computer spec, not a permit-counter peek.
    pub async fn healthy(&self) -> bool {
        self.manager.healthy(&self.config.computer).await
    }

    /// Run one request to completion and fold every outcome into a
    /// structured reply.
    pub async fn dispatch(&self, req: ResponsesRequest) -> ResponsesReply {
        let env = EnvSnapshot::with_overrides(req.env.clone());

        let model = req
            .model
            .clone()
            .or_else(|| env.get("CUA_MODEL_NAME"))
            .unwrap_or_else(|| self.config.model.clone());

        let task = match req.input {
            Some(InputPayload::Text(t)) => TaskInput::Text(t),
            Some(InputPayload::Messages(m)) => TaskInput::Messages(m),
            None => return ResponsesReply::failed("request has no input"),
        };

        // Resolve the adapter before touching any session state: unknown
        // models and misconfigurations must not consume a pool slot.
        let agent = match (self.resolver)(&model) {
            Ok(agent) => agent,
            Err(e) => return ResponsesReply::failed(e.to_string()),
        };

        let spec = req
            .computer_kwargs
            .clone()
            .unwrap_or_else(|| self.config.computer.clone());

        let session = match self
            .manager
            .ensure_session(req.agent_kwargs.session_id.clone(), &spec)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "session acquisition failed");
                return ResponsesReply::failed(e.to_string());
            }
        };
        info!(session_id = %session.session_id, model = %model, "dispatching run");

        let kwargs = req.agent_kwargs;
        let mut run_config = RunConfig::from(&self.config.agent);
        if let Some(steps) = kwargs.max_steps {
            run_config.max_steps = steps;
        }
        if let Some(window) = kwargs.image_retention_window {
            run_config.image_retention_window = Some(window);
        }

        let pipeline = self.build_pipeline(&kwargs, run_config.image_retention_window);
        let orchestrator = Orchestrator::new(run_config).with_pipeline(pipeline);

        // Spawn through the session manager so graceful shutdown can await
        // the run; the reply channel hands the outcome back to this
        // request handler.
        let (tx, rx) = oneshot::channel();
        let session_id = session.session_id.clone();
        let run_session_id = session_id.clone();
        let computer = Arc::clone(&session.computer);
        let cancel = session.cancel.clone();
        self.manager.spawn_task(&session_id, async move {
            let outcome = orchestrator
                .run(RunRequest {
                    task,
                    agent: agent.as_ref(),
                    computer: computer.as_ref(),
                    env: &env,
                    session_id: run_session_id,
                    cancel,
                })
                .await;
            let _ = tx.send(outcome);
        });

        match rx.await {
            Ok(outcome) => outcome.into(),
            Err(_) => ResponsesReply::failed("run task dropped before completion"),
        }
    }

    fn build_pipeline(
        &self,
        kwargs: &AgentKwargs,
        retention: Option<usize>,
    ) -> CallbackPipeline {
        let mut pipeline = CallbackPipeline::new().with(Arc::new(PiiScrubber::new()));

        if let Some(window) = retention {
            pipeline = pipeline.with(Arc::new(ImageRetention::new(window)));
        }
        if self.config.agent.prompt_cache {
            pipeline = pipeline.with(Arc::new(PromptCacheHinter::new(3)));
        }
        let budget = kwargs
            .max_trajectory_budget
            .or(self.config.agent.max_trajectory_budget);
        if let Some(max_usd) = budget {
            pipeline = pipeline.with(Arc::new(BudgetCap::new(max_usd)));
        }
        if kwargs.save_trajectory.unwrap_or(false) {
            let root = self
                .config
                .agent
                .save_trajectory_dir
                .clone()
                .unwrap_or_else(|| "trajectories".into());
            pipeline = pipeline
                .with(Arc::new(TrajectoryWriter::new(root).with_scrubber(PiiScrubber::new())));
        }
        pipeline
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_computer::{Computer, RecordingComputer};
    use pilot_model::ScriptedLoop;
    use pilot_session::{ComputerPool, StaticProvisioner};
    use std::time::Duration;

    fn dispatcher(pool_size: usize) -> Dispatcher {
        let computers: Vec<Arc<dyn Computer>> = (0..pool_size)
            .map(|_| Arc::new(RecordingComputer::new()) as Arc<dyn Computer>)
            .collect();
        let pool = Arc::new(ComputerPool::new(
            Arc::new(StaticProvisioner::new(computers)),
            pool_size,
            Duration::from_millis(50),
        ));
        let manager = Arc::new(SessionManager::new(
            pool,
            Duration::from_secs(300),
            Duration::from_secs(5),
        ));
        Dispatcher::new(manager, Arc::new(Config::default()))
            .with_resolver(Box::new(|_| Ok(Box::new(ScriptedLoop::click_then_text(3, 4, "ok")))))
    }

    fn request(session: &str) -> ResponsesRequest {
        ResponsesRequest {
            model: Some("anthropic/claude-sonnet-4-5".into()),
            input: Some(InputPayload::Text("do it".into())),
            agent_kwargs: AgentKwargs {
                session_id: Some(session.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_runs_to_completion() {
        let d = dispatcher(1);
        let reply = d.dispatch(request("s1")).await;
        assert_eq!(reply.status, "completed");
        assert!(reply.error.is_none());
        assert!(matches!(reply.output.last(), Some(Message::Assistant { .. })));
    }

    #[tokio::test]
    async fn missing_input_fails_structurally() {
        let d = dispatcher(1);
        let reply = d
            .dispatch(ResponsesRequest {
                model: Some("anthropic/claude-sonnet-4-5".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(reply.status, "failed");
        assert!(reply.error.unwrap().contains("no input"));
    }

    #[tokio::test]
    async fn unknown_model_fails_before_any_session() {
        let d = dispatcher(1);
        let mut req = request("s1");
        req.model = Some("skynet/hal".into());
        let reply = d.dispatch(req).await;
        assert_eq!(reply.status, "failed");
        assert!(reply.error.unwrap().contains("unknown model"));
        // The pool slot was never consumed; a probe acquire still succeeds.
        assert!(d.healthy().await);
    }

    #[tokio::test]
    async fn pool_exhaustion_is_reported_to_the_second_session() {
        let d = dispatcher(1);
        let first = d.dispatch(request("s1")).await;
        assert_eq!(first.status, "completed");

        // s1 still holds the only computer; a second session cannot bind.
        let second = d.dispatch(request("s2")).await;
        assert_eq!(second.status, "failed");
        assert!(second.error.unwrap().contains("exhausted"));
    }

    #[tokio::test]
    async fn same_session_reuses_its_computer() {
        let d = dispatcher(1);
        assert_eq!(d.dispatch(request("s1")).await.status, "completed");
        assert_eq!(d.dispatch(request("s1")).await.status, "completed");
    }
}
