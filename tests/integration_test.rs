// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios over the run orchestrator, session manager, and
//! callback pipeline, driven by scripted fakes (no network, no real LLM).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use pilot_callbacks::{
    ActionDecision, BudgetCap, Callback, CallbackPipeline, HookError, ImageRetention, RunContext,
    TrajectoryWriter, TurnOutput,
};
use pilot_computer::{Computer, RecordingComputer};
use pilot_config::{ComputerSpec, EnvSnapshot};
use pilot_core::{Orchestrator, RunConfig, RunOutcome, RunRequest, RunStatus, TaskInput};
use pilot_model::{
    AgentLoop, CompositeLoop, FailingLoop, ModelError, ScriptedGrounder, ScriptedLoop, TurnResult,
    GROUND_TOOL,
};
use pilot_schema::{Action, ContentPart, Message, Usage};
use pilot_session::{ComputerPool, PoolError, SessionError, SessionManager, StaticProvisioner};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn fast_config() -> RunConfig {
    RunConfig {
        llm_timeout: Duration::from_secs(5),
        action_timeout: Duration::from_secs(5),
        run_timeout: Duration::from_secs(30),
        ..RunConfig::default()
    }
}

async fn run(
    agent: &dyn AgentLoop,
    computer: &RecordingComputer,
    orchestrator: &Orchestrator,
    cancel: CancellationToken,
) -> RunOutcome {
    let env = EnvSnapshot::process();
    orchestrator
        .run(RunRequest {
            task: TaskInput::Text("complete the task on screen".into()),
            agent,
            computer,
            env: &env,
            session_id: "it-session".into(),
            cancel,
        })
        .await
}

fn kinds(output: &[Message]) -> Vec<&'static str> {
    output.iter().map(|m| m.kind()).collect()
}

fn count_kind(output: &[Message], kind: &str) -> usize {
    output.iter().filter(|m| m.kind() == kind).count()
}

/// Invariant 1: calls and outputs are balanced and alternate.
fn assert_balanced(output: &[Message]) {
    assert_eq!(
        count_kind(output, "computer_call"),
        count_kind(output, "computer_call_output"),
        "calls and outputs must balance: {:?}",
        kinds(output),
    );
    let mut pending: Option<&str> = None;
    for msg in output {
        match msg {
            Message::ComputerCall { call_id, .. } => {
                assert!(pending.is_none(), "nested computer_call before output");
                pending = Some(call_id.as_str());
            }
            Message::ComputerCallOutput { call_id, .. } => {
                assert_eq!(pending, Some(call_id.as_str()), "output out of order");
                pending = None;
            }
            _ => {}
        }
    }
    assert!(pending.is_none(), "dangling computer_call at end of run");
}

// ── S1: single click ──────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_single_click() {
    let agent = ScriptedLoop::new(vec![
        Ok(TurnResult::new(
            vec![Message::computer_call("call_1", Action::click(100, 200))],
            Usage::new(50, 10, 0.0),
        )),
        Ok(TurnResult::new(
            vec![Message::assistant("clicked the target")],
            Usage::new(60, 5, 0.0),
        )),
    ]);
    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(fast_config());

    let outcome = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    // The computer saw exactly the cursor move and the click.
    let input_ops: Vec<String> = computer
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("screenshot"))
        .collect();
    assert_eq!(input_ops, vec!["move_cursor(100,200)", "left_click(100,200)"]);

    assert_eq!(count_kind(&outcome.output, "computer_call"), 1);
    assert_eq!(count_kind(&outcome.output, "computer_call_output"), 1);
    assert_eq!(count_kind(&outcome.output, "assistant"), 1);
    assert_balanced(&outcome.output);
}

// ── S2: composite planner+grounder ────────────────────────────────────────────

#[tokio::test]
async fn s2_composite_planner_grounder() {
    let planner = ScriptedLoop::new(vec![
        Ok(TurnResult::new(
            vec![
                Message::reasoning("I need to find the submit button"),
                Message::function_call("g1", GROUND_TOOL, "the Submit button"),
            ],
            Usage::new(100, 20, 0.0),
        )),
        Ok(TurnResult::new(
            vec![Message::assistant("done")],
            Usage::new(110, 5, 0.0),
        )),
    ]);
    let grounder = Arc::new(ScriptedGrounder::new(vec![(
        Action::click(512, 400),
        Usage::new(30, 2, 0.0),
    )]));
    let composite = CompositeLoop::new("planner+grounder", Box::new(planner), grounder.clone());

    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(fast_config());
    let outcome = run(&composite, &computer, &orchestrator, CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(grounder.intents(), vec!["the Submit button"]);
    assert_eq!(
        kinds(&outcome.output),
        vec![
            "user",
            "reasoning",
            "function_call",
            "computer_call",
            "computer_call_output",
            "assistant",
        ],
    );
    // The grounded click was dispatched at the grounder's coordinates.
    assert!(computer.calls().contains(&"left_click(512,400)".to_string()));
    // Usage sums planner and grounder contributions.
    assert_eq!(outcome.usage.prompt_tokens, 240);
}

// ── S3: retry under TransportError ────────────────────────────────────────────

struct ErrorCounter {
    count: Arc<Mutex<u32>>,
}

impl Callback for ErrorCounter {
    fn name(&self) -> &str {
        "error_counter"
    }
    fn on_error(
        &self,
        _ctx: &RunContext,
        error: &pilot_schema::PortError,
    ) -> pilot_callbacks::ErrorDecision {
        *self.count.lock().unwrap() += 1;
        pilot_callbacks::ErrorDecision::Propagate(error.to_string())
    }
}

#[tokio::test]
async fn s3_transport_errors_retry_internally() {
    let agent = ScriptedLoop::new(vec![
        Err(ModelError::transport("connection reset")),
        Err(ModelError::transport("connection reset again")),
        Ok(TurnResult::new(
            vec![Message::assistant("third time lucky")],
            Usage::new(10, 5, 0.0),
        )),
    ]);
    let errors = Arc::new(Mutex::new(0));
    let pipeline = CallbackPipeline::new().with(Arc::new(ErrorCounter {
        count: Arc::clone(&errors),
    }));
    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(fast_config()).with_pipeline(pipeline);

    let started = Instant::now();
    let outcome = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(*errors.lock().unwrap(), 0, "retries are internal to the turn");
    // Two back-offs happened (≥ 500ms + 1000ms, with jitter ≥ 0.75×).
    assert!(started.elapsed() >= Duration::from_millis(1100));
    // Retries do not consume steps: one assistant message, no extras.
    assert_eq!(count_kind(&outcome.output, "assistant"), 1);
}

#[tokio::test]
async fn unrecovered_adapter_failure_yields_failed_status() {
    let agent = FailingLoop::target("provider rejected the request");
    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(fast_config());

    let outcome = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(agent.calls(), 1, "target errors are not retried");
    assert!(outcome.error.unwrap().contains("provider rejected"));
    // Even a failed run carries the user turn and a terminal assistant.
    assert!(matches!(outcome.output.first(), Some(Message::User { .. })));
    assert!(matches!(outcome.output.last(), Some(Message::Assistant { .. })));
}

// ── S4: budget cap ────────────────────────────────────────────────────────────

#[tokio::test]
async fn s4_budget_cap_terminates_cleanly() {
    let scripts: Vec<_> = (0..10)
        .map(|i| {
            Ok(TurnResult::new(
                vec![Message::computer_call(format!("c{i}"), Action::click(1, 1))],
                Usage::new(10, 10, 0.006),
            ))
        })
        .collect();
    let agent = ScriptedLoop::new(scripts);
    let computer = RecordingComputer::new();
    let pipeline = CallbackPipeline::new().with(Arc::new(BudgetCap::new(0.01)));
    let orchestrator = Orchestrator::new(fast_config()).with_pipeline(pipeline);

    let outcome = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(agent.calls(), 2, "the second turn crosses the cap");
    let terminal = outcome.output.last().unwrap().assistant_text().unwrap();
    assert!(terminal.contains("budget"), "terminal message must name the budget: {terminal}");
    assert_balanced(&outcome.output);
}

// ── S5: cancellation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn s5_cancellation_mid_action() {
    let agent = ScriptedLoop::new(vec![
        Ok(TurnResult::new(
            vec![Message::computer_call("c1", Action::Type { text: "hello".into() })],
            Usage::new(10, 5, 0.0),
        )),
        // Pre-computed follow-up that must never run.
        Ok(TurnResult::new(
            vec![Message::computer_call("c2", Action::click(9, 9))],
            Usage::new(10, 5, 0.0),
        )),
    ]);
    let computer = RecordingComputer::new().with_delay("type_text", Duration::from_secs(2));

    let trajectory_root = tempfile::tempdir().unwrap();
    let writer = Arc::new(TrajectoryWriter::new(trajectory_root.path()));
    let pipeline = CallbackPipeline::new().with(writer.clone() as Arc<dyn Callback>);
    let orchestrator = Orchestrator::new(fast_config()).with_pipeline(pipeline);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let outcome = run(&agent, &computer, &orchestrator, cancel).await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    // Liveness: well inside per_action_timeout + 100 ms.
    assert!(started.elapsed() < Duration::from_secs(5) + Duration::from_millis(100));
    // The second scripted action was never requested or dispatched.
    assert_eq!(agent.calls(), 1);
    assert!(!computer.calls().iter().any(|c| c.contains("click")));
    assert_balanced(&outcome.output);

    // The trajectory records the cancellation reason.
    let log = std::fs::read_to_string(writer.run_dir().unwrap().join("messages.jsonl")).unwrap();
    assert!(log.to_lowercase().contains("cancel"));
}

// ── S6: pool exhaustion ───────────────────────────────────────────────────────

fn manager_with_pool(size: usize) -> Arc<SessionManager> {
    let computers: Vec<Arc<dyn Computer>> = (0..size)
        .map(|_| Arc::new(RecordingComputer::new()) as Arc<dyn Computer>)
        .collect();
    let pool = Arc::new(ComputerPool::new(
        Arc::new(StaticProvisioner::new(computers)),
        size,
        Duration::from_millis(50),
    ));
    Arc::new(SessionManager::new(
        pool,
        Duration::from_secs(300),
        Duration::from_secs(5),
    ))
}

#[tokio::test]
async fn s6_pool_exhaustion_hits_second_session_only() {
    let manager = manager_with_pool(1);
    let spec = ComputerSpec::default();

    let first = manager.ensure_session(Some("s1".into()), &spec).await;
    let second = manager.ensure_session(Some("s2".into()), &spec).await;

    let first = first.expect("first session proceeds normally");
    assert!(matches!(
        second,
        Err(SessionError::Pool(PoolError::Exhausted))
    ));

    // And the first can still run.
    let agent = ScriptedLoop::always_text("fine");
    let orchestrator = Orchestrator::new(fast_config());
    let env = EnvSnapshot::process();
    let outcome = orchestrator
        .run(RunRequest {
            task: TaskInput::Text("go".into()),
            agent: &agent,
            computer: first.computer.as_ref(),
            env: &env,
            session_id: first.session_id.clone(),
            cancel: first.cancel.clone(),
        })
        .await;
    assert_eq!(outcome.status, RunStatus::Completed);
}

// ── Universal invariants ──────────────────────────────────────────────────────

#[tokio::test]
async fn usage_is_the_sum_over_turns() {
    let agent = ScriptedLoop::new(vec![
        Ok(TurnResult::new(
            vec![Message::computer_call("c1", Action::click(1, 1))],
            Usage::new(11, 7, 0.001),
        )),
        Ok(TurnResult::new(
            vec![Message::computer_call("c2", Action::click(2, 2))],
            Usage::new(13, 5, 0.002),
        )),
        Ok(TurnResult::new(
            vec![Message::assistant("done")],
            Usage::new(17, 3, 0.003),
        )),
    ]);
    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(fast_config());
    let outcome = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    assert_eq!(outcome.usage.prompt_tokens, 41);
    assert_eq!(outcome.usage.completion_tokens, 15);
    assert_eq!(outcome.usage.total_tokens, 56);
    assert!(outcome.usage.response_cost >= 0.0);
    assert!((outcome.usage.response_cost - 0.006).abs() < 1e-9);
}

#[tokio::test]
async fn step_cap_bounds_ask_transitions() {
    let scripts: Vec<_> = (0..50)
        .map(|i| {
            Ok(TurnResult::new(
                vec![Message::computer_call(format!("c{i}"), Action::click(1, 1))],
                Usage::new(1, 1, 0.0),
            ))
        })
        .collect();
    let agent = ScriptedLoop::new(scripts);
    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(RunConfig { max_steps: 7, ..fast_config() });

    let outcome = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(agent.calls(), 7);
    assert_balanced(&outcome.output);
}

#[tokio::test]
async fn retention_window_bounds_expanded_screenshots() {
    const WINDOW: usize = 2;
    let scripts: Vec<_> = (0..6)
        .map(|i| {
            Ok(TurnResult::new(
                vec![Message::computer_call(format!("c{i}"), Action::click(1, 1))],
                Usage::new(1, 1, 0.0),
            ))
        })
        .chain(std::iter::once(Ok(TurnResult::new(
            vec![Message::assistant("done")],
            Usage::new(1, 1, 0.0),
        ))))
        .collect();
    let agent = ScriptedLoop::new(scripts);
    let computer = RecordingComputer::new();
    let pipeline = CallbackPipeline::new().with(Arc::new(ImageRetention::new(WINDOW)));
    let orchestrator = Orchestrator::new(fast_config()).with_pipeline(pipeline);

    let _ = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    for (turn, request) in agent.requests().iter().enumerate() {
        let expanded = request
            .messages
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    Message::ComputerCallOutput {
                        output: ContentPart::ComputerScreenshot { .. },
                        ..
                    }
                )
            })
            .count();
        assert!(
            expanded <= WINDOW,
            "turn {turn} saw {expanded} expanded screenshots (window {WINDOW})"
        );
    }
}

struct OrderProbe {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Callback for OrderProbe {
    fn name(&self) -> &str {
        self.label
    }
    fn before_action(
        &self,
        _ctx: &RunContext,
        action: Action,
    ) -> Result<ActionDecision, HookError> {
        self.log.lock().unwrap().push(format!("before:{}", self.label));
        Ok(ActionDecision::Proceed(action))
    }
    fn after_llm(&self, _ctx: &RunContext, output: TurnOutput) -> Result<TurnOutput, HookError> {
        self.log.lock().unwrap().push(format!("after:{}", self.label));
        Ok(output)
    }
}

#[tokio::test]
async fn callback_ordering_is_symmetric() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = CallbackPipeline::new();
    for label in ["c1", "c2", "c3"] {
        pipeline = pipeline.with(Arc::new(OrderProbe { label, log: Arc::clone(&log) }));
    }
    let agent = ScriptedLoop::click_then_text(1, 1, "done");
    let computer = RecordingComputer::new();
    let orchestrator = Orchestrator::new(fast_config()).with_pipeline(pipeline);

    let _ = run(&agent, &computer, &orchestrator, CancellationToken::new()).await;

    let log = log.lock().unwrap();
    // First turn: after_llm (reversed), then before_action (in order).
    let first_turn: Vec<&str> = log.iter().take(6).map(String::as_str).collect();
    assert_eq!(
        first_turn,
        vec!["after:c3", "after:c2", "after:c1", "before:c1", "before:c2", "before:c3"],
    );
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_each_handle_once() {
    let computers: Vec<Arc<dyn Computer>> = vec![
        Arc::new(RecordingComputer::new()),
        Arc::new(RecordingComputer::new()),
    ];
    let provisioner = Arc::new(StaticProvisioner::new(computers));
    let pool = Arc::new(ComputerPool::new(
        Arc::clone(&provisioner) as Arc<dyn pilot_session::Provisioner>,
        2,
        Duration::from_millis(50),
    ));
    let manager = Arc::new(SessionManager::new(
        pool,
        Duration::from_secs(300),
        Duration::from_secs(1),
    ));

    let spec = ComputerSpec::default();
    let _a = manager.ensure_session(Some("s1".into()), &spec).await.unwrap();
    let _b = manager.ensure_session(Some("s2".into()), &spec).await.unwrap();

    manager.shutdown().await;
    let closed_once = provisioner.closed();
    manager.shutdown().await;
    let closed_twice = provisioner.closed();

    assert_eq!(closed_once.len(), 2, "both handles closed on first shutdown");
    assert_eq!(closed_once, closed_twice, "second shutdown must not double-close");
    assert!(!manager.healthy(&spec).await);
}

#[tokio::test]
async fn schema_round_trips_every_message_kind() {
    let samples = vec![
        Message::user("plain"),
        Message::user_with_parts(vec![
            ContentPart::input_text("look"),
            ContentPart::InputImage { image_url: "data:image/png;base64,AA==".into() },
        ]),
        Message::assistant("text"),
        Message::reasoning("thinking"),
        Message::computer_call("c1", Action::Drag {
            button: Default::default(),
            path: vec![pilot_schema::Point::new(0, 0), pilot_schema::Point::new(5, 5)],
        }),
        Message::computer_call_output("c1", "data:image/png;base64,BB=="),
        Message::function_call("f1", "ground", "the button"),
        Message::function_call_output("f1", "ok"),
    ];
    for msg in samples {
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }
}
