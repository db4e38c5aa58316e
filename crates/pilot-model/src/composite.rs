// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use pilot_schema::{ContentPart, Message, UserContent};

use crate::{AgentLoop, GroundRequest, Grounder, ModelError, TurnRequest, TurnResult};

/// Name of the pseudo-tool a planner calls to request grounding.
pub const GROUND_TOOL: &str = "ground";

/// Composite agent: a planner adapter paired with a grounder.
///
/// Per turn the planner sees the history minus grounder noise and returns
/// one of: a `computer_call` (the planner grounded itself), a
/// `function_call{name:"ground"}` carrying an intent, or a terminal
/// assistant message.  For the middle case the grounder converts
/// `{screenshot, intent}` into a concrete `computer_call`; usage totals are
/// summed.  When a turn contains both assistant text and a ground call,
/// the call wins (action first).
pub struct CompositeLoop {
    planner: Box<dyn AgentLoop>,
    grounder: Arc<dyn Grounder>,
    full_name: String,
}

impl CompositeLoop {
    pub fn new(
        full_name: impl Into<String>,
        planner: Box<dyn AgentLoop>,
        grounder: Arc<dyn Grounder>,
    ) -> Self {
        Self { planner, grounder, full_name: full_name.into() }
    }
}

/// The planner's view of history: grounder detection dumps are replaced by
/// a terse acknowledgement.  Bounding-box noise only burns planner
/// context, but every past `ground` call still needs *an* output so
/// provider-side tool pairing stays valid.
fn planner_view(messages: &[Message]) -> Vec<Message> {
    let ground_ids: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match m {
            Message::FunctionCall { call_id, name, .. } if name == GROUND_TOOL => {
                Some(call_id.as_str())
            }
            _ => None,
        })
        .collect();
    let answered: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match m {
            Message::FunctionCallOutput { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut view = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg {
            Message::FunctionCallOutput { call_id, .. }
                if ground_ids.contains(call_id.as_str()) =>
            {
                view.push(Message::function_call_output(call_id.clone(), "grounded"));
            }
            Message::FunctionCall { call_id, name, .. }
                if name == GROUND_TOOL && !answered.contains(call_id.as_str()) =>
            {
                view.push(msg.clone());
                view.push(Message::function_call_output(call_id.clone(), "grounded"));
            }
            _ => view.push(msg.clone()),
        }
    }
    view
}

/// Most recent screenshot available to ground against.
fn latest_screenshot(messages: &[Message]) -> Option<&str> {
    messages.iter().rev().find_map(|m| match m {
        Message::ComputerCallOutput {
            output: ContentPart::ComputerScreenshot { image_url },
            ..
        } => Some(image_url.as_str()),
        Message::User { content: UserContent::Parts(parts) } => {
            parts.iter().rev().find_map(|p| match p {
                ContentPart::InputImage { image_url } => Some(image_url.as_str()),
                _ => None,
            })
        }
        _ => None,
    })
}

#[async_trait]
impl AgentLoop for CompositeLoop {
    fn model_name(&self) -> &str {
        &self.full_name
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        let view = planner_view(turn.messages);
        let planner_turn = TurnRequest {
            messages: &view,
            display: turn.display,
            os_type: turn.os_type,
            image_retention_window: turn.image_retention_window,
            cache_hint: turn.cache_hint,
            env: turn.env,
            cancel: turn.cancel.clone(),
        };
        let mut result = self.planner.step(planner_turn).await?;

        // Already grounded, or terminal: pass through unchanged.
        let intent = result.messages.iter().find_map(|m| match m {
            Message::FunctionCall { name, arguments, .. } if name == GROUND_TOOL => {
                Some(arguments.clone())
            }
            _ => None,
        });
        let has_computer_call = result
            .messages
            .iter()
            .any(|m| matches!(m, Message::ComputerCall { .. }));

        let Some(intent) = intent else { return Ok(result) };
        if has_computer_call {
            return Ok(result);
        }

        let screenshot = latest_screenshot(turn.messages).ok_or_else(|| {
            ModelError::target("planner requested grounding before any screenshot exists")
        })?;

        debug!(intent = %intent, "grounding planner intent");
        let (action, ground_usage) = self
            .grounder
            .ground(GroundRequest {
                screenshot_url: screenshot,
                intent: &intent,
                display: turn.display,
                env: turn.env,
                cancel: turn.cancel.clone(),
            })
            .await?;

        result
            .messages
            .push(Message::computer_call(Message::new_call_id(), action));
        result.usage.add(&ground_usage);
        Ok(result)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedGrounder, ScriptedLoop};
    use pilot_config::EnvSnapshot;
    use pilot_schema::{Action, OsType, Usage};
    use tokio_util::sync::CancellationToken;

    fn turn<'a>(messages: &'a [Message], env: &'a EnvSnapshot) -> TurnRequest<'a> {
        TurnRequest {
            messages,
            display: (1024, 768),
            os_type: OsType::Linux,
            image_retention_window: None,
            cache_hint: None,
            env,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn planner_view_compacts_ground_outputs() {
        let history = vec![
            Message::user("task"),
            Message::function_call("g1", GROUND_TOOL, "the button"),
            Message::function_call_output("g1", "{\"elements\": [\"huge dump\"]}"),
            Message::function_call("f1", "lookup", "{}"),
            Message::function_call_output("f1", "result"),
        ];
        let view = planner_view(&history);
        assert_eq!(view.len(), 5);
        match &view[2] {
            Message::FunctionCallOutput { call_id, output } => {
                assert_eq!(call_id, "g1");
                assert_eq!(output, "grounded");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // Non-ground tool traffic is untouched.
        assert!(matches!(&view[4], Message::FunctionCallOutput { output, .. } if output == "result"));
    }

    #[test]
    fn planner_view_pairs_unanswered_ground_calls() {
        let history = vec![
            Message::user("task"),
            Message::function_call("g1", GROUND_TOOL, "the button"),
            Message::computer_call("c1", Action::click(1, 1)),
            Message::computer_call_output("c1", "data:image/png;base64,AA=="),
        ];
        let view = planner_view(&history);
        // A synthetic output follows the dangling ground call.
        assert!(matches!(
            &view[2],
            Message::FunctionCallOutput { call_id, output } if call_id == "g1" && output == "grounded"
        ));
    }

    #[tokio::test]
    async fn ground_call_is_expanded_into_computer_call() {
        let planner = ScriptedLoop::new(vec![Ok(TurnResult::new(
            vec![Message::function_call("g1", GROUND_TOOL, "the Submit button")],
            Usage::new(10, 5, 0.001),
        ))]);
        let grounder =
            Arc::new(ScriptedGrounder::new(vec![(Action::click(512, 400), Usage::new(3, 1, 0.0005))]));
        let composite =
            CompositeLoop::new("test+grounder", Box::new(planner), grounder.clone());

        let history = vec![
            Message::user("submit the form"),
            Message::computer_call("c0", Action::Screenshot),
            Message::computer_call_output("c0", "data:image/png;base64,AA=="),
        ];
        let env = EnvSnapshot::process();
        let result = composite.step(turn(&history, &env)).await.unwrap();

        // function_call then computer_call, usage summed.
        assert_eq!(result.messages.len(), 2);
        assert!(matches!(result.messages[0], Message::FunctionCall { .. }));
        match &result.messages[1] {
            Message::ComputerCall { action, .. } => assert_eq!(*action, Action::click(512, 400)),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(result.usage.prompt_tokens, 13);
        assert_eq!(grounder.intents(), vec!["the Submit button"]);
    }

    #[tokio::test]
    async fn terminal_assistant_passes_through() {
        let planner = ScriptedLoop::new(vec![Ok(TurnResult::new(
            vec![Message::assistant("done")],
            Usage::default(),
        ))]);
        let grounder = Arc::new(ScriptedGrounder::new(vec![]));
        let composite = CompositeLoop::new("test+grounder", Box::new(planner), grounder);

        let history = vec![Message::user("task")];
        let env = EnvSnapshot::process();
        let result = composite.step(turn(&history, &env)).await.unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].assistant_text().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn planner_computer_call_skips_grounder() {
        let planner = ScriptedLoop::new(vec![Ok(TurnResult::new(
            vec![Message::computer_call("c1", Action::click(1, 2))],
            Usage::default(),
        ))]);
        let grounder = Arc::new(ScriptedGrounder::new(vec![]));
        let composite = CompositeLoop::new("test+grounder", Box::new(planner), grounder.clone());

        let history = vec![Message::user("task")];
        let env = EnvSnapshot::process();
        let result = composite.step(turn(&history, &env)).await.unwrap();
        assert_eq!(result.messages.len(), 1);
        assert!(grounder.intents().is_empty());
    }

    #[tokio::test]
    async fn grounding_without_screenshot_is_target_error() {
        let planner = ScriptedLoop::new(vec![Ok(TurnResult::new(
            vec![Message::function_call("g1", GROUND_TOOL, "anything")],
            Usage::default(),
        ))]);
        let grounder = Arc::new(ScriptedGrounder::new(vec![]));
        let composite = CompositeLoop::new("test+grounder", Box::new(planner), grounder);

        let history = vec![Message::user("task")];
        let env = EnvSnapshot::process();
        let err = composite.step(turn(&history, &env)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
