// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use pilot_schema::{
    parse_data_url_parts, retain_recent_screenshots, Action, ContentPart, Message, MouseButton,
    Point, Usage, UserContent,
};

use crate::{
    http::{base_url, post_json},
    registry, AgentLoop, ModelError, TurnRequest, TurnResult,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const COMPUTER_BETA: &str = "computer-use-2025-01-24";

const SYSTEM_PROMPT: &str = "You are operating a remote computer through the \
`computer` tool. Work step by step: inspect the latest screenshot, perform \
exactly one action, then wait for the next screenshot. When the task is \
complete, reply with a short confirmation and stop calling the tool.";

/// Anthropic computer-use adapter (Messages API, `computer` tool).
///
/// Decodes `tool_use` blocks named `computer` into canonical
/// `computer_call`s; screenshots return as `tool_result` base64 image
/// content.  When a cache hint is present, `cache_control` markers are
/// attached to the trailing messages (capped at Anthropic's breakpoint
/// budget of 4).
pub struct AnthropicCuaLoop {
    model: String,
    full_name: String,
    client: reqwest::Client,
}

impl AnthropicCuaLoop {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            full_name: format!("anthropic/{model}"),
            model,
            client: reqwest::Client::new(),
        }
    }
}

// ── Action translation ────────────────────────────────────────────────────────

/// Canonical action → Anthropic `computer` tool input.
fn encode_action(action: &Action) -> Value {
    match action {
        Action::Click { button, x, y } => {
            let name = match button {
                MouseButton::Right => "right_click",
                MouseButton::Wheel => "middle_click",
                // No dedicated back/forward click on this tool version.
                _ => "left_click",
            };
            json!({ "action": name, "coordinate": [x, y] })
        }
        Action::DoubleClick { x, y, .. } => {
            json!({ "action": "double_click", "coordinate": [x, y] })
        }
        Action::Drag { path, .. } => {
            let start = path.first().copied().unwrap_or(Point::new(0, 0));
            let end = path.last().copied().unwrap_or(start);
            json!({
                "action": "left_click_drag",
                "start_coordinate": [start.x, start.y],
                "coordinate": [end.x, end.y],
            })
        }
        Action::Move { x, y } => json!({ "action": "mouse_move", "coordinate": [x, y] }),
        Action::Scroll { x, y, scroll_x, scroll_y } => {
            let (direction, amount) = if scroll_y.abs() >= scroll_x.abs() {
                (if *scroll_y > 0 { "down" } else { "up" }, scroll_y.abs())
            } else {
                (if *scroll_x > 0 { "right" } else { "left" }, scroll_x.abs())
            };
            json!({
                "action": "scroll",
                "coordinate": [x, y],
                "scroll_direction": direction,
                "scroll_amount": amount.max(1),
            })
        }
        Action::Keypress { keys } => json!({ "action": "key", "text": keys.join("+") }),
        Action::Type { text } => json!({ "action": "type", "text": text }),
        Action::Screenshot => json!({ "action": "screenshot" }),
        Action::Wait => json!({ "action": "wait", "duration": 1 }),
        Action::LeftMouseDown { x, y } => {
            json!({ "action": "left_mouse_down", "coordinate": [x, y] })
        }
        Action::LeftMouseUp { x, y } => {
            json!({ "action": "left_mouse_up", "coordinate": [x, y] })
        }
    }
}

fn coordinate(input: &Value) -> (i32, i32) {
    let c = &input["coordinate"];
    (
        c[0].as_i64().unwrap_or(0) as i32,
        c[1].as_i64().unwrap_or(0) as i32,
    )
}

/// Anthropic `computer` tool input → canonical action.
fn decode_action(input: &Value) -> Result<Action, ModelError> {
    let name = input["action"]
        .as_str()
        .ok_or_else(|| ModelError::target("computer tool_use without action field"))?;
    let (x, y) = coordinate(input);
    let action = match name {
        "left_click" => Action::Click { button: MouseButton::Left, x, y },
        "right_click" => Action::Click { button: MouseButton::Right, x, y },
        "middle_click" => Action::Click { button: MouseButton::Wheel, x, y },
        "double_click" | "triple_click" => {
            Action::DoubleClick { button: MouseButton::Left, x, y }
        }
        "left_click_drag" => {
            let s = &input["start_coordinate"];
            let start = Point::new(
                s[0].as_i64().unwrap_or(0) as i32,
                s[1].as_i64().unwrap_or(0) as i32,
            );
            Action::Drag { button: MouseButton::Left, path: vec![start, Point::new(x, y)] }
        }
        "mouse_move" => Action::Move { x, y },
        "scroll" => {
            let amount = input["scroll_amount"].as_i64().unwrap_or(3) as i32;
            let (sx, sy) = match input["scroll_direction"].as_str().unwrap_or("down") {
                "up" => (0, -amount),
                "left" => (-amount, 0),
                "right" => (amount, 0),
                _ => (0, amount),
            };
            Action::Scroll { x, y, scroll_x: sx, scroll_y: sy }
        }
        "key" | "hold_key" => {
            let text = input["text"].as_str().unwrap_or_default();
            Action::Keypress { keys: text.split('+').map(str::to_string).collect() }
        }
        "type" => Action::Type { text: input["text"].as_str().unwrap_or_default().into() },
        "screenshot" | "cursor_position" => Action::Screenshot,
        "wait" => Action::Wait,
        "left_mouse_down" => Action::LeftMouseDown { x, y },
        "left_mouse_up" => Action::LeftMouseUp { x, y },
        other => return Err(ModelError::target(format!("unsupported computer action: {other}"))),
    };
    Ok(action)
}

// ── Message translation ───────────────────────────────────────────────────────

fn image_block(image_url: &str) -> Value {
    match parse_data_url_parts(image_url) {
        Ok((mime, b64)) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime, "data": b64 },
        }),
        Err(_) => json!({
            "type": "image",
            "source": { "type": "url", "url": image_url },
        }),
    }
}

fn content_blocks(msg: &Message) -> Option<(&'static str, Vec<Value>)> {
    match msg {
        Message::User { content } => {
            let blocks = match content {
                UserContent::Text(t) => vec![json!({ "type": "text", "text": t })],
                UserContent::Parts(parts) => parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::InputText { text } => {
                            Some(json!({ "type": "text", "text": text }))
                        }
                        ContentPart::InputImage { image_url } => Some(image_block(image_url)),
                        _ => None,
                    })
                    .collect(),
            };
            Some(("user", blocks))
        }
        Message::Assistant { content } => {
            let text: String = content.iter().filter_map(|p| p.as_text()).collect();
            Some(("assistant", vec![json!({ "type": "text", "text": text })]))
        }
        // Thinking blocks cannot be replayed without their signatures.
        Message::Reasoning { .. } => None,
        Message::ComputerCall { call_id, action, .. } => Some((
            "assistant",
            vec![json!({
                "type": "tool_use",
                "id": call_id,
                "name": "computer",
                "input": encode_action(action),
            })],
        )),
        Message::ComputerCallOutput { call_id, output } => {
            let inner = match output {
                ContentPart::ComputerScreenshot { image_url }
                | ContentPart::InputImage { image_url } => vec![image_block(image_url)],
                other => vec![json!({
                    "type": "text",
                    "text": other.as_text().unwrap_or_default(),
                })],
            };
            Some((
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": inner,
                })],
            ))
        }
        Message::FunctionCall { call_id, name, arguments, .. } => {
            let input: Value =
                serde_json::from_str(arguments).unwrap_or(Value::String(arguments.clone()));
            Some((
                "assistant",
                vec![json!({ "type": "tool_use", "id": call_id, "name": name, "input": input })],
            ))
        }
        Message::FunctionCallOutput { call_id, output } => Some((
            "user",
            vec![json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": output,
            })],
        )),
    }
}

/// Build the alternating-role message array the Messages API requires,
/// merging adjacent blocks of the same role.
fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<(String, Vec<Value>)> = Vec::new();
    for msg in messages {
        let Some((role, blocks)) = content_blocks(msg) else { continue };
        match out.last_mut() {
            Some((last_role, last_blocks)) if last_role.as_str() == role => {
                last_blocks.extend(blocks);
            }
            _ => out.push((role.to_string(), blocks)),
        }
    }
    out.into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

/// Attach `cache_control` markers to the final block of the last
/// `hint` messages.  Anthropic allows at most 4 explicit breakpoints per
/// request; the system prompt takes one, leaving 3 for the conversation.
fn apply_cache_markers(messages: &mut [Value], hint: usize) {
    let budget = hint.min(3);
    let len = messages.len();
    for msg in messages.iter_mut().skip(len.saturating_sub(budget)) {
        if let Some(blocks) = msg["content"].as_array_mut() {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = json!({ "type": "ephemeral" });
            }
        }
    }
}

#[async_trait]
impl AgentLoop for AnthropicCuaLoop {
    fn model_name(&self) -> &str {
        &self.full_name
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        let meta = registry::get_driver("anthropic").expect("anthropic driver registered");
        let key = turn
            .env
            .get(meta.default_api_key_env.unwrap_or_default())
            .ok_or_else(|| ModelError::Configuration("ANTHROPIC_API_KEY not set".into()))?;
        let base = base_url(meta, turn.env)?;

        let windowed = retain_recent_screenshots(turn.messages, turn.image_retention_window);
        let mut messages = build_messages(&windowed);
        if let Some(hint) = turn.cache_hint {
            apply_cache_markers(&mut messages, hint);
        }

        let (width, height) = turn.display;
        let system = if turn.cache_hint.is_some() {
            json!([{
                "type": "text",
                "text": SYSTEM_PROMPT,
                "cache_control": { "type": "ephemeral" },
            }])
        } else {
            json!(SYSTEM_PROMPT)
        };
        let body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": system,
            "messages": messages,
            "tools": [{
                "type": "computer_20250124",
                "name": "computer",
                "display_width_px": width,
                "display_height_px": height,
            }],
        });

        debug!(model = %self.model, cache_hint = ?turn.cache_hint, "sending anthropic request");
        let headers = vec![
            ("x-api-key".to_string(), key),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("anthropic-beta".to_string(), COMPUTER_BETA.to_string()),
        ];
        let resp = post_json(
            &self.client,
            &format!("{base}/v1/messages"),
            &headers,
            &body,
            &turn.cancel,
        )
        .await?;

        let mut out = Vec::new();
        for block in resp["content"].as_array().cloned().unwrap_or_default() {
            match block["type"].as_str().unwrap_or("") {
                "text" => {
                    if let Some(t) = block["text"].as_str() {
                        if !t.is_empty() {
                            out.push(Message::assistant(t));
                        }
                    }
                }
                "thinking" => {
                    if let Some(t) = block["thinking"].as_str() {
                        out.push(Message::reasoning(t));
                    }
                }
                "tool_use" => {
                    let call_id = block["id"].as_str().unwrap_or_default().to_string();
                    if block["name"] == "computer" {
                        let action = decode_action(&block["input"])?;
                        out.push(Message::computer_call(call_id, action));
                    } else {
                        out.push(Message::function_call(
                            call_id,
                            block["name"].as_str().unwrap_or_default(),
                            block["input"].to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
        if out.is_empty() {
            return Err(ModelError::target("empty response from anthropic"));
        }

        let usage = Usage::new(
            resp["usage"]["input_tokens"].as_u64().unwrap_or(0),
            resp["usage"]["output_tokens"].as_u64().unwrap_or(0),
            0.0,
        );

        Ok(TurnResult::new(out, usage))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
