// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use pilot_schema::{Action, ContentPart, Message, MouseButton, Point, Usage, UserContent};

use crate::{
    http::{base_url, post_json},
    registry, AgentLoop, GroundRequest, Grounder, ModelError, TurnRequest, TurnResult,
};

/// Size of the coordinate token space: UI-TARS-style models emit positions
/// normalised to a 1000×1000 grid regardless of the real display size.
const TOKEN_SPACE: f64 = 1000.0;

const SYSTEM_PROMPT: &str = "You are a GUI agent controlling a computer. \
Given the screenshot, output your next step in this format and nothing else:\n\
Thought: <one sentence>\n\
Action: <one of click(start_box='(x,y)'), left_double(start_box='(x,y)'), \
right_single(start_box='(x,y)'), drag(start_box='(x,y)', end_box='(x,y)'), \
hotkey(key='ctrl c'), type(content='text'), scroll(start_box='(x,y)', \
direction='down'), wait(), finished(content='summary')>";

/// Box-token adapter for UI-TARS-family models served over an
/// OpenAI-compatible chat endpoint (`huggingface-local`, `mlx`).
///
/// Parses `Action: click(start_box='(x,y)')` lines, including
/// `<|box_start|>`/`<|loc_…|>` token dialects, and scales coordinates from
/// the 0–1000 token space to the live display.
pub struct UiTarsLoop {
    provider: &'static str,
    model: String,
    full_name: String,
    client: reqwest::Client,
}

impl UiTarsLoop {
    pub fn new(provider: &'static str, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            full_name: format!("{provider}/{model}"),
            provider,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Whether `model_name` should be routed to this adapter rather than the
    /// generic strict-JSON one.
    pub fn matches_model(model_name: &str) -> bool {
        model_name.to_ascii_lowercase().contains("ui-tars")
    }

    async fn chat(
        &self,
        messages: Vec<Value>,
        env: &pilot_config::EnvSnapshot,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(String, Usage), ModelError> {
        let meta = registry::get_driver(self.provider).expect("uitars driver registered");
        let base = base_url(meta, env)?;
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": 512,
            "temperature": 0.0,
        });
        let resp = post_json(
            &self.client,
            &format!("{base}/chat/completions"),
            &[],
            &body,
            cancel,
        )
        .await?;
        let text = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelError::target("chat completion without text content"))?
            .to_string();
        let usage = Usage::new(
            resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            resp["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            0.0,
        );
        Ok((text, usage))
    }
}

// ── Output parsing ────────────────────────────────────────────────────────────

fn coord_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Accepts "(x,y)", "<|loc_x|><|loc_y|>" and "<|box_start|>(x,y)<|box_end|>".
    RE.get_or_init(|| {
        Regex::new(r"(?:\((\d+)\s*,\s*(\d+)\))|(?:<\|loc_(\d+)\|>\s*<\|loc_(\d+)\|>)").unwrap()
    })
}

fn arg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*=\s*'([^']*)'").unwrap())
}

/// Scale a token-space coordinate pair to display pixels.
fn scale(x: u32, y: u32, display: (u32, u32)) -> (i32, i32) {
    (
        ((x as f64 / TOKEN_SPACE) * display.0 as f64).round() as i32,
        ((y as f64 / TOKEN_SPACE) * display.1 as f64).round() as i32,
    )
}

/// Extract all coordinate pairs from a fragment, in order of appearance.
fn parse_coords(fragment: &str, display: (u32, u32)) -> Vec<(i32, i32)> {
    coord_re()
        .captures_iter(fragment)
        .filter_map(|c| {
            let (x, y) = if c.get(1).is_some() {
                (c[1].parse().ok()?, c[2].parse().ok()?)
            } else {
                (c[3].parse().ok()?, c[4].parse().ok()?)
            };
            Some(scale(x, y, display))
        })
        .collect()
}

/// The parsed outcome of one UI-TARS turn.
enum Parsed {
    Act(Action),
    Finished(String),
}

fn parse_output(text: &str, display: (u32, u32)) -> Result<(Option<String>, Parsed), String> {
    let thought = text
        .lines()
        .find_map(|l| l.trim().strip_prefix("Thought:").map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty());

    let action_line = text
        .lines()
        .find_map(|l| l.trim().strip_prefix("Action:").map(str::trim))
        .ok_or_else(|| "no Action: line in model output".to_string())?;

    let verb = action_line
        .split('(')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let coords = parse_coords(action_line, display);
    let args: std::collections::HashMap<String, String> = arg_re()
        .captures_iter(action_line)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();

    let first = coords.first().copied();
    let parsed = match verb.as_str() {
        "click" => {
            let (x, y) = first.ok_or("click without coordinates")?;
            Parsed::Act(Action::click(x, y))
        }
        "left_double" => {
            let (x, y) = first.ok_or("left_double without coordinates")?;
            Parsed::Act(Action::DoubleClick { button: MouseButton::Left, x, y })
        }
        "right_single" => {
            let (x, y) = first.ok_or("right_single without coordinates")?;
            Parsed::Act(Action::Click { button: MouseButton::Right, x, y })
        }
        "drag" => {
            if coords.len() < 2 {
                return Err("drag needs start_box and end_box".into());
            }
            Parsed::Act(Action::Drag {
                button: MouseButton::Left,
                path: coords.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            })
        }
        "hotkey" => {
            let key = args.get("key").cloned().ok_or("hotkey without key")?;
            let keys: Vec<String> = key
                .split([' ', '+'])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if keys.is_empty() {
                return Err("hotkey with empty key".into());
            }
            Parsed::Act(Action::Keypress { keys })
        }
        "type" => {
            let content = args.get("content").cloned().unwrap_or_default();
            Parsed::Act(Action::Type { text: content })
        }
        "scroll" => {
            let (x, y) = first.unwrap_or((display.0 as i32 / 2, display.1 as i32 / 2));
            let (sx, sy) = match args.get("direction").map(String::as_str) {
                Some("up") => (0, -5),
                Some("left") => (-5, 0),
                Some("right") => (5, 0),
                _ => (0, 5),
            };
            Parsed::Act(Action::Scroll { x, y, scroll_x: sx, scroll_y: sy })
        }
        "wait" => Parsed::Act(Action::Wait),
        "screenshot" => Parsed::Act(Action::Screenshot),
        "finished" => {
            Parsed::Finished(args.get("content").cloned().unwrap_or_else(|| {
                thought.clone().unwrap_or_else(|| "Task completed.".into())
            }))
        }
        other => return Err(format!("unknown action verb: {other}")),
    };
    Ok((thought, parsed))
}

fn latest_screenshot(messages: &[Message]) -> Option<String> {
    messages.iter().rev().find_map(|m| match m {
        Message::ComputerCallOutput {
            output: ContentPart::ComputerScreenshot { image_url },
            ..
        } => Some(image_url.clone()),
        Message::User { content: UserContent::Parts(parts) } => {
            parts.iter().rev().find_map(|p| match p {
                ContentPart::InputImage { image_url } => Some(image_url.clone()),
                _ => None,
            })
        }
        _ => None,
    })
}

fn build_chat(messages: &[Message], task_hint: &str) -> Vec<Value> {
    let mut chat = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];

    // Compact text transcript; only the current screen travels as pixels.
    let mut transcript = vec![format!("Task: {task_hint}")];
    for m in messages {
        match m {
            Message::Reasoning { summary } => {
                for p in summary {
                    if let Some(t) = p.as_text() {
                        transcript.push(format!("Thought: {t}"));
                    }
                }
            }
            Message::ComputerCall { action, .. } => {
                transcript.push(format!("Action: {}", json!(action)));
            }
            Message::Assistant { content } => {
                let text: String = content.iter().filter_map(|p| p.as_text()).collect();
                transcript.push(format!("Reply: {text}"));
            }
            _ => {}
        }
    }

    let mut content = vec![json!({ "type": "text", "text": transcript.join("\n") })];
    if let Some(url) = latest_screenshot(messages) {
        content.push(json!({ "type": "image_url", "image_url": { "url": url } }));
    }
    chat.push(json!({ "role": "user", "content": content }));
    chat
}

fn task_text(messages: &[Message]) -> String {
    messages
        .iter()
        .find_map(|m| match m {
            Message::User { content: UserContent::Text(t) } => Some(t.clone()),
            Message::User { content: UserContent::Parts(parts) } => parts
                .iter()
                .find_map(|p| p.as_text().map(str::to_string)),
            _ => None,
        })
        .unwrap_or_default()
}

#[async_trait]
impl AgentLoop for UiTarsLoop {
    fn model_name(&self) -> &str {
        &self.full_name
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        let windowed =
            pilot_schema::retain_recent_screenshots(turn.messages, turn.image_retention_window);
        let chat = build_chat(&windowed, &task_text(turn.messages));
        let (text, usage) = self.chat(chat, turn.env, &turn.cancel).await?;

        let mut out = Vec::new();
        match parse_output(&text, turn.display) {
            Ok((thought, parsed)) => {
                if let Some(t) = thought {
                    out.push(Message::reasoning(t));
                }
                match parsed {
                    Parsed::Act(action) => {
                        out.push(Message::computer_call(Message::new_call_id(), action))
                    }
                    Parsed::Finished(summary) => out.push(Message::assistant(summary)),
                }
            }
            Err(e) => out.push(Message::function_call(
                Message::new_call_id(),
                "noop",
                json!({ "error": e, "raw": text }).to_string(),
            )),
        }

        Ok(TurnResult::new(out, usage))
    }
}

#[async_trait]
impl Grounder for UiTarsLoop {
    async fn ground(
        &self,
        req: GroundRequest<'_>,
    ) -> Result<(Action, Usage), ModelError> {
        let chat = vec![
            json!({ "role": "system", "content": SYSTEM_PROMPT }),
            json!({
                "role": "user",
                "content": [
                    {
                        "type": "text",
                        "text": format!(
                            "Click the element described as: {}. Output only the \
                             Action line.",
                            req.intent
                        ),
                    },
                    { "type": "image_url", "image_url": { "url": req.screenshot_url } },
                ],
            }),
        ];
        let (text, usage) = self.chat(chat, req.env, &req.cancel).await?;
        let coords = parse_coords(&text, req.display);
        let (x, y) = coords
            .first()
            .copied()
            .ok_or_else(|| ModelError::target(format!("no coordinates in grounder output: {text}")))?;
        Ok((Action::click(x, y), usage))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DISPLAY: (u32, u32) = (2000, 1000);

    #[test]
    fn scales_token_space_to_pixels() {
        assert_eq!(scale(500, 500, DISPLAY), (1000, 500));
        assert_eq!(scale(1000, 0, DISPLAY), (2000, 0));
    }

    #[test]
    fn parses_tuple_coordinates() {
        let (thought, parsed) = parse_output(
            "Thought: click the submit button\nAction: click(start_box='(250,600)')",
            DISPLAY,
        )
        .unwrap();
        assert_eq!(thought.as_deref(), Some("click the submit button"));
        match parsed {
            Parsed::Act(Action::Click { x, y, .. }) => {
                assert_eq!((x, y), (500, 600));
            }
            _ => panic!("expected click"),
        }
    }

    #[test]
    fn parses_loc_token_dialect() {
        let coords = parse_coords("<|loc_100|><|loc_200|>", DISPLAY);
        assert_eq!(coords, vec![(200, 200)]);
    }

    #[test]
    fn parses_box_token_dialect() {
        let (_, parsed) = parse_output(
            "Action: click(start_box='<|box_start|>(500,500)<|box_end|>')",
            DISPLAY,
        )
        .unwrap();
        assert!(matches!(parsed, Parsed::Act(Action::Click { x: 1000, y: 500, .. })));
    }

    #[test]
    fn parses_drag_with_two_boxes() {
        let (_, parsed) = parse_output(
            "Action: drag(start_box='(0,0)', end_box='(1000,1000)')",
            DISPLAY,
        )
        .unwrap();
        match parsed {
            Parsed::Act(Action::Drag { path, .. }) => {
                assert_eq!(path, vec![Point::new(0, 0), Point::new(2000, 1000)]);
            }
            _ => panic!("expected drag"),
        }
    }

    #[test]
    fn parses_hotkey_with_spaces() {
        let (_, parsed) = parse_output("Action: hotkey(key='ctrl shift t')", DISPLAY).unwrap();
        match parsed {
            Parsed::Act(Action::Keypress { keys }) => {
                assert_eq!(keys, vec!["ctrl", "shift", "t"]);
            }
            _ => panic!("expected keypress"),
        }
    }

    #[test]
    fn parses_type_content() {
        let (_, parsed) = parse_output("Action: type(content='hello world')", DISPLAY).unwrap();
        assert!(matches!(parsed, Parsed::Act(Action::Type { text }) if text == "hello world"));
    }

    #[test]
    fn parses_finished_with_summary() {
        let (_, parsed) =
            parse_output("Thought: done\nAction: finished(content='opened the file')", DISPLAY)
                .unwrap();
        assert!(matches!(parsed, Parsed::Finished(s) if s == "opened the file"));
    }

    #[test]
    fn scroll_defaults_to_screen_centre() {
        let (_, parsed) = parse_output("Action: scroll(direction='up')", DISPLAY).unwrap();
        match parsed {
            Parsed::Act(Action::Scroll { x, y, scroll_y, .. }) => {
                assert_eq!((x, y), (1000, 500));
                assert!(scroll_y < 0);
            }
            _ => panic!("expected scroll"),
        }
    }

    #[test]
    fn missing_action_line_is_an_error() {
        assert!(parse_output("Thought: hmm", DISPLAY).is_err());
    }

    #[test]
    fn unknown_verb_is_an_error() {
        assert!(parse_output("Action: defenestrate(start_box='(1,1)')", DISPLAY).is_err());
    }

    #[test]
    fn model_routing_matches_ui_tars_names() {
        assert!(UiTarsLoop::matches_model("ByteDance/UI-TARS-7B-DPO"));
        assert!(UiTarsLoop::matches_model("mlx-community/ui-tars-1.5"));
        assert!(!UiTarsLoop::matches_model("llava:13b"));
    }
}
