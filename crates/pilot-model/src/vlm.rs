// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use pilot_schema::{Action, ContentPart, Message, UserContent};

use crate::{
    http::{base_url, post_json},
    registry, AgentLoop, ModelError, TurnRequest, TurnResult,
};

/// Generic vision-language adapter for chat-completions endpoints.
///
/// Works with any OpenAI-compatible server (Ollama, vLLM, llama.cpp…):
/// the last screenshot is sent as an image content part together with a
/// system prompt demanding a strict JSON object
/// `{ "action": …, "reasoning": …, "done": … }`.  Output parsing accepts
/// code-fenced JSON and trailing prose; on parse failure the adapter
/// returns a `function_call{name:"noop"}` carrying the parse error so the
/// orchestrator decides what to do next.
pub struct VlmChatLoop {
    provider: &'static str,
    model: String,
    full_name: String,
    client: reqwest::Client,
}

impl VlmChatLoop {
    pub fn new(provider: &'static str, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            full_name: format!("{provider}/{model}"),
            provider,
            model,
            client: reqwest::Client::new(),
        }
    }
}

fn system_prompt(display: (u32, u32)) -> String {
    format!(
        "You control a computer with a {}x{} pixel screen. On every turn you \
         see the current screenshot. Reply with EXACTLY ONE JSON object and \
         nothing else:\n\
         {{\"action\": {{\"type\": \"click\", \"x\": 100, \"y\": 200}}, \
         \"reasoning\": \"why\", \"done\": false}}\n\
         Action types: click, double_click, drag, move, scroll, keypress, \
         type, screenshot, wait. Coordinates are integer pixels. When the \
         task is finished set \"done\": true and omit \"action\".",
        display.0, display.1
    )
}

/// Flatten canonical history into chat messages, attaching only the most
/// recent screenshot as an image part (older screens become text stubs –
/// small models degrade badly with many images in context).
fn build_chat_messages(messages: &[Message], display: (u32, u32)) -> Vec<Value> {
    let last_screenshot = messages.iter().rev().find_map(|m| match m {
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
    });

    let mut chat = vec![json!({ "role": "system", "content": system_prompt(display) })];
    for msg in messages {
        match msg {
            Message::User { content } => {
                let text = match content {
                    UserContent::Text(t) => t.clone(),
                    UserContent::Parts(parts) => parts
                        .iter()
                        .filter_map(|p| p.as_text())
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                chat.push(json!({ "role": "user", "content": text }));
            }
            Message::Assistant { content } => {
                let text: String = content.iter().filter_map(|p| p.as_text()).collect();
                chat.push(json!({ "role": "assistant", "content": text }));
            }
            Message::Reasoning { .. } => {}
            Message::ComputerCall { action, .. } => {
                chat.push(json!({
                    "role": "assistant",
                    "content": json!({ "action": action }).to_string(),
                }));
            }
            Message::ComputerCallOutput { output, .. } => match output {
                ContentPart::ComputerScreenshot { image_url }
                    if Some(image_url) == last_screenshot.as_ref() =>
                {
                    chat.push(json!({
                        "role": "user",
                        "content": [
                            { "type": "text", "text": "Current screen:" },
                            { "type": "image_url", "image_url": { "url": image_url } },
                        ],
                    }));
                }
                _ => {
                    chat.push(json!({ "role": "user", "content": "[screen updated]" }));
                }
            },
            Message::FunctionCall { name, arguments, .. } => {
                chat.push(json!({
                    "role": "assistant",
                    "content": format!("[{name}: {arguments}]"),
                }));
            }
            Message::FunctionCallOutput { output, .. } => {
                chat.push(json!({ "role": "user", "content": output.clone() }));
            }
        }
    }
    chat
}

#[derive(Debug, Deserialize)]
struct VlmDecision {
    #[serde(default)]
    action: Option<Value>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    done: Option<bool>,
}

/// Extract the first JSON object from model text.
///
/// Handles ```json fences, leading chatter, and trailing prose by scanning
/// for the first brace-balanced object outside string literals.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let text = match text.find("```") {
        Some(fence_start) => {
            let after = &text[fence_start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => text,
    };

    let start = text.find('{')?;
    let bytes = text[start..].char_indices();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in bytes {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse model text into canonical messages.  Shared with the box-token
/// adapter's JSON fallback.
pub(crate) fn decode_decision(text: &str) -> Vec<Message> {
    let parsed: Result<VlmDecision, String> = extract_json_object(text)
        .ok_or_else(|| "no JSON object in model output".to_string())
        .and_then(|raw| serde_json::from_str(raw).map_err(|e| e.to_string()));

    let decision = match parsed {
        Ok(d) => d,
        Err(e) => {
            return vec![Message::function_call(
                Message::new_call_id(),
                "noop",
                json!({ "error": e, "raw": text }).to_string(),
            )];
        }
    };

    let mut out = Vec::new();
    if let Some(r) = &decision.reasoning {
        if !r.is_empty() {
            out.push(Message::reasoning(r.clone()));
        }
    }

    let action: Option<Action> = decision
        .action
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    match action {
        Some(action) if decision.done != Some(true) => {
            out.push(Message::computer_call(Message::new_call_id(), action));
        }
        _ => {
            let text = decision
                .reasoning
                .unwrap_or_else(|| "Task completed.".to_string());
            out.push(Message::assistant(text));
        }
    }
    out
}

#[async_trait]
impl AgentLoop for VlmChatLoop {
    fn model_name(&self) -> &str {
        &self.full_name
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        let meta = registry::get_driver(self.provider).expect("vlm driver registered");
        let base = base_url(meta, turn.env)?;

        let windowed =
            pilot_schema::retain_recent_screenshots(turn.messages, turn.image_retention_window);
        let body = json!({
            "model": self.model,
            "messages": build_chat_messages(&windowed, turn.display),
            "max_tokens": 1024,
            "temperature": 0.0,
        });

        let mut headers = Vec::new();
        if let Some(var) = meta.default_api_key_env {
            if let Some(key) = turn.env.get(var) {
                headers.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
        }

        let resp = post_json(
            &self.client,
            &format!("{base}/chat/completions"),
            &headers,
            &body,
            &turn.cancel,
        )
        .await?;

        let text = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelError::target("chat completion without text content"))?;

        let usage = pilot_schema::Usage::new(
            resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            resp["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            0.0,
        );

        Ok(TurnResult::new(decode_decision(text), usage))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── JSON extraction ───────────────────────────────────────────────────────

    #[test]
    fn extracts_bare_object() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));
    }

    #[test]
    fn extracts_from_code_fence() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nHope that helps!";
        assert_eq!(extract_json_object(text).map(str::trim), Some("{\"a\": 1}"));
    }

    #[test]
    fn ignores_trailing_prose() {
        let text = r#"{"action":{"type":"wait"}} and then we shall see"#;
        assert_eq!(extract_json_object(text), Some(r#"{"action":{"type":"wait"}}"#));
    }

    #[test]
    fn handles_braces_inside_strings() {
        let text = r#"{"reasoning":"press the { key","done":true}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn no_object_yields_none() {
        assert_eq!(extract_json_object("just words"), None);
    }

    // ── Decision decoding ─────────────────────────────────────────────────────

    #[test]
    fn action_decodes_to_computer_call() {
        let msgs = decode_decision(
            r#"{"action":{"type":"click","x":10,"y":20},"reasoning":"click it"}"#,
        );
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Message::Reasoning { .. }));
        match &msgs[1] {
            Message::ComputerCall { action, .. } => assert_eq!(*action, Action::click(10, 20)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn done_true_yields_terminal_assistant() {
        let msgs = decode_decision(r#"{"done":true,"reasoning":"all finished"}"#);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].assistant_text().as_deref(), Some("all finished"));
    }

    #[test]
    fn parse_failure_yields_noop_function_call() {
        let msgs = decode_decision("I would rather chat about the weather.");
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Message::FunctionCall { name, arguments, .. } => {
                assert_eq!(name, "noop");
                assert!(arguments.contains("no JSON object"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unparseable_action_falls_back_to_assistant() {
        let msgs = decode_decision(r#"{"action":{"type":"levitate"},"reasoning":"hm"}"#);
        assert!(matches!(msgs.last(), Some(Message::Assistant { .. })));
    }

    // ── Chat building ─────────────────────────────────────────────────────────

    #[test]
    fn only_latest_screenshot_is_sent_as_image() {
        let msgs = vec![
            Message::user("task"),
            Message::computer_call("c1", Action::click(1, 1)),
            Message::computer_call_output("c1", "data:image/png;base64,OLD"),
            Message::computer_call("c2", Action::click(2, 2)),
            Message::computer_call_output("c2", "data:image/png;base64,NEW"),
        ];
        let chat = build_chat_messages(&msgs, (800, 600));
        let images: Vec<&Value> = chat
            .iter()
            .filter(|m| m["content"].is_array())
            .collect();
        assert_eq!(images.len(), 1);
        assert_eq!(
            images[0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,NEW"
        );
    }

    #[test]
    fn system_prompt_names_display_size() {
        let chat = build_chat_messages(&[Message::user("x")], (1920, 1080));
        assert!(chat[0]["content"].as_str().unwrap().contains("1920x1080"));
    }
}
