// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use pilot_schema::{retain_recent_screenshots, ContentPart, Message, OsType, Usage, UserContent};

use crate::{
    http::{base_url, post_json},
    registry, AgentLoop, ModelError, TurnRequest, TurnResult,
};

/// OpenAI computer-use adapter (Responses API, `computer_use_preview` tool).
///
/// Within a run, the adapter threads `previous_response_id` across turns so
/// only the new items (typically the latest screenshot output) are sent.
/// Pending safety checks returned by the provider are echoed back unchanged
/// on the next turn – policy about them belongs to callbacks.
pub struct OpenAiCuaLoop {
    model: String,
    full_name: String,
    client: reqwest::Client,
    /// Response id of the last turn, if the provider returned one.
    previous_response_id: Mutex<Option<String>>,
    /// Number of canonical messages already covered by
    /// `previous_response_id`; only newer items are encoded when it is set.
    covered: Mutex<usize>,
}

impl OpenAiCuaLoop {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            full_name: format!("openai/{model}"),
            model,
            client: reqwest::Client::new(),
            previous_response_id: Mutex::new(None),
            covered: Mutex::new(0),
        }
    }
}

fn environment(os: OsType) -> &'static str {
    match os {
        OsType::Linux => "linux",
        OsType::Macos => "mac",
        OsType::Windows => "windows",
    }
}

/// Encode one canonical message as a Responses-API input item.
///
/// `history` is consulted to attach `acknowledged_safety_checks` to a
/// `computer_call_output`: whatever the provider flagged on the matching
/// call is echoed verbatim.
fn encode_item(msg: &Message, history: &[Message]) -> Option<Value> {
    match msg {
        Message::User { content } => {
            let parts: Vec<Value> = match content {
                UserContent::Text(t) => vec![json!({ "type": "input_text", "text": t })],
                UserContent::Parts(parts) => parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::InputText { text } => {
                            Some(json!({ "type": "input_text", "text": text }))
                        }
                        ContentPart::InputImage { image_url } => {
                            Some(json!({ "type": "input_image", "image_url": image_url }))
                        }
                        _ => None,
                    })
                    .collect(),
            };
            Some(json!({ "role": "user", "content": parts }))
        }
        Message::Assistant { content } => {
            let text: String = content.iter().filter_map(|p| p.as_text()).collect();
            Some(json!({
                "role": "assistant",
                "content": [{ "type": "output_text", "text": text }],
            }))
        }
        // Reasoning items cannot be replayed without their provider-side
        // encrypted payload; the server restores them via
        // previous_response_id.
        Message::Reasoning { .. } => None,
        Message::ComputerCall { call_id, action, pending_safety_checks, .. } => {
            let mut item = json!({
                "type": "computer_call",
                "call_id": call_id,
                "status": "completed",
                "action": action,
            });
            if !pending_safety_checks.is_empty() {
                item["pending_safety_checks"] = json!(pending_safety_checks);
            }
            Some(item)
        }
        Message::ComputerCallOutput { call_id, output } => {
            let output_value = match output {
                ContentPart::ComputerScreenshot { image_url }
                | ContentPart::InputImage { image_url } => {
                    json!({ "type": "computer_screenshot", "image_url": image_url })
                }
                other => json!({
                    "type": "input_text",
                    "text": other.as_text().unwrap_or_default(),
                }),
            };
            let mut item = json!({
                "type": "computer_call_output",
                "call_id": call_id,
                "output": output_value,
            });
            let acked = pending_checks_for(history, call_id);
            if !acked.is_empty() {
                item["acknowledged_safety_checks"] = json!(acked);
            }
            Some(item)
        }
        Message::FunctionCall { call_id, name, arguments, .. } => Some(json!({
            "type": "function_call",
            "call_id": call_id,
            "name": name,
            "arguments": arguments,
        })),
        Message::FunctionCallOutput { call_id, output } => Some(json!({
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        })),
    }
}

fn pending_checks_for(history: &[Message], call_id: &str) -> Vec<Value> {
    history
        .iter()
        .find_map(|m| match m {
            Message::ComputerCall { call_id: id, pending_safety_checks, .. }
                if id == call_id && !pending_safety_checks.is_empty() =>
            {
                Some(pending_safety_checks.clone())
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Decode one Responses-API output item into a canonical message.
fn decode_item(item: &Value) -> Option<Message> {
    match item["type"].as_str()? {
        "computer_call" => {
            let action = serde_json::from_value(item["action"].clone()).ok()?;
            Some(Message::ComputerCall {
                call_id: item["call_id"].as_str()?.to_string(),
                status: item["status"].as_str().map(str::to_string),
                action,
                pending_safety_checks: item["pending_safety_checks"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default(),
            })
        }
        "reasoning" => {
            let summary: Vec<ContentPart> = item["summary"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p["text"].as_str())
                        .map(|t| ContentPart::SummaryText { text: t.to_string() })
                        .collect()
                })
                .unwrap_or_default();
            if summary.is_empty() {
                None
            } else {
                Some(Message::Reasoning { summary })
            }
        }
        "message" => {
            let text: String = item["content"]
                .as_array()?
                .iter()
                .filter(|p| p["type"] == "output_text")
                .filter_map(|p| p["text"].as_str())
                .collect();
            Some(Message::assistant(text))
        }
        "function_call" => Some(Message::FunctionCall {
            call_id: item["call_id"].as_str()?.to_string(),
            status: item["status"].as_str().map(str::to_string),
            name: item["name"].as_str()?.to_string(),
            arguments: item["arguments"].as_str().unwrap_or("{}").to_string(),
        }),
        // Item types the core does not model (e.g. web_search_call) are
        // skipped, not errors.
        _ => None,
    }
}

#[async_trait]
impl AgentLoop for OpenAiCuaLoop {
    fn model_name(&self) -> &str {
        &self.full_name
    }

    async fn step(&self, turn: TurnRequest<'_>) -> Result<TurnResult, ModelError> {
        let meta = registry::get_driver("openai").expect("openai driver registered");
        let key = turn
            .env
            .get(meta.default_api_key_env.unwrap_or_default())
            .ok_or_else(|| ModelError::Configuration("OPENAI_API_KEY not set".into()))?;
        let base = base_url(meta, turn.env)?;

        let windowed = retain_recent_screenshots(turn.messages, turn.image_retention_window);
        let previous_id = self.previous_response_id.lock().unwrap().clone();
        let skip = if previous_id.is_some() { *self.covered.lock().unwrap() } else { 0 };
        let skip = skip.min(windowed.len());

        let input: Vec<Value> = windowed[skip..]
            .iter()
            .filter_map(|m| encode_item(m, turn.messages))
            .collect();

        let (width, height) = turn.display;
        let mut body = json!({
            "model": self.model,
            "input": input,
            "tools": [{
                "type": "computer_use_preview",
                "display_width": width,
                "display_height": height,
                "environment": environment(turn.os_type),
            }],
            "truncation": "auto",
        });
        if let Some(id) = &previous_id {
            body["previous_response_id"] = json!(id);
        }

        let headers = vec![("Authorization".to_string(), format!("Bearer {key}"))];
        let resp = post_json(&self.client, &format!("{base}/responses"), &headers, &body, &turn.cancel)
            .await?;

        let messages: Vec<Message> = resp["output"]
            .as_array()
            .map(|items| items.iter().filter_map(decode_item).collect())
            .unwrap_or_default();
        if messages.is_empty() {
            return Err(ModelError::target("empty response from openai"));
        }

        if let Some(id) = resp["id"].as_str() {
            *self.previous_response_id.lock().unwrap() = Some(id.to_string());
            // Everything up to and including this turn's output is now
            // provider-side state; the next request sends only newer items.
            *self.covered.lock().unwrap() = turn.messages.len() + messages.len();
            debug!(response_id = id, "openai turn complete");
        }

        let usage = Usage::new(
            resp["usage"]["input_tokens"].as_u64().unwrap_or(0),
            resp["usage"]["output_tokens"].as_u64().unwrap_or(0),
            0.0,
        );

        Ok(TurnResult::new(messages, usage))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
