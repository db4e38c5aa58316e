// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Action, ValidationError};

/// Placeholder text substituted for screenshots dropped by retention
/// re-windowing.  Adapters treat any `input_text` output on a
/// `computer_call_output` as "screenshot no longer available".
pub const SCREENSHOT_ELIDED: &str = "[screenshot elided]";

// ─── Content parts ────────────────────────────────────────────────────────────

/// A single typed content part inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    InputImage {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        image_url: String,
    },
    OutputText { text: String },
    SummaryText { text: String },
    ComputerScreenshot {
        /// Always a data URL carrying base64 PNG bytes.
        image_url: String,
    },
}

impl ContentPart {
    pub fn input_text(text: impl Into<String>) -> Self {
        Self::InputText { text: text.into() }
    }

    pub fn output_text(text: impl Into<String>) -> Self {
        Self::OutputText { text: text.into() }
    }

    pub fn screenshot(image_url: impl Into<String>) -> Self {
        Self::ComputerScreenshot { image_url: image_url.into() }
    }

    /// The textual payload, if this part carries one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::InputText { text }
            | ContentPart::OutputText { text }
            | ContentPart::SummaryText { text } => Some(text),
            _ => None,
        }
    }

    /// The image URL, if this part carries one.
    pub fn image_url(&self) -> Option<&str> {
        match self {
            ContentPart::InputImage { image_url }
            | ContentPart::ComputerScreenshot { image_url } => Some(image_url),
            _ => None,
        }
    }
}

/// User content is either a bare string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl UserContent {
    /// Normalise to a parts list (a bare string becomes one `input_text`).
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            UserContent::Text(t) => vec![ContentPart::input_text(t)],
            UserContent::Parts(p) => p,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A canonical message on the wire.
///
/// This is the single schema all adapters convert to and from; no
/// provider-specific shape escapes the core.  Field names are stable wire
/// contract – do not rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<ContentPart>,
    },
    Reasoning {
        summary: Vec<ContentPart>,
    },
    ComputerCall {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        action: Action,
        /// Provider safety checks echoed back verbatim on the next turn.
        /// Policy decisions about them belong to callbacks, not adapters.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pending_safety_checks: Vec<serde_json::Value>,
    },
    ComputerCallOutput {
        call_id: String,
        output: ContentPart,
    },
    FunctionCall {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        name: String,
        /// JSON-encoded argument object.
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message::User { content: UserContent::Text(text.into()) }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Message::User { content: UserContent::Parts(parts) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant { content: vec![ContentPart::output_text(text)] }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Message::Reasoning {
            summary: vec![ContentPart::SummaryText { text: text.into() }],
        }
    }

    pub fn computer_call(call_id: impl Into<String>, action: Action) -> Self {
        Message::ComputerCall {
            call_id: call_id.into(),
            status: Some("completed".into()),
            action,
            pending_safety_checks: Vec::new(),
        }
    }

    /// Screenshot output bound to a prior `computer_call`.
    pub fn computer_call_output(call_id: impl Into<String>, image_url: impl Into<String>) -> Self {
        Message::ComputerCallOutput {
            call_id: call_id.into(),
            output: ContentPart::screenshot(image_url),
        }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Message::FunctionCall {
            call_id: call_id.into(),
            status: Some("completed".into()),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Message::FunctionCallOutput { call_id: call_id.into(), output: output.into() }
    }

    /// Mint a fresh `call_` id for adapter-originated calls.
    pub fn new_call_id() -> String {
        format!("call_{}", Uuid::new_v4().simple())
    }

    /// The call id, for the variants that carry one.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::ComputerCall { call_id, .. }
            | Message::ComputerCallOutput { call_id, .. }
            | Message::FunctionCall { call_id, .. }
            | Message::FunctionCallOutput { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Concatenated text of an assistant message, if this is one.
    pub fn assistant_text(&self) -> Option<String> {
        match self {
            Message::Assistant { content } => Some(
                content
                    .iter()
                    .filter_map(|p| p.as_text())
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            _ => None,
        }
    }

    /// Wire tag of this variant (`"user"`, `"computer_call"`, …).
    pub fn kind(&self) -> &'static str {
        match self {
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Reasoning { .. } => "reasoning",
            Message::ComputerCall { .. } => "computer_call",
            Message::ComputerCallOutput { .. } => "computer_call_output",
            Message::FunctionCall { .. } => "function_call",
            Message::FunctionCallOutput { .. } => "function_call_output",
        }
    }

    /// Encode to the stable canonical JSON shape.
    pub fn encode(&self) -> serde_json::Value {
        // Serialisation of these variants cannot fail; the enum contains no
        // map keys or non-string-keyed structures.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode a canonical message, rejecting unknown variants.
    ///
    /// Use at the trust boundary (HTTP / data channel).  Unknown *fields*
    /// inside a known variant are ignored.
    pub fn decode(value: &serde_json::Value) -> Result<Message, ValidationError> {
        let msg: Message = serde_json::from_value(value.clone())
            .map_err(|e| match value.get("type").and_then(|t| t.as_str()) {
                Some(t) if !KNOWN_TYPES.contains(&t) => {
                    ValidationError::UnknownVariant(t.to_string())
                }
                _ => ValidationError::Malformed(e.to_string()),
            })?;
        msg.validate()?;
        Ok(msg)
    }

    /// Decode leniently: unknown variants and malformed messages become
    /// `None` instead of an error.  For use inside trusted adapters where
    /// provider output may contain item types the core does not model.
    pub fn decode_lenient(value: &serde_json::Value) -> Option<Message> {
        Message::decode(value).ok()
    }

    /// Structural validation: required fields per variant.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Message::ComputerCall { call_id, action, .. } => {
                if call_id.is_empty() {
                    return Err(ValidationError::EmptyCallId("computer_call"));
                }
                action.validate()
            }
            Message::ComputerCallOutput { call_id, .. } => {
                if call_id.is_empty() {
                    return Err(ValidationError::EmptyCallId("computer_call_output"));
                }
                Ok(())
            }
            Message::FunctionCall { call_id, .. } => {
                if call_id.is_empty() {
                    return Err(ValidationError::EmptyCallId("function_call"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "user",
    "assistant",
    "reasoning",
    "computer_call",
    "computer_call_output",
    "function_call",
    "function_call_output",
];

// ─── Helpers shared by adapters and callbacks ─────────────────────────────────

/// Parse a data URL of the form `data:<mime>;base64,<b64>` and return
/// `Ok((mime_type, base64_string))`.  Returns `Err` for non-data-URLs so
/// callers can fall back to treating the string as a plain HTTPS URL.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

/// Re-window a conversation so that at most `window` of the most recent
/// `computer_call_output` screenshots remain expanded; older payloads are
/// replaced with a compact [`SCREENSHOT_ELIDED`] placeholder.
///
/// Pure rewriting: returns a new list, the input is untouched.
/// `window = None` keeps everything.
pub fn retain_recent_screenshots(messages: &[Message], window: Option<usize>) -> Vec<Message> {
    let Some(n) = window else {
        return messages.to_vec();
    };

    let screenshot_count = messages
        .iter()
        .filter(|m| is_expanded_screenshot(m))
        .count();
    let mut to_elide = screenshot_count.saturating_sub(n);

    messages
        .iter()
        .map(|m| {
            if to_elide > 0 && is_expanded_screenshot(m) {
                to_elide -= 1;
                if let Message::ComputerCallOutput { call_id, .. } = m {
                    return Message::ComputerCallOutput {
                        call_id: call_id.clone(),
                        output: ContentPart::input_text(SCREENSHOT_ELIDED),
                    };
                }
            }
            m.clone()
        })
        .collect()
}

fn is_expanded_screenshot(m: &Message) -> bool {
    matches!(
        m,
        Message::ComputerCallOutput { output: ContentPart::ComputerScreenshot { .. }, .. }
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Action;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::user("click the button"),
            Message::user_with_parts(vec![
                ContentPart::input_text("what is on screen?"),
                ContentPart::InputImage { image_url: "data:image/png;base64,AA==".into() },
            ]),
            Message::assistant("done"),
            Message::reasoning("I should click submit"),
            Message::computer_call("call_1", Action::click(10, 20)),
            Message::computer_call_output("call_1", "data:image/png;base64,BB=="),
            Message::function_call("call_2", "ground", "the Submit button"),
            Message::function_call_output("call_2", "{\"x\":1}"),
        ]
    }

    // ── Round-trip ────────────────────────────────────────────────────────────

    #[test]
    fn every_variant_round_trips() {
        for m in sample_messages() {
            let encoded = m.encode();
            let back = Message::decode(&encoded).unwrap();
            assert_eq!(back, m, "round-trip failed for {}", m.kind());
        }
    }

    #[test]
    fn user_plain_string_content_round_trips() {
        let json = serde_json::json!({ "type": "user", "content": "hello" });
        let m = Message::decode(&json).unwrap();
        assert_eq!(m, Message::user("hello"));
        assert_eq!(m.encode()["content"], "hello");
    }

    // ── Decode strictness ─────────────────────────────────────────────────────

    #[test]
    fn decode_rejects_unknown_variant() {
        let json = serde_json::json!({ "type": "telemetry", "payload": 1 });
        match Message::decode(&json) {
            Err(ValidationError::UnknownVariant(t)) => assert_eq!(t, "telemetry"),
            other => panic!("expected UnknownVariant, got {other:?}"),
        }
    }

    #[test]
    fn decode_lenient_skips_unknown_variant() {
        let json = serde_json::json!({ "type": "telemetry", "payload": 1 });
        assert!(Message::decode_lenient(&json).is_none());
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let json = serde_json::json!({
            "type": "assistant",
            "content": [{ "type": "output_text", "text": "hi" }],
            "finish_reason": "stop",
        });
        let m = Message::decode(&json).unwrap();
        assert_eq!(m.assistant_text().as_deref(), Some("hi"));
    }

    #[test]
    fn decode_validates_empty_call_id() {
        let json = serde_json::json!({
            "type": "computer_call",
            "call_id": "",
            "action": { "type": "wait" },
        });
        assert_eq!(
            Message::decode(&json),
            Err(ValidationError::EmptyCallId("computer_call"))
        );
    }

    #[test]
    fn decode_validates_nested_action() {
        let json = serde_json::json!({
            "type": "computer_call",
            "call_id": "call_1",
            "action": { "type": "keypress", "keys": [] },
        });
        assert_eq!(Message::decode(&json), Err(ValidationError::EmptyKeypress()));
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    #[test]
    fn call_id_present_only_on_call_variants() {
        assert_eq!(Message::user("x").call_id(), None);
        assert_eq!(
            Message::computer_call("c1", Action::Wait).call_id(),
            Some("c1")
        );
    }

    #[test]
    fn assistant_text_joins_parts() {
        let m = Message::Assistant {
            content: vec![
                ContentPart::output_text("a"),
                ContentPart::output_text("b"),
            ],
        };
        assert_eq!(m.assistant_text().as_deref(), Some("ab"));
    }

    // ── Data URLs ─────────────────────────────────────────────────────────────

    #[test]
    fn parse_data_url_splits_mime_and_payload() {
        let (mime, b64) = parse_data_url_parts("data:image/png;base64,QUJD").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(b64, "QUJD");
    }

    #[test]
    fn parse_data_url_rejects_https() {
        assert!(parse_data_url_parts("https://example.com/x.png").is_err());
    }

    // ── Retention re-windowing ────────────────────────────────────────────────

    fn history_with_screenshots(n: usize) -> Vec<Message> {
        let mut msgs = vec![Message::user("task")];
        for i in 0..n {
            msgs.push(Message::computer_call(format!("call_{i}"), Action::click(1, 1)));
            msgs.push(Message::computer_call_output(
                format!("call_{i}"),
                "data:image/png;base64,AA==",
            ));
        }
        msgs
    }

    fn expanded_count(msgs: &[Message]) -> usize {
        msgs.iter().filter(|m| is_expanded_screenshot(m)).count()
    }

    #[test]
    fn retention_keeps_most_recent_screenshots() {
        let history = history_with_screenshots(5);
        let windowed = retain_recent_screenshots(&history, Some(2));
        assert_eq!(expanded_count(&windowed), 2);
        // The two survivors must be the two most recent.
        match &windowed[windowed.len() - 1] {
            Message::ComputerCallOutput { output, .. } => {
                assert!(matches!(output, ContentPart::ComputerScreenshot { .. }))
            }
            other => panic!("unexpected tail message: {other:?}"),
        }
        // The first screenshot is elided.
        match &windowed[2] {
            Message::ComputerCallOutput { output, .. } => {
                assert_eq!(output.as_text(), Some(SCREENSHOT_ELIDED))
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn retention_none_keeps_everything() {
        let history = history_with_screenshots(4);
        let windowed = retain_recent_screenshots(&history, None);
        assert_eq!(expanded_count(&windowed), 4);
    }

    #[test]
    fn retention_preserves_call_output_pairing() {
        let history = history_with_screenshots(3);
        let windowed = retain_recent_screenshots(&history, Some(1));
        assert_eq!(windowed.len(), history.len());
        for (orig, new) in history.iter().zip(windowed.iter()) {
            assert_eq!(orig.call_id(), new.call_id());
        }
    }

    #[test]
    fn retention_is_pure() {
        let history = history_with_screenshots(3);
        let _ = retain_recent_screenshots(&history, Some(0));
        assert_eq!(expanded_count(&history), 3, "input must not be mutated");
    }
}
