// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use pilot_schema::{ContentPart, Message, UserContent};

use crate::{Callback, HookError, RunContext};

const REDACTED: &str = "[REDACTED]";

/// Regex-based redaction over outgoing user content.
///
/// Covers email addresses, US-style SSNs, 13–16 digit card numbers, and
/// bearer/API tokens.  The same `redact` function is reused by
/// [`crate::TrajectoryWriter`] for logged lines.
pub struct PiiScrubber {
    patterns: Vec<Regex>,
}

impl Default for PiiScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiScrubber {
    pub fn new() -> Self {
        let patterns = [
            // Email addresses.
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            // US social security numbers.
            r"\b\d{3}-\d{2}-\d{4}\b",
            // Payment card numbers (13-16 digits, optional separators).
            r"\b(?:\d[ -]?){13,16}\b",
            // Bearer / API tokens.
            r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}",
            r"\bsk-[A-Za-z0-9]{16,}\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static PII pattern compiles"))
        .collect();
        Self { patterns }
    }

    /// Replace every PII match in `text` with `[REDACTED]`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re.replace_all(&out, REDACTED).into_owned();
        }
        out
    }

    fn scrub_part(&self, part: ContentPart) -> ContentPart {
        match part {
            ContentPart::InputText { text } => {
                ContentPart::InputText { text: self.redact(&text) }
            }
            other => other,
        }
    }
}

impl Callback for PiiScrubber {
    fn name(&self) -> &str {
        "pii_scrubber"
    }

    fn before_turn(
        &self,
        _ctx: &RunContext,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, HookError> {
        Ok(messages
            .into_iter()
            .map(|m| match m {
                Message::User { content } => Message::User {
                    content: match content {
                        UserContent::Text(t) => UserContent::Text(self.redact(&t)),
                        UserContent::Parts(parts) => UserContent::Parts(
                            parts.into_iter().map(|p| self.scrub_part(p)).collect(),
                        ),
                    },
                },
                other => other,
            })
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
