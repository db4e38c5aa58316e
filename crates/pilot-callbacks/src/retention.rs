// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use pilot_schema::{retain_recent_screenshots, Message};

use crate::{Callback, HookError, RunContext};

/// Keeps at most `window` recent screenshots expanded in the history
/// handed to the adapter; older payloads become compact placeholders.
///
/// Adapters apply the same re-windowing themselves from the turn request,
/// so this callback exists for callers that want retention enforced
/// pipeline-side (e.g. before a trajectory-replaying adapter).
pub struct ImageRetention {
    window: usize,
}

impl ImageRetention {
    pub fn new(window: usize) -> Self {
        Self { window }
    }
}

impl Callback for ImageRetention {
    fn name(&self) -> &str {
        "image_retention"
    }

    fn before_turn(
        &self,
        _ctx: &RunContext,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, HookError> {
        Ok(retain_recent_screenshots(&messages, Some(self.window)))
    }
}
