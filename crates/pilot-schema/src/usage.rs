// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Token and cost accounting for one model round-trip, accumulated per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Cost in USD as reported (or estimated) by the adapter.
    #[serde(default)]
    pub response_cost: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, response_cost: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            response_cost,
        }
    }

    /// Accumulate another turn's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.response_cost += other.response_cost;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
