// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::{Callback, HookError, RunContext, TurnInput};

/// Annotates the last `k` messages as cache-eligible.
///
/// Providers with explicit prompt caching (Anthropic) turn the hint into
/// `cache_control` markers; providers that cache automatically ignore it.
pub struct PromptCacheHinter {
    k: usize,
}

impl PromptCacheHinter {
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

impl Callback for PromptCacheHinter {
    fn name(&self) -> &str {
        "prompt_cache_hinter"
    }

    fn before_llm(&self, _ctx: &RunContext, mut input: TurnInput) -> Result<TurnInput, HookError> {
        // An earlier callback's stronger hint is respected.
        if input.cache_hint.is_none() {
            input.cache_hint = Some(self.k);
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_hint_when_absent() {
        let cb = PromptCacheHinter::new(4);
        let ctx = RunContext::new("r", "s", "m");
        let out = cb
            .before_llm(&ctx, TurnInput { messages: vec![], cache_hint: None })
            .unwrap();
        assert_eq!(out.cache_hint, Some(4));
    }

    #[test]
    fn existing_hint_is_kept() {
        let cb = PromptCacheHinter::new(4);
        let ctx = RunContext::new("r", "s", "m");
        let out = cb
            .before_llm(&ctx, TurnInput { messages: vec![], cache_hint: Some(9) })
            .unwrap();
        assert_eq!(out.cache_hint, Some(9));
    }
}
