// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::{registry, ModelError};

/// A single `provider/name` reference inside a model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    /// The remainder after the provider prefix; may itself contain `/`
    /// segments (`huggingface-local/ByteDance/UI-TARS-7B`).  Empty for
    /// providers addressed by the bare id (`human`).
    pub name: String,
}

impl ModelRef {
    fn parse(s: &str) -> Result<Self, ModelError> {
        let (provider, name) = match s.split_once('/') {
            Some((p, n)) => (p, n),
            None => (s, ""),
        };
        if registry::get_driver(provider).is_none() {
            return Err(ModelError::UnknownModel(s.to_string()));
        }
        Ok(Self { provider: provider.to_string(), name: name.to_string() })
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.provider)
        } else {
            write!(f, "{}/{}", self.provider, self.name)
        }
    }
}

/// A parsed model string: a planner, optionally paired with a grounder via
/// `planner+grounder` syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub planner: ModelRef,
    pub grounder: Option<ModelRef>,
}

impl ModelSpec {
    /// Parse a model string.
    ///
    /// Grammar: `simple | simple "+" simple` where
    /// `simple := provider "/" name ("/" name)*`.  More than one `+` is
    /// rejected.  Results are cached per input string – parsing is on the
    /// request hot path.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ModelError::UnknownModel("<empty>".into()));
        }

        if let Some(cached) = cache().lock().ok().and_then(|c| c.get(s).cloned()) {
            return Ok(cached);
        }

        if s.matches('+').count() > 1 {
            return Err(ModelError::UnknownModel(s.to_string()));
        }

        let spec = match s.split_once('+') {
            Some((planner, grounder)) => ModelSpec {
                planner: ModelRef::parse(planner)?,
                grounder: Some(ModelRef::parse(grounder)?),
            },
            None => ModelSpec { planner: ModelRef::parse(s)?, grounder: None },
        };

        if let Ok(mut c) = cache().lock() {
            c.insert(s.to_string(), spec.clone());
        }
        Ok(spec)
    }

    pub fn is_composite(&self) -> bool {
        self.grounder.is_some()
    }
}

fn cache() -> &'static Mutex<HashMap<String, ModelSpec>> {
    static CACHE: OnceLock<Mutex<HashMap<String, ModelSpec>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
