// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

/// Per-request environment view.
///
/// A request may carry an `env` map (e.g. a caller-provided
/// `OPENAI_API_KEY`) that must override the process environment *for that
/// request only*.  This type layers the overrides on top of
/// `std::env::var` without ever mutating process-global state, and is
/// threaded through the adapter call stack by value.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    overrides: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Snapshot with no overrides: reads fall through to the process env.
    pub fn process() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// Look up `key`: request overrides first, process env second.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.overrides.get(key) {
            return Some(v.clone());
        }
        std::env::var(key).ok()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Add or replace a single override, returning the modified snapshot.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_process_env() {
        // PATH is set in every test environment.
        let snap = EnvSnapshot::process().with("PATH", "/overridden");
        assert_eq!(snap.get("PATH").as_deref(), Some("/overridden"));
    }

    #[test]
    fn falls_through_to_process_env() {
        let snap = EnvSnapshot::process();
        assert_eq!(snap.get("PATH"), std::env::var("PATH").ok());
    }

    #[test]
    fn missing_key_yields_default() {
        let snap = EnvSnapshot::process();
        assert_eq!(snap.get_or("PILOT_DEFINITELY_UNSET_XYZ", "fallback"), "fallback");
    }

    #[test]
    fn overrides_do_not_touch_process_env() {
        let _snap = EnvSnapshot::process().with("PILOT_SCOPED_ONLY", "1");
        assert!(std::env::var("PILOT_SCOPED_ONLY").is_err());
    }
}
