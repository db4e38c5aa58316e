// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use pilot_schema::PortError;

/// Failure while resolving or driving a model adapter.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No adapter resolves the model string.  Fatal to the run.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Missing API key, grounder used as planner, or similar misuse.
    /// Fatal before any LLM call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A port-level failure (network / provider 4xx / cancellation).
    #[error(transparent)]
    Port(#[from] PortError),
}

impl ModelError {
    pub fn transport(msg: impl Into<String>) -> Self {
        ModelError::Port(PortError::Transport(msg.into()))
    }

    pub fn target(msg: impl Into<String>) -> Self {
        ModelError::Port(PortError::Target(msg.into()))
    }

    /// Whether the retry policy may re-issue the failed turn.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Port(p) if p.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_retryable() {
        assert!(ModelError::transport("502").is_retryable());
        assert!(!ModelError::target("400").is_retryable());
        assert!(!ModelError::UnknownModel("x".into()).is_retryable());
        assert!(!ModelError::Port(PortError::Cancelled).is_retryable());
    }
}
