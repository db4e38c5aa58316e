// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failure of a port operation (LLM endpoint or computer endpoint).
///
/// The split drives the retry machinery: `Transport` failures (network,
/// 5xx, timeout) are retried with back-off, `Target` failures (4xx, schema
/// or parse errors) are surfaced to the error callbacks, and `Cancelled`
/// terminates the run cooperatively.
#[derive(Debug, Clone, Error)]
pub enum PortError {
    /// Network-level failure or a 5xx from the remote end.  Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request itself was rejected (4xx, parse failure, validation
    /// failure).  Retrying the identical call will not help.
    #[error("target error: {0}")]
    Target(String),

    /// The operation was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,
}

impl PortError {
    /// Returns `true` when the retry policy may re-issue the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::Transport(_))
    }
}

/// A canonical message or action failed structural validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("drag path must contain at least 2 points, got {0}")]
    DragPathTooShort(usize),

    #[error("keypress requires at least one key")]
    EmptyKeypress(),

    #[error("{0} requires a non-empty call_id")]
    EmptyCallId(&'static str),

    #[error("unknown message type: {0}")]
    UnknownVariant(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
