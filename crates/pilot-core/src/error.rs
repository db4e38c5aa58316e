// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use pilot_model::ModelError;
use pilot_schema::PortError;

/// Terminal classification of one run of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything that can end a run before a natural terminal assistant turn.
///
/// `BudgetExceeded` and `StepLimitReached` are *clean* terminations
/// (`status=completed` with an explanatory message); `Cancelled` is the
/// terminal non-error state; the rest fail the run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("target error: {0}")]
    Target(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    BudgetExceeded(String),

    #[error("step limit of {0} reached")]
    StepLimitReached(u32),

    #[error("{0}")]
    Fatal(String),
}

impl RunError {
    /// The status this error terminates a run with.
    pub fn status(&self) -> RunStatus {
        match self {
            RunError::Cancelled => RunStatus::Cancelled,
            RunError::BudgetExceeded(_) | RunError::StepLimitReached(_) => RunStatus::Completed,
            _ => RunStatus::Failed,
        }
    }
}

impl From<PortError> for RunError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::Transport(m) => RunError::Transport(m),
            PortError::Target(m) => RunError::Target(m),
            PortError::Cancelled => RunError::Cancelled,
        }
    }
}

impl From<ModelError> for RunError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::UnknownModel(m) => RunError::UnknownModel(m),
            ModelError::Configuration(m) => RunError::Configuration(m),
            ModelError::Port(p) => p.into(),
        }
    }
}
