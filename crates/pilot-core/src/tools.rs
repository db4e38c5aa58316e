// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use pilot_schema::PortError;

/// Handler for a `function_call` that is not a computer action.
///
/// Tool semantics live outside the core; this registry only routes.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: &str) -> Result<String, String>;
}

/// Built-in no-op tool.  Adapters emit `function_call{name:"noop"}` when
/// they could not parse model output; echoing the arguments back gives the
/// model its own parse error to correct on the next turn.
struct NoopTool;

#[async_trait]
impl ToolHandler for NoopTool {
    async fn call(&self, arguments: &str) -> Result<String, String> {
        Ok(arguments.to_string())
    }
}

/// Name → handler map for non-computer tools.
pub struct ToolRouter {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl Default for ToolRouter {
    fn default() -> Self {
        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert("noop".into(), Arc::new(NoopTool));
        Self { handlers }
    }
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Route a function call.  Unknown names surface as a `Target` error so
    /// `on_error` callbacks may recover; a handler's own failure is also a
    /// `Target` error.
    pub async fn route(&self, name: &str, arguments: &str) -> Result<String, PortError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| PortError::Target(format!("unknown tool: {name}")))?;
        handler
            .call(arguments)
            .await
            .map_err(|e| PortError::Target(format!("tool {name} failed: {e}")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
