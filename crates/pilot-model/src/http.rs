// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pilot_schema::PortError;

/// POST a JSON body and decode a JSON reply, mapping failures onto the port
/// error taxonomy:
///
/// - request cancelled            → `Cancelled`
/// - connect/socket error         → `Transport`
/// - 5xx / 429                    → `Transport` (retryable)
/// - other non-2xx                → `Target`
/// - body that is not valid JSON  → `Target`
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    cancel: &CancellationToken,
) -> Result<Value, PortError> {
    let mut req = client.post(url).json(body);
    for (k, v) in headers {
        req = req.header(k, v);
    }

    debug!(%url, "llm request");
    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(PortError::Cancelled),
        r = req.send() => r.map_err(|e| PortError::Transport(format!("POST {url}: {e}")))?,
    };

    let status = resp.status();
    let text = tokio::select! {
        _ = cancel.cancelled() => return Err(PortError::Cancelled),
        t = resp.text() => t.map_err(|e| PortError::Transport(format!("reading {url}: {e}")))?,
    };

    if status.is_server_error() || status.as_u16() == 429 {
        return Err(PortError::Transport(format!("{status}: {text}")));
    }
    if !status.is_success() {
        return Err(PortError::Target(format!("{status}: {text}")));
    }

    serde_json::from_str(&text)
        .map_err(|e| PortError::Target(format!("invalid JSON from {url}: {e}")))
}

/// Resolve the effective base URL for a driver: per-request env override
/// first, static registry default second.
pub(crate) fn base_url(
    meta: &crate::registry::DriverMeta,
    env: &pilot_config::EnvSnapshot,
) -> Result<String, PortError> {
    if let Some(var) = meta.base_url_env {
        if let Some(url) = env.get(var) {
            return Ok(url.trim_end_matches('/').to_string());
        }
    }
    meta.default_base_url
        .map(|u| u.trim_end_matches('/').to_string())
        .ok_or_else(|| PortError::Target(format!("driver {} has no endpoint", meta.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::get_driver;
    use pilot_config::EnvSnapshot;

    #[test]
    fn base_url_prefers_env_override() {
        let meta = get_driver("ollama_chat").unwrap();
        let env = EnvSnapshot::process().with("OLLAMA_BASE_URL", "http://gpu-box:11434/v1/");
        assert_eq!(base_url(meta, &env).unwrap(), "http://gpu-box:11434/v1");
    }

    #[test]
    fn base_url_falls_back_to_registry_default() {
        let meta = get_driver("openai").unwrap();
        let env = EnvSnapshot::process();
        assert_eq!(base_url(meta, &env).unwrap(), "https://api.openai.com/v1");
    }

    #[test]
    fn base_url_errors_for_endpointless_driver() {
        let meta = get_driver("human").unwrap();
        assert!(base_url(meta, &EnvSnapshot::process()).is_err());
    }
}
