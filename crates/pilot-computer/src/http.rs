// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use pilot_schema::{MouseButton, OsType, Point, PortError};

use crate::Computer;

/// Client for the sandbox-side RPC server.
///
/// The server runs inside the sandbox (an external collaborator) and exposes:
///
/// - `GET  /info`        → `{ os_type, display_width, display_height, name, provider_type }`
/// - `GET  /screenshot`  → raw PNG bytes
/// - `POST /input`       → `{ "type": "<op>", ... }`, empty 200 on success
///
/// 5xx and socket errors map to [`PortError::Transport`] so the orchestrator
/// retries them; 4xx maps to [`PortError::Target`].
pub struct HttpComputer {
    base_url: String,
    client: reqwest::Client,
    os_type: OsType,
    display: (u32, u32),
    provider_type: String,
    name: String,
}

impl HttpComputer {
    /// Connect to a sandbox RPC server and read its `/info` descriptor.
    pub async fn connect(base_url: &str) -> Result<Self, PortError> {
        let client = reqwest::Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();
        let info: Value = get_json(&client, &format!("{base_url}/info")).await?;

        let os_type = info["os_type"]
            .as_str()
            .unwrap_or("linux")
            .parse()
            .map_err(PortError::Target)?;
        let display_size = (
            info["display_width"].as_u64().unwrap_or(1024) as u32,
            info["display_height"].as_u64().unwrap_or(768) as u32,
        );
        let name = info["name"].as_str().unwrap_or(&base_url).to_string();
        let provider_type = info["provider_type"].as_str().unwrap_or("cloud").to_string();

        debug!(%base_url, %name, ?display_size, "connected to computer");
        Ok(Self { base_url, client, os_type, display: display_size, provider_type, name })
    }

    async fn input(&self, body: Value) -> Result<(), PortError> {
        let url = format!("{}/input", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("POST {url}: {e}")))?;
        check_status(resp).await?;
        Ok(())
    }
}

async fn get_json(client: &reqwest::Client, url: &str) -> Result<Value, PortError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| PortError::Transport(format!("GET {url}: {e}")))?;
    let resp = check_status(resp).await?;
    resp.json()
        .await
        .map_err(|e| PortError::Target(format!("invalid JSON from {url}: {e}")))
}

/// Map HTTP status codes onto the port error taxonomy.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PortError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(PortError::Transport(format!("{status}: {body}")))
    } else {
        Err(PortError::Target(format!("{status}: {body}")))
    }
}

#[async_trait]
impl Computer for HttpComputer {
    async fn screenshot(&self) -> Result<Vec<u8>, PortError> {
        let url = format!("{}/screenshot", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("GET {url}: {e}")))?;
        let resp = check_status(resp).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PortError::Transport(format!("reading screenshot body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn dimensions(&self) -> Result<(u32, u32), PortError> {
        Ok(self.display)
    }

    async fn move_cursor(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.input(json!({ "type": "move_cursor", "x": x, "y": y })).await
    }

    async fn left_click(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.input(json!({ "type": "left_click", "x": x, "y": y })).await
    }

    async fn right_click(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.input(json!({ "type": "right_click", "x": x, "y": y })).await
    }

    async fn double_click(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.input(json!({ "type": "double_click", "x": x, "y": y })).await
    }

    async fn mouse_down(&self, x: i32, y: i32, button: MouseButton) -> Result<(), PortError> {
        self.input(json!({ "type": "mouse_down", "x": x, "y": y, "button": button.to_string() }))
            .await
    }

    async fn mouse_up(&self, x: i32, y: i32, button: MouseButton) -> Result<(), PortError> {
        self.input(json!({ "type": "mouse_up", "x": x, "y": y, "button": button.to_string() }))
            .await
    }

    async fn drag(
        &self,
        path: &[Point],
        button: MouseButton,
        duration_ms: u64,
    ) -> Result<(), PortError> {
        let points: Vec<Value> = path.iter().map(|p| json!({ "x": p.x, "y": p.y })).collect();
        self.input(json!({
            "type": "drag",
            "path": points,
            "button": button.to_string(),
            "duration_ms": duration_ms,
        }))
        .await
    }

    async fn scroll(&self, x: i32, y: i32, sx: i32, sy: i32) -> Result<(), PortError> {
        self.input(json!({
            "type": "scroll",
            "x": x, "y": y,
            "scroll_x": sx, "scroll_y": sy,
        }))
        .await
    }

    async fn type_text(&self, text: &str) -> Result<(), PortError> {
        self.input(json!({ "type": "type", "text": text })).await
    }

    async fn press_keys(&self, keys: &[String]) -> Result<(), PortError> {
        self.input(json!({ "type": "keypress", "keys": keys })).await
    }

    async fn wait(&self, ms: u64) -> Result<(), PortError> {
        self.input(json!({ "type": "wait", "ms": ms })).await
    }

    fn os_type(&self) -> OsType {
        self.os_type
    }

    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    fn name(&self) -> &str {
        &self.name
    }
}
