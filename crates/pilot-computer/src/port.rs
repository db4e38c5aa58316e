// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

use pilot_schema::{MouseButton, OsType, Point, PortError};

/// The computer port: screenshot and input primitives of one sandboxed
/// desktop.
///
/// The port is a mechanical executor – it never interprets actions
/// semantically.  All operations may fail with [`PortError::Transport`]
/// (retryable) or [`PortError::Target`] (not retryable).  Implementations
/// must be cheap to share behind an `Arc`.
#[async_trait]
pub trait Computer: Send + Sync {
    /// Capture the full display as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, PortError>;

    /// Display size in pixels `(width, height)`.
    async fn dimensions(&self) -> Result<(u32, u32), PortError>;

    async fn move_cursor(&self, x: i32, y: i32) -> Result<(), PortError>;
    async fn left_click(&self, x: i32, y: i32) -> Result<(), PortError>;
    async fn right_click(&self, x: i32, y: i32) -> Result<(), PortError>;
    async fn double_click(&self, x: i32, y: i32) -> Result<(), PortError>;
    async fn mouse_down(&self, x: i32, y: i32, button: MouseButton) -> Result<(), PortError>;
    async fn mouse_up(&self, x: i32, y: i32, button: MouseButton) -> Result<(), PortError>;

    /// Press-move-release along `path` with `button` held, spreading the
    /// motion over `duration_ms`.
    async fn drag(&self, path: &[Point], button: MouseButton, duration_ms: u64)
        -> Result<(), PortError>;

    /// Wheel scroll at `(x, y)`; `(sx, sy)` are wheel deltas.
    async fn scroll(&self, x: i32, y: i32, sx: i32, sy: i32) -> Result<(), PortError>;

    async fn type_text(&self, text: &str) -> Result<(), PortError>;

    /// Press the given keys; a chord when more than one key is listed.
    async fn press_keys(&self, keys: &[String]) -> Result<(), PortError>;

    async fn wait(&self, ms: u64) -> Result<(), PortError>;

    fn os_type(&self) -> OsType;
    fn provider_type(&self) -> &str;
    fn name(&self) -> &str;
}

/// Encode raw PNG bytes as the data URL the canonical schema carries.
pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", B64.encode(png))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_data_url_has_mime_prefix() {
        let url = png_data_url(&[0x89, 0x50, 0x4e, 0x47]);
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn png_data_url_round_trips_through_schema_parser() {
        let url = png_data_url(b"not really a png");
        let (mime, b64) = pilot_schema::parse_data_url_parts(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(B64.decode(b64).unwrap(), b"not really a png");
    }
}
