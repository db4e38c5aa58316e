// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pilot_schema::{MouseButton, OsType, Point, PortError};

use crate::Computer;

/// Smallest well-formed PNG-ish payload the fakes serve.  The orchestrator
/// treats screenshots as opaque bytes, so the content only needs to be stable.
const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// In-memory computer fake that records every call as a readable string.
///
/// Tests assert on the exact call sequence
/// (`["move_cursor(100,200)", "left_click(100,200)"]`).  Per-method
/// artificial delays let cancellation tests park a call mid-flight.
#[derive(Clone)]
pub struct RecordingComputer {
    calls: Arc<Mutex<Vec<String>>>,
    delays: Arc<Mutex<HashMap<&'static str, Duration>>>,
    display: (u32, u32),
    os_type: OsType,
    name: String,
}

impl Default for RecordingComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingComputer {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            delays: Arc::new(Mutex::new(HashMap::new())),
            display: (1024, 768),
            os_type: OsType::Linux,
            name: "recording".into(),
        }
    }

    pub fn with_display(mut self, w: u32, h: u32) -> Self {
        self.display = (w, h);
        self
    }

    pub fn with_os(mut self, os: OsType) -> Self {
        self.os_type = os;
        self
    }

    /// Make `method` sleep for `delay` before recording.  Used by
    /// cancellation tests to hold an action in flight.
    pub fn with_delay(self, method: &'static str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(method, delay);
        self
    }

    /// Snapshot of all recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, method: &'static str, repr: String) {
        let delay = self.delays.lock().unwrap().get(method).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.calls.lock().unwrap().push(repr);
    }
}

#[async_trait]
impl Computer for RecordingComputer {
    async fn screenshot(&self) -> Result<Vec<u8>, PortError> {
        self.record("screenshot", "screenshot".into()).await;
        Ok(FAKE_PNG.to_vec())
    }

    async fn dimensions(&self) -> Result<(u32, u32), PortError> {
        Ok(self.display)
    }

    async fn move_cursor(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.record("move_cursor", format!("move_cursor({x},{y})")).await;
        Ok(())
    }

    async fn left_click(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.record("left_click", format!("left_click({x},{y})")).await;
        Ok(())
    }

    async fn right_click(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.record("right_click", format!("right_click({x},{y})")).await;
        Ok(())
    }

    async fn double_click(&self, x: i32, y: i32) -> Result<(), PortError> {
        self.record("double_click", format!("double_click({x},{y})")).await;
        Ok(())
    }

    async fn mouse_down(&self, x: i32, y: i32, button: MouseButton) -> Result<(), PortError> {
        self.record("mouse_down", format!("mouse_down({x},{y},{button})")).await;
        Ok(())
    }

    async fn mouse_up(&self, x: i32, y: i32, button: MouseButton) -> Result<(), PortError> {
        self.record("mouse_up", format!("mouse_up({x},{y},{button})")).await;
        Ok(())
    }

    async fn drag(
        &self,
        path: &[Point],
        button: MouseButton,
        duration_ms: u64,
    ) -> Result<(), PortError> {
        let pts: Vec<String> = path.iter().map(|p| format!("({},{})", p.x, p.y)).collect();
        self.record(
            "drag",
            format!("drag([{}],{button},{duration_ms})", pts.join(",")),
        )
        .await;
        Ok(())
    }

    async fn scroll(&self, x: i32, y: i32, sx: i32, sy: i32) -> Result<(), PortError> {
        self.record("scroll", format!("scroll({x},{y},{sx},{sy})")).await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), PortError> {
        self.record("type_text", format!("type_text({text})")).await;
        Ok(())
    }

    async fn press_keys(&self, keys: &[String]) -> Result<(), PortError> {
        self.record("press_keys", format!("press_keys({})", keys.join("+"))).await;
        Ok(())
    }

    async fn wait(&self, ms: u64) -> Result<(), PortError> {
        self.record("wait", format!("wait({ms})")).await;
        Ok(())
    }

    fn os_type(&self) -> OsType {
        self.os_type
    }

    fn provider_type(&self) -> &str {
        "recording"
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
