// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use tracing::{error, info};

use pilot_schema::{parse_data_url_parts, ContentPart, Message};

use crate::{Callback, PiiScrubber, RunContext, RunSummary};

/// Durable, append-only trajectory capture.
///
/// Layout under the configured root, one directory per run:
///
/// ```text
/// <root>/20260801_142233_<session_id>/
///   messages.jsonl            # one canonical message per line
///   usage.json                # final accumulated usage
///   screenshots/<call_id>.png
/// ```
///
/// Writes happen on every event so a crash loses at most the in-flight
/// line; `on_run_end` fsyncs the log.  IO failures are logged, never
/// propagated – trajectory capture must not take a run down.
pub struct TrajectoryWriter {
    root: PathBuf,
    scrubber: Option<PiiScrubber>,
    state: Mutex<Option<RunDir>>,
}

struct RunDir {
    dir: PathBuf,
    log: File,
}

impl TrajectoryWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), scrubber: None, state: Mutex::new(None) }
    }

    /// Redact logged lines with the given scrubber before writing.
    pub fn with_scrubber(mut self, scrubber: PiiScrubber) -> Self {
        self.scrubber = Some(scrubber);
        self
    }

    /// The directory of the current (or last) run, if one was started.
    pub fn run_dir(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().as_ref().map(|s| s.dir.clone())
    }

    fn append_line(&self, line: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(run) = state.as_mut() else { return };
        let line = match &self.scrubber {
            Some(s) => s.redact(line),
            None => line.to_string(),
        };
        if let Err(e) = writeln!(run.log, "{line}") {
            error!(error = %e, "trajectory append failed");
        }
    }

    fn save_screenshot(&self, call_id: &str, image_url: &str) {
        let Some(dir) = self.run_dir() else { return };
        let Ok((_, b64)) = parse_data_url_parts(image_url) else { return };
        let Ok(bytes) = B64.decode(b64) else { return };
        let path = dir.join("screenshots").join(format!("{call_id}.png"));
        if let Err(e) = std::fs::write(&path, bytes) {
            error!(path = %path.display(), error = %e, "screenshot write failed");
        }
    }
}

impl Callback for TrajectoryWriter {
    fn name(&self) -> &str {
        "trajectory_writer"
    }

    fn on_run_start(&self, ctx: &RunContext) {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let dir = self.root.join(format!("{stamp}_{}", ctx.session_id));
        let result = std::fs::create_dir_all(dir.join("screenshots")).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("messages.jsonl"))
        });
        match result {
            Ok(log) => {
                info!(dir = %dir.display(), "trajectory capture started");
                *self.state.lock().unwrap() = Some(RunDir { dir, log });
            }
            Err(e) => error!(error = %e, "could not create trajectory directory"),
        }
    }

    fn on_message(&self, _ctx: &RunContext, message: &Message) {
        self.append_line(&message.encode().to_string());
        if let Message::ComputerCallOutput {
            call_id,
            output: ContentPart::ComputerScreenshot { image_url },
        } = message
        {
            self.save_screenshot(call_id, image_url);
        }
    }

    fn on_run_end(&self, _ctx: &RunContext, result: &RunSummary) {
        let mut state = self.state.lock().unwrap();
        let Some(run) = state.as_mut() else { return };
        let usage = serde_json::json!({
            "status": result.status,
            "usage": result.usage,
            "error": result.error,
        });
        if let Err(e) = std::fs::write(run.dir.join("usage.json"), usage.to_string()) {
            error!(error = %e, "usage write failed");
        }
        if let Err(e) = run.log.sync_all() {
            error!(error = %e, "trajectory fsync failed");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
