// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pilot_config::EnvSnapshot;
use pilot_schema::{parse_data_url_parts, Action, Usage};

use crate::{
    http::{base_url, post_json},
    registry, GroundRequest, Grounder, ModelError,
};

/// A UI element detected by the OmniParser service (Set-of-Marks).
#[derive(Debug, Clone, Deserialize)]
pub struct SomElement {
    /// Normalised `[x1, y1, x2, y2]` in the 0.0–1.0 range.
    pub bbox: [f32; 4],
    /// OCR text or caption for the element.
    #[serde(default)]
    pub content: String,
    /// Whether the detector considers the element clickable.
    #[serde(default)]
    pub interactivity: bool,
}

impl SomElement {
    /// Centre of the bounding box in display pixels.
    pub fn centre(&self, display: (u32, u32)) -> (i32, i32) {
        let cx = (self.bbox[0] + self.bbox[2]) / 2.0;
        let cy = (self.bbox[1] + self.bbox[3]) / 2.0;
        (
            (cx * display.0 as f32).round() as i32,
            (cy * display.1 as f32).round() as i32,
        )
    }
}

/// Grounder backed by an OmniParser detection endpoint.
///
/// This driver is grounder-only: it cannot plan, so a bare `omniparser`
/// model string is rejected at resolution time.  As the right-hand side of
/// `planner+omniparser` it detects UI elements on the current screenshot
/// and picks the best lexical match for the planner's intent.
pub struct OmniparserGrounder {
    client: reqwest::Client,
}

impl Default for OmniparserGrounder {
    fn default() -> Self {
        Self::new()
    }
}

impl OmniparserGrounder {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    /// Run detection on a screenshot and return all elements.
    pub async fn detect(
        &self,
        screenshot_url: &str,
        env: &EnvSnapshot,
        cancel: &CancellationToken,
    ) -> Result<Vec<SomElement>, ModelError> {
        let meta = registry::get_driver("omniparser").expect("omniparser driver registered");
        let base = base_url(meta, env)?;

        // The service wants bare base64, not a data URL.
        let b64 = match parse_data_url_parts(screenshot_url) {
            Ok((_, b64)) => b64,
            Err(_) => {
                return Err(ModelError::target(
                    "omniparser requires a base64 data-URL screenshot",
                ))
            }
        };

        let body = json!({ "base64_image": b64 });
        let resp = post_json(&self.client, &format!("{base}/parse/"), &[], &body, cancel).await?;

        let elements: Vec<SomElement> = resp["parsed_content_list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        debug!(count = elements.len(), "omniparser detection complete");
        Ok(elements)
    }
}

/// Lexical overlap between an intent and an element caption: the fraction
/// of intent words present in the caption.  Interactive elements win ties.
fn match_score(intent: &str, element: &SomElement) -> f32 {
    let caption = element.content.to_lowercase();
    let words: Vec<&str> = intent
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && w.len() > 1)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words
        .iter()
        .filter(|w| caption.contains(&w.to_lowercase()))
        .count();
    let base = hits as f32 / words.len() as f32;
    if element.interactivity {
        base + 0.05
    } else {
        base
    }
}

#[async_trait]
impl Grounder for OmniparserGrounder {
    async fn ground(&self, req: GroundRequest<'_>) -> Result<(Action, Usage), ModelError> {
        let elements = self.detect(req.screenshot_url, req.env, &req.cancel).await?;

        let best = elements
            .iter()
            .map(|e| (match_score(req.intent, e), e))
            .filter(|(score, _)| *score > 0.0)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let Some((score, element)) = best else {
            return Err(ModelError::target(format!(
                "no UI element matched intent {:?} among {} detections",
                req.intent,
                elements.len()
            )));
        };
        debug!(score, content = %element.content, "grounded intent");

        let (x, y) = element.centre(req.display);
        Ok((Action::click(x, y), Usage::default()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn element(content: &str, interactive: bool, bbox: [f32; 4]) -> SomElement {
        SomElement { bbox, content: content.into(), interactivity: interactive }
    }

    #[test]
    fn centre_scales_to_display() {
        let e = element("Submit", true, [0.4, 0.7, 0.6, 0.9]);
        assert_eq!(e.centre((1000, 500)), (500, 400));
    }

    #[test]
    fn exact_caption_outranks_partial() {
        let submit = element("Submit order", true, [0.0; 4]);
        let cancel = element("Cancel", true, [0.0; 4]);
        let intent = "the Submit button";
        assert!(match_score(intent, &submit) > match_score(intent, &cancel));
    }

    #[test]
    fn interactive_elements_win_ties() {
        let label = element("Save", false, [0.0; 4]);
        let button = element("Save", true, [0.0; 4]);
        assert!(match_score("save", &button) > match_score("save", &label));
    }

    #[test]
    fn no_overlap_scores_zero() {
        let e = element("File menu", false, [0.0; 4]);
        assert_eq!(match_score("submit", &e), 0.0);
    }

    #[test]
    fn short_stopwords_are_ignored() {
        // Single-letter words would match almost anything.
        let e = element("A very long caption", false, [0.0; 4]);
        assert_eq!(match_score("a", &e), 0.0);
    }

    #[test]
    fn element_json_decodes_with_defaults() {
        let e: SomElement = serde_json::from_value(json!({
            "bbox": [0.1, 0.2, 0.3, 0.4],
        }))
        .unwrap();
        assert_eq!(e.content, "");
        assert!(!e.interactivity);
    }
}
