// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Mouse button selector used by click and drag actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Wheel,
    Back,
    Forward,
}

impl std::fmt::Display for MouseButton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Wheel => "wheel",
            MouseButton::Back => "back",
            MouseButton::Forward => "forward",
        };
        write!(f, "{s}")
    }
}

/// A single point on the display, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A single request to act on the remote computer.
///
/// This is the canonical wire shape: every adapter decodes provider output
/// into one of these variants and every dispatcher consumes them.  Unknown
/// fields on incoming JSON are ignored; unknown variants are rejected by
/// [`crate::Message::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(default)]
        button: MouseButton,
        x: i32,
        y: i32,
    },
    DoubleClick {
        #[serde(default)]
        button: MouseButton,
        x: i32,
        y: i32,
    },
    Drag {
        #[serde(default)]
        button: MouseButton,
        path: Vec<Point>,
    },
    Move {
        x: i32,
        y: i32,
    },
    Scroll {
        x: i32,
        y: i32,
        scroll_x: i32,
        scroll_y: i32,
    },
    Keypress {
        keys: Vec<String>,
    },
    Type {
        text: String,
    },
    Screenshot,
    Wait,
    LeftMouseDown {
        x: i32,
        y: i32,
    },
    LeftMouseUp {
        x: i32,
        y: i32,
    },
}

impl Action {
    /// Convenience constructor for a plain left click.
    pub fn click(x: i32, y: i32) -> Self {
        Action::Click { button: MouseButton::Left, x, y }
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Action::Drag { path, .. } if path.len() < 2 => {
                Err(ValidationError::DragPathTooShort(path.len()))
            }
            Action::Keypress { keys } if keys.is_empty() => {
                Err(ValidationError::EmptyKeypress())
            }
            _ => Ok(()),
        }
    }

    /// Short name of the variant as it appears on the wire (`"click"`, …).
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Drag { .. } => "drag",
            Action::Move { .. } => "move",
            Action::Scroll { .. } => "scroll",
            Action::Keypress { .. } => "keypress",
            Action::Type { .. } => "type",
            Action::Screenshot => "screenshot",
            Action::Wait => "wait",
            Action::LeftMouseDown { .. } => "left_mouse_down",
            Action::LeftMouseUp { .. } => "left_mouse_up",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn click_serialises_with_type_tag() {
        let a = Action::click(100, 200);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["button"], "left");
        assert_eq!(json["x"], 100);
        assert_eq!(json["y"], 200);
    }

    #[test]
    fn screenshot_serialises_to_bare_tag() {
        let json = serde_json::to_value(Action::Screenshot).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "screenshot" }));
    }

    #[test]
    fn click_without_button_defaults_to_left() {
        let a: Action =
            serde_json::from_str(r#"{"type":"click","x":1,"y":2}"#).unwrap();
        assert_eq!(a, Action::click(1, 2));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let a: Action = serde_json::from_str(
            r#"{"type":"click","x":1,"y":2,"pressure":0.5}"#,
        )
        .unwrap();
        assert_eq!(a, Action::click(1, 2));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let res: Result<Action, _> =
            serde_json::from_str(r#"{"type":"teleport","x":1,"y":2}"#);
        assert!(res.is_err());
    }

    #[test]
    fn drag_round_trips() {
        let a = Action::Drag {
            button: MouseButton::Left,
            path: vec![Point::new(0, 0), Point::new(10, 10)],
        };
        let json = serde_json::to_string(&a).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn drag_with_one_point_is_invalid() {
        let a = Action::Drag { button: MouseButton::Left, path: vec![Point::new(0, 0)] };
        assert_eq!(a.validate(), Err(ValidationError::DragPathTooShort(1)));
    }

    #[test]
    fn keypress_with_no_keys_is_invalid() {
        let a = Action::Keypress { keys: vec![] };
        assert_eq!(a.validate(), Err(ValidationError::EmptyKeypress()));
    }

    #[test]
    fn keypress_chord_is_valid() {
        let a = Action::Keypress { keys: vec!["ctrl".into(), "s".into()] };
        assert!(a.validate().is_ok());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let a = Action::LeftMouseDown { x: 1, y: 1 };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["type"], a.kind());
    }
}
