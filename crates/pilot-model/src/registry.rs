// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver registry: static metadata for every supported model provider.
//!
//! This module acts as the single source of truth for which provider ids
//! exist and what their defaults are.  It does **not** contain construction
//! logic – that lives in [`crate::resolve`].

/// Metadata describing a registered agent-loop driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique provider id, the prefix of a model string (e.g. `"openai"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line description shown by `pilot list-providers`.
    pub description: &'static str,
    /// Environment variable that holds the API key.  `None` for providers
    /// that need no key (local servers, human).
    pub default_api_key_env: Option<&'static str>,
    /// Environment variable that may override the base URL per request.
    pub base_url_env: Option<&'static str>,
    /// Default base URL when no override is present.  `None` for drivers
    /// without an HTTP endpoint (human).
    pub default_base_url: Option<&'static str>,
    /// `true` for drivers that can only serve as the grounder side of a
    /// composite model string.
    pub grounder_only: bool,
}

/// Complete registry of supported drivers.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "openai",
        name: "OpenAI computer-use",
        description: "OpenAI Responses API with the computer_use_preview tool",
        default_api_key_env: Some("OPENAI_API_KEY"),
        base_url_env: Some("OPENAI_BASE_URL"),
        default_base_url: Some("https://api.openai.com/v1"),
        grounder_only: false,
    },
    DriverMeta {
        id: "anthropic",
        name: "Anthropic computer-use",
        description: "Anthropic Messages API with the computer tool",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        base_url_env: Some("ANTHROPIC_BASE_URL"),
        default_base_url: Some("https://api.anthropic.com"),
        grounder_only: false,
    },
    DriverMeta {
        id: "ollama_chat",
        name: "Ollama",
        description: "Local Ollama server, strict-JSON vision protocol",
        default_api_key_env: None,
        base_url_env: Some("OLLAMA_BASE_URL"),
        default_base_url: Some("http://localhost:11434/v1"),
        grounder_only: false,
    },
    DriverMeta {
        id: "huggingface-local",
        name: "Hugging Face (local)",
        description: "Locally served HF model over an OpenAI-compatible endpoint",
        default_api_key_env: None,
        base_url_env: Some("HF_LOCAL_BASE_URL"),
        default_base_url: Some("http://localhost:8080/v1"),
        grounder_only: false,
    },
    DriverMeta {
        id: "mlx",
        name: "MLX",
        description: "mlx-vlm server over an OpenAI-compatible endpoint",
        default_api_key_env: None,
        base_url_env: Some("MLX_BASE_URL"),
        default_base_url: Some("http://localhost:8000/v1"),
        grounder_only: false,
    },
    DriverMeta {
        id: "omniparser",
        name: "OmniParser",
        description: "Set-of-Marks UI element detector (grounder only)",
        default_api_key_env: None,
        base_url_env: Some("OMNIPARSER_BASE_URL"),
        default_base_url: Some("http://localhost:7860"),
        grounder_only: true,
    },
    DriverMeta {
        id: "human",
        name: "Human",
        description: "Human-in-the-loop: actions supplied over an async channel",
        default_api_key_env: None,
        base_url_env: None,
        default_base_url: None,
        grounder_only: false,
    },
];

/// Returns all registered drivers in declaration order.
pub fn list_drivers() -> &'static [DriverMeta] {
    DRIVERS
}

/// Look up a driver by its id.  Returns `None` for unknown ids.
pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// Returns an iterator over all known driver ids.
pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_non_empty() {
        assert!(!DRIVERS.is_empty());
    }

    #[test]
    fn all_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for d in DRIVERS {
            assert!(seen.insert(d.id), "duplicate driver id: {}", d.id);
        }
    }

    #[test]
    fn get_driver_returns_correct_entry() {
        let d = get_driver("anthropic").expect("anthropic must be registered");
        assert_eq!(d.default_api_key_env, Some("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn get_driver_returns_none_for_unknown() {
        assert!(get_driver("totally-unknown-provider-xyz").is_none());
    }

    #[test]
    fn known_driver_ids_covers_required_providers() {
        let ids: Vec<&str> = known_driver_ids().collect();
        for required in &[
            "openai",
            "anthropic",
            "huggingface-local",
            "ollama_chat",
            "mlx",
            "omniparser",
            "human",
        ] {
            assert!(ids.contains(required), "missing required driver: {required}");
        }
    }

    #[test]
    fn omniparser_is_grounder_only() {
        assert!(get_driver("omniparser").unwrap().grounder_only);
        assert!(!get_driver("openai").unwrap().grounder_only);
    }
}
