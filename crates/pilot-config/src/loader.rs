// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/pilot/config.yaml"));
    paths.push(PathBuf::from("/etc/pilot/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/pilot/config.yaml"));
        paths.push(home.join(".config/pilot/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("pilot/config.yaml"));
        paths.push(cfg.join("pilot/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".pilot/config.yaml"));
    paths.push(PathBuf::from(".pilot/config.yml"));
    paths.push(PathBuf::from(".pilot.yaml"));
    paths.push(PathBuf::from(".pilot.yml"));
    paths.push(PathBuf::from("pilot.yaml"));
    paths.push(PathBuf::from("pilot.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then apply the
/// process-environment overrides (`CUA_MODEL_NAME`, `CUA_CONTAINER_NAME`).
/// The `extra` argument may provide an explicit path (e.g. `--config`).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("invalid configuration")?
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply the well-known environment variables on top of the file layers.
/// These are read from the *process* environment at startup; per-request
/// `env` maps are handled separately via `EnvSnapshot`.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(model) = std::env::var("CUA_MODEL_NAME") {
        if !model.is_empty() {
            config.model = model;
        }
    }
    if let Ok(name) = std::env::var("CUA_CONTAINER_NAME") {
        if !name.is_empty() {
            config.computer.name = Some(name);
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("agent:\n  max_steps: 100\n  llm_timeout_secs: 120");
        let src = val("agent:\n  max_steps: 10");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["agent"]["max_steps"].as_i64(), Some(10));
        assert_eq!(dst["agent"]["llm_timeout_secs"].as_i64(), Some(120));
    }

    #[test]
    fn explicit_file_layer_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.yaml");
        std::fs::write(&path, "model: openai/computer-use-preview\npool:\n  size: 2\n")
            .unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.model, "openai/computer-use-preview");
        assert_eq!(cfg.pool.size, 2);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.agent.max_steps, 100);
    }
}
