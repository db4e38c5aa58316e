// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use pilot_schema::OsType;

/// Serde default helper – returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be opt-out need a named function.
fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-5".into()
}
fn default_max_steps() -> u32 {
    100
}
fn default_image_retention_window() -> Option<usize> {
    Some(3)
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_action_timeout_secs() -> u64 {
    30
}
fn default_run_timeout_secs() -> u64 {
    1800
}
fn default_session_idle_timeout_secs() -> u64 {
    300
}
fn default_shutdown_deadline_secs() -> u64 {
    30
}
fn default_pool_size() -> usize {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    60
}
fn default_http_host() -> String {
    "127.0.0.1".into()
}
fn default_http_port() -> u16 {
    7331
}
fn default_p2p_listen() -> String {
    "/ip4/0.0.0.0/tcp/4012".into()
}
fn default_provisioner_url() -> String {
    "http://localhost:8000".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default model string, e.g. `"openai/computer-use-preview"` or a
    /// composite `"anthropic/claude-sonnet-4-5+omniparser"`.
    /// Overridden by `CUA_MODEL_NAME` and per-request bodies.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub computer: ComputerSpec,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            agent: AgentConfig::default(),
            computer: ComputerSpec::default(),
            pool: PoolConfig::default(),
            http: HttpConfig::default(),
            p2p: P2pConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum ASK→ACT loops before the run ends cleanly.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Per-run spend ceiling in USD.  `None` disables the budget gate.
    pub max_trajectory_budget: Option<f64>,
    /// How many recent screenshots stay expanded in the prompt; older ones
    /// are elided.  `None` keeps every screenshot (token-expensive).
    #[serde(default = "default_image_retention_window")]
    pub image_retention_window: Option<usize>,
    /// Hint providers to mark the trailing messages cache-eligible.
    /// A no-op on providers without explicit prompt caching; on by default
    /// because multi-turn screenshot conversations re-send an expensive
    /// prefix every turn.
    #[serde(default = "default_true")]
    pub prompt_cache: bool,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    /// Root directory for trajectory capture; one timestamped subdirectory
    /// is created per run.  `None` disables trajectory writing.
    pub save_trajectory_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_trajectory_budget: None,
            image_retention_window: default_image_retention_window(),
            prompt_cache: true,
            llm_timeout_secs: default_llm_timeout_secs(),
            action_timeout_secs: default_action_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            save_trajectory_dir: None,
        }
    }
}

/// What kind of computer a session needs.  Matched against idle pool
/// handles before asking the provisioner to open a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerSpec {
    #[serde(default)]
    pub os_type: OsType,
    /// Provisioner backend, e.g. `"cloud"`, `"docker"`, `"lume"`, `"winsandbox"`.
    #[serde(default)]
    pub provider_type: String,
    /// Request a specific named computer.  Also settable via
    /// `CUA_CONTAINER_NAME`.
    pub name: Option<String>,
    /// Base image for freshly provisioned computers.
    pub image: Option<String>,
    pub memory: Option<String>,
    pub cpu: Option<String>,
}

impl ComputerSpec {
    /// Does an existing handle satisfy this spec?
    ///
    /// `os_type` and `provider_type` must match; a requested `name` must
    /// match exactly, while an unnamed spec accepts any handle.
    pub fn accepts(&self, os_type: OsType, provider_type: &str, name: &str) -> bool {
        if self.os_type != os_type {
            return false;
        }
        if !self.provider_type.is_empty() && self.provider_type != provider_type {
            return false;
        }
        match &self.name {
            Some(wanted) => wanted == name,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of computers leased at once.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// How long `acquire` waits for a free slot before `PoolExhausted`.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Base URL of the provisioner service that opens/closes computers.
    #[serde(default = "default_provisioner_url")]
    pub provisioner_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            provisioner_url: default_provisioner_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { host: default_http_host(), port: default_http_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Multiaddr the data-channel node listens on.
    #[serde(default = "default_p2p_listen")]
    pub listen: String,
    /// Seed string for a deterministic peer identity.  A random identity is
    /// generated when unset.
    pub peer_id_seed: Option<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self { enabled: false, listen: default_p2p_listen(), peer_id_seed: None }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
