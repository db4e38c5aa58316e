// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Which proxy surfaces `pilot serve` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ServeMode {
    /// HTTP only (`POST /responses`, `GET /health`).
    #[default]
    Http,
    /// libp2p data channel only.
    P2p,
    /// Both surfaces over the same session manager.
    Both,
}

#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    about = "An LLM-driven computer-use agent orchestrator",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy: sessions, computer pool, HTTP and/or P2P surface.
    Serve {
        /// Which surfaces to expose.
        #[arg(long, value_enum, default_value = "http")]
        mode: ServeMode,
        /// HTTP bind host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// HTTP bind port (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Seed for a stable P2P peer identity.
        #[arg(long)]
        peer_id: Option<String>,
        /// Maximum concurrently leased computers (overrides config).
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Execute one run against a pre-provisioned computer and exit.
    Run {
        /// Model string, e.g. "anthropic/claude-sonnet-4-5" or a
        /// composite "openai/gpt-5.2+omniparser".
        #[arg(long, short = 'M', env = "CUA_MODEL_NAME")]
        model: Option<String>,
        /// The natural-language task.
        #[arg(long, short = 't')]
        task: String,
        /// Session id recorded in the trajectory directory name.
        #[arg(long)]
        session_id: Option<String>,
        /// Capture the trajectory under this directory.
        #[arg(long, value_name = "DIR")]
        save_trajectory: Option<PathBuf>,
        /// RPC endpoint of the pre-provisioned computer.  Defaults to the
        /// configured computer name treated as a host.
        #[arg(long, env = "CUA_COMPUTER_URL")]
        computer_url: Option<String>,
    },

    /// List all supported model providers.
    ListProviders {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration and exit
    ShowConfig,
}
