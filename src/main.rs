// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, ServeMode};
use pilot_callbacks::{BudgetCap, CallbackPipeline, PiiScrubber, TrajectoryWriter};
use pilot_computer::HttpComputer;
use pilot_config::Config;
use pilot_core::{Orchestrator, RunConfig, RunRequest, RunStatus, TaskInput};
use pilot_gateway::{http, p2p::P2pNode, Dispatcher};
use pilot_model::LoopOptions;
use pilot_session::{ComputerPool, HttpProvisioner, SessionManager};

// Exit codes: 0 success, 2 usage (clap), 3 configuration, 4 runtime,
// 130 interrupted.
const EXIT_CONFIG: i32 = 3;
const EXIT_RUNTIME: i32 = 4;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("error: {e:#}");
            EXIT_RUNTIME
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PILOT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run_command(cli: Cli) -> anyhow::Result<i32> {
    if let Commands::ListProviders { json } = &cli.command {
        return list_providers(*json);
    }

    let config = match pilot_config::load(cli.config.as_deref()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return Ok(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Serve { mode, host, port, peer_id, pool_size } => {
            serve(config, mode, host, port, peer_id, pool_size).await
        }
        Commands::Run { model, task, session_id, save_trajectory, computer_url } => {
            run_once(config, model, task, session_id, save_trajectory, computer_url).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(config.as_ref())?);
            Ok(0)
        }
        Commands::ListProviders { .. } => unreachable!("handled above"),
    }
}

fn list_providers(json: bool) -> anyhow::Result<i32> {
    let drivers = pilot_model::list_drivers();
    if json {
        let entries: Vec<serde_json::Value> = drivers
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "description": d.description,
                    "api_key_env": d.default_api_key_env,
                    "grounder_only": d.grounder_only,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for d in drivers {
            let key = d.default_api_key_env.unwrap_or("-");
            println!("{:<20} {:<24} key: {:<20} {}", d.id, d.name, key, d.description);
        }
    }
    Ok(0)
}

// ── serve ─────────────────────────────────────────────────────────────────────

async fn serve(
    config: Arc<Config>,
    mode: ServeMode,
    host: Option<String>,
    port: Option<u16>,
    peer_id: Option<String>,
    pool_size: Option<usize>,
) -> anyhow::Result<i32> {
    let provisioner = Arc::new(HttpProvisioner::new(config.pool.provisioner_url.clone()));
    let pool = Arc::new(ComputerPool::new(
        provisioner,
        pool_size.unwrap_or(config.pool.size),
        Duration::from_secs(config.pool.acquire_timeout_secs),
    ));
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&pool),
        Duration::from_secs(config.agent.session_idle_timeout_secs),
        Duration::from_secs(config.agent.shutdown_deadline_secs),
    ));
    let sweeper = manager.start_sweeper();
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&manager), Arc::clone(&config)));

    let shutdown = CancellationToken::new();
    let mut servers = Vec::new();

    if matches!(mode, ServeMode::Http | ServeMode::Both) {
        let host = host.unwrap_or_else(|| config.http.host.clone());
        let port = port.unwrap_or(config.http.port);
        let api_key = std::env::var("CUA_API_KEY").ok().filter(|k| !k.is_empty());
        let dispatcher = Arc::clone(&dispatcher);
        let token = shutdown.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = http::serve(&host, port, dispatcher, api_key, token).await {
                error!(error = %e, "http server failed");
            }
        }));
    }

    if matches!(mode, ServeMode::P2p | ServeMode::Both) {
        let node = P2pNode::new(
            &config.p2p.listen,
            peer_id.as_deref().or(config.p2p.peer_id_seed.as_deref()),
            Arc::clone(&dispatcher),
        )?;
        info!(peer_id = %node.local_peer_id(), "p2p identity");
        let token = shutdown.clone();
        servers.push(tokio::spawn(node.run(token)));
    }

    // Block until ctrl-c / SIGTERM, then drain.
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    shutdown.cancel();
    manager.shutdown().await;
    sweeper.abort();
    for server in servers {
        let _ = server.await;
    }
    Ok(EXIT_INTERRUPTED)
}

// ── run ───────────────────────────────────────────────────────────────────────

async fn run_once(
    config: Arc<Config>,
    model: Option<String>,
    task: String,
    session_id: Option<String>,
    save_trajectory: Option<PathBuf>,
    computer_url: Option<String>,
) -> anyhow::Result<i32> {
    let model = model.unwrap_or_else(|| config.model.clone());
    let agent = match pilot_model::resolve(&model, LoopOptions::default()) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(EXIT_CONFIG);
        }
    };

    let url = match computer_url.or_else(|| {
        config
            .computer
            .name
            .as_ref()
            .map(|name| format!("http://{name}:8000"))
    }) {
        Some(url) => url,
        None => {
            eprintln!(
                "configuration error: no computer endpoint; pass --computer-url or set \
                 CUA_CONTAINER_NAME"
            );
            return Ok(EXIT_CONFIG);
        }
    };
    let computer = match HttpComputer::connect(&url).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: cannot reach computer at {url}: {e}");
            return Ok(EXIT_CONFIG);
        }
    };

    let mut pipeline = CallbackPipeline::new().with(Arc::new(PiiScrubber::new()));
    if let Some(budget) = config.agent.max_trajectory_budget {
        pipeline = pipeline.with(Arc::new(BudgetCap::new(budget)));
    }
    if let Some(dir) = save_trajectory.or_else(|| config.agent.save_trajectory_dir.clone()) {
        pipeline =
            pipeline.with(Arc::new(TrajectoryWriter::new(dir).with_scrubber(PiiScrubber::new())));
    }

    let orchestrator =
        Orchestrator::new(RunConfig::from(&config.agent)).with_pipeline(pipeline);

    // Ctrl-c cancels the run cooperatively.
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let env = pilot_config::EnvSnapshot::process();
    let outcome = orchestrator
        .run(RunRequest {
            task: TaskInput::Text(task),
            agent: agent.as_ref(),
            computer: &computer,
            env: &env,
            session_id: session_id.unwrap_or_else(|| "cli".into()),
            cancel,
        })
        .await;

    if let Some(text) = outcome.output.iter().rev().find_map(|m| m.assistant_text()) {
        println!("{text}");
    }
    eprintln!(
        "status: {}  messages: {}  tokens: {}  cost: ${:.4}",
        outcome.status,
        outcome.output.len(),
        outcome.usage.total_tokens,
        outcome.usage.response_cost,
    );

    Ok(match outcome.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => EXIT_INTERRUPTED,
        RunStatus::Failed => EXIT_RUNTIME,
    })
}
