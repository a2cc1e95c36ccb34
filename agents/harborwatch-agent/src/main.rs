//! Harborwatch Agent CLI Entry Point
//!
//! This is the main entry point for the Harborwatch agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use harborwatch_agent::agent::actions::ActionDispatcher;
use harborwatch_agent::agent::metrics::MetricsSampler;
use harborwatch_agent::agent::state::AgentStateManager;
use harborwatch_agent::agent::streams::StreamSupervisor;
use harborwatch_agent::cli::config::Config;
use harborwatch_agent::connection::enroll::{ApiClient, EnrollRequest};
use harborwatch_agent::connection::session::{
    session_url, OutboundSender, Session, OUTBOUND_QUEUE_CAPACITY,
};
use harborwatch_agent::runtime::adapter::RuntimeAdapter;
use harborwatch_agent::runtime::docker::adapter::DockerAdapter;

#[derive(Parser)]
#[command(name = "harborwatch-agent")]
#[command(author, version, about = "Harborwatch Agent - host-resident container monitoring")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/agent.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enrollment token, overrides the config file
    #[arg(long, env = "AGENT_TOKEN")]
    enroll_token: Option<String>,

    /// Control plane base URL, overrides the config file
    #[arg(long, env = "AGENT_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show agent status
    Status,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Start { foreground } => {
            start_agent(&cli, *foreground).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn start_agent(cli: &Cli, foreground: bool) -> Result<()> {
    info!("Starting Harborwatch agent...");

    // Load configuration, CLI flags win over the file
    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(url) = &cli.api_url {
        config.control_plane.api_url = url.clone();
    }
    if let Some(token) = &cli.enroll_token {
        config.control_plane.enroll_token = Some(token.clone());
    }
    info!(api_url = %config.control_plane.api_url, "Configuration loaded");

    if !foreground {
        info!("Running in foreground mode (daemon mode not yet implemented)");
    }

    // Initialize Docker adapter
    let docker = DockerAdapter::with_socket(&config.runtime.docker_socket)
        .context("Failed to initialize Docker adapter")?;

    // Verify Docker is accessible
    let docker_version = docker
        .version()
        .await
        .context("Failed to get Docker version")?;
    info!(docker_version = %docker_version, "Docker runtime initialized");

    let runtime = Arc::new(docker);

    // Enroll with the control plane
    let enroll_token = config
        .control_plane
        .enroll_token
        .clone()
        .context("No enrollment token configured (set --enroll-token or AGENT_TOKEN)")?;
    let host_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let api = Arc::new(ApiClient::new(&config.control_plane.api_url)?);
    let enrolled = api
        .enroll(&EnrollRequest {
            token: enroll_token,
            name: host_name.clone(),
            hostname: host_name,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            docker_version,
        })
        .await
        .context("Failed to enroll with control plane")?;

    let state_manager = AgentStateManager::new();
    info!(state = ?state_manager.current_state(), "Agent state initialized");

    // Outbound queue shared by every producer
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let outbound = OutboundSender::new(outbound_tx);

    let dispatcher = Arc::new(ActionDispatcher::new(Arc::clone(&runtime), outbound.clone()));
    let supervisor = Arc::new(StreamSupervisor::new(
        Arc::clone(&runtime),
        outbound.clone(),
        enrolled.host_id.clone(),
    ));
    let sampler = MetricsSampler::new(
        Arc::clone(&runtime),
        outbound,
        state_manager.clone(),
        enrolled.host_id.clone(),
    );

    // Heartbeat loop
    {
        let api = Arc::clone(&api);
        let interval = Duration::from_secs(config.control_plane.heartbeat_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = api.heartbeat().await {
                    warn!(error = %format!("{e:#}"), "heartbeat failed");
                }
            }
        });
    }

    // Inventory sync and log stream reconciliation loop
    {
        let api = Arc::clone(&api);
        let runtime = Arc::clone(&runtime);
        let supervisor = Arc::clone(&supervisor);
        let interval = Duration::from_secs(config.control_plane.sync_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match runtime.list_containers(true).await {
                    Ok(containers) => {
                        if let Err(e) = api.sync_containers(&containers).await {
                            warn!(error = %format!("{e:#}"), "container sync failed");
                        }
                        supervisor.reconcile(&containers);
                        debug!(streams = supervisor.active_count(), "log streams reconciled");
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "failed to list containers for sync");
                    }
                }
            }
        });
    }

    // Metrics sampling loop
    if config.telemetry.enabled {
        let interval = Duration::from_secs(config.telemetry.metrics_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sampler.tick().await;
            }
        });
    } else {
        info!("Telemetry disabled, metrics sampling not started");
    }

    // Run the control channel until shutdown
    let url = session_url(
        &config.control_plane.api_url,
        api.token().as_deref().unwrap_or_default(),
    );
    let shutdown_state = state_manager.clone();
    let mut session = Session::new(
        url,
        config.control_plane.reconnect_interval_ms,
        dispatcher,
        state_manager,
        outbound_rx,
    );

    tokio::select! {
        result = session.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            shutdown_state.set_shutting_down();
            info!("Shutdown signal received, exiting");
        }
    }

    Ok(())
}

async fn show_status() -> Result<()> {
    println!("Agent Status: checking...");

    // Check Docker connectivity
    match DockerAdapter::new() {
        Ok(docker) => {
            match docker.version().await {
                Ok(version) => println!("  Docker: {} (connected)", version),
                Err(e) => println!("  Docker: error - {}", e),
            }

            // Get container count
            match docker.list_containers(false).await {
                Ok(containers) => println!("  Running containers: {}", containers.len()),
                Err(_) => println!("  Running containers: unknown"),
            }
        }
        Err(e) => println!("  Docker: not available - {}", e),
    }

    println!("  Control Plane: Not connected (check agent process)");
    Ok(())
}

fn show_version() {
    println!("harborwatch-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Host-resident agent for Harborwatch container monitoring");
    println!();
    println!("Features:");
    println!("  - Docker container monitoring and lifecycle actions");
    println!("  - WebSocket control plane session");
    println!("  - Batched log streaming with backpressure");
    println!("  - Per-container metrics sampling");
}
