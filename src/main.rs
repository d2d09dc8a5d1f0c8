//! Switchboard - MCP Aggregation Gateway
//!
//! This is the main entry point for the Switchboard gateway, which
//! aggregates many MCP tool backends behind one JSON-RPC surface.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use switchboard_core::{
    aggregator::{Aggregator, AggregatorServer},
    api::{ApiServer, ApiServerConfig},
    config::HandlerKind,
    EventBus, Gateway, GatewayConfig,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchboard", version, about = "MCP aggregation gateway")]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(short, long, env = "SWITCHBOARD_CONFIG", default_value = "switchboard.json")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default)
    Serve,
    /// Run as a stdio MCP server aggregating child tool servers
    Aggregate,
    /// Print the aggregated tool catalog and exit
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the aggregate subcommand's stdout stays a
    // clean protocol channel
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Aggregate => aggregate(config).await,
        Commands::Tools => tools(config).await,
    }
}

/// Run the gateway and its HTTP endpoint until interrupted.
async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let listen_addr = config.listen_addr;
    let max_body_bytes = config.max_body_bytes;

    let gateway = Arc::new(Gateway::new(config, Arc::new(EventBus::default())));

    let report = gateway.start().await?;
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "gateway started"
    );
    for (backend, reason) in &report.failed {
        warn!(backend = %backend, reason = %reason, "backend failed to start, retry scheduled");
    }

    let server = ApiServer::new(
        ApiServerConfig {
            addr: listen_addr,
            max_body_bytes,
        },
        gateway.clone(),
    );

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("API server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    gateway.stop().await;
    Ok(())
}

/// Spawn the configured stdio backends and serve their merged tool
/// list over this process's own stdin/stdout.
async fn aggregate(config: GatewayConfig) -> anyhow::Result<()> {
    let aggregator = Arc::new(Aggregator::new());

    let (functions, servers): (Vec<_>, Vec<_>) = config
        .resolved_backends()?
        .into_iter()
        .filter(|b| b.transport == switchboard_core::TransportKind::Stdio)
        .partition(|b| b.handler == HandlerKind::SpawnedFunction);

    let mut failures = aggregator.start(servers).await;
    failures.extend(aggregator.register_functions(functions).await);
    for (backend, reason) in &failures {
        warn!(backend = %backend, reason = %reason, "aggregated backend failed to start");
    }

    AggregatorServer::new(aggregator).run().await?;
    Ok(())
}

/// Connect everything, print the catalog, tear down.
async fn tools(config: GatewayConfig) -> anyhow::Result<()> {
    let gateway = Gateway::new(config, Arc::new(EventBus::default()));
    gateway.start().await?;

    for tool in gateway.all_tools().await {
        println!("{}\t{}", tool.visible_name(), tool.tool.description);
    }

    gateway.stop().await;
    Ok(())
}
