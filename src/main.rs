//! MCPHawk -- passive capture and observability tool for the Model Context
//! Protocol.

use anyhow::Result;
use mcphawk::api::{self, ApiState};
use mcphawk::broadcast::BroadcastHub;
use mcphawk::capture::{CaptureConfig, CaptureEngine, CaptureTarget};
use mcphawk::cli::{Cli, Commands};
use mcphawk::config::{Config, McpTransportKind};
use mcphawk::mcp::server::QueryServer;
use mcphawk::store::MessageStore;
use mcphawk::wrapper::StdioWrapper;
use std::collections::HashSet;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <Cli as clap::Parser>::parse();
    init_tracing(cli.debug);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        mcphawk::wrapper::request_shutdown();
        let _ = shutdown_tx.send(());
    });

    let exit_code = match cli.command.clone() {
        Commands::Sniff { port, filter, auto_detect, with_mcp, mcp_transport, mcp_port } => {
            run_sniff(&config, port, filter, auto_detect, with_mcp, &mcp_transport, mcp_port, shutdown_rx).await
        }
        Commands::Web { port, filter, auto_detect, no_sniffer, host, web_port } => {
            run_web(&config, port, filter, auto_detect, no_sniffer, host, web_port, shutdown_rx).await
        }
        Commands::Mcp { transport, mcp_port } => run_mcp(&config, &transport, mcp_port).await,
        Commands::Wrap { command } => run_wrap(&config, command, shutdown_rx).await,
    };

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "mcphawk exited with an error");
            std::process::exit(1);
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<MessageStore>> {
    let store = match &config.storage.db_path {
        Some(path) => MessageStore::open(path.as_str())?,
        None => MessageStore::open_default()?,
    };
    Ok(Arc::new(store))
}

fn capture_target(
    port: Option<u16>,
    filter: Option<String>,
    auto_detect: bool,
) -> Result<CaptureTarget> {
    match (port, filter, auto_detect) {
        (Some(p), None, false) => Ok(CaptureTarget::Port(p)),
        (None, Some(f), false) => Ok(CaptureTarget::Filter(f)),
        (None, None, true) => Ok(CaptureTarget::AutoDetect),
        (None, None, false) => Ok(CaptureTarget::AutoDetect),
        _ => anyhow::bail!("--port, --filter, and --auto-detect are mutually exclusive"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sniff(
    config: &Config,
    port: Option<u16>,
    filter: Option<String>,
    auto_detect: bool,
    with_mcp: bool,
    mcp_transport: &str,
    mcp_port: Option<u16>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<i32> {
    let target = capture_target(port, filter, auto_detect)?;
    let store = open_store(config)?;
    let hub = BroadcastHub::new();

    if with_mcp {
        let transport = mcphawk::cli::Commands::parse_transport(mcp_transport)?;
        let mcp_store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = run_mcp_server(mcp_store, transport, mcp_port.unwrap_or(8765)).await {
                tracing::error!(error = %e, "co-hosted query server exited");
            }
        });
    }

    let capture_config = CaptureConfig {
        target,
        excluded_ports: config.capture.excluded_ports.iter().copied().collect::<HashSet<_>>(),
        device: config.capture.device.clone(),
    };
    let engine = CaptureEngine::new(capture_config, store, hub);
    engine.run(shutdown_rx).await?;
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
async fn run_web(
    config: &Config,
    port: Option<u16>,
    filter: Option<String>,
    auto_detect: bool,
    no_sniffer: bool,
    host: String,
    web_port: u16,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<i32> {
    let store = open_store(config)?;
    let hub = BroadcastHub::new();

    if !no_sniffer {
        let target = capture_target(port, filter, auto_detect)?;
        let capture_config = CaptureConfig {
            target,
            excluded_ports: config.capture.excluded_ports.iter().copied().collect::<HashSet<_>>(),
            device: config.capture.device.clone(),
        };
        let engine = CaptureEngine::new(capture_config, store.clone(), hub.clone());
        tokio::spawn(async move {
            if let Err(e) = engine.run(shutdown_rx).await {
                tracing::error!(error = %e, "capture engine exited");
            }
        });
    }

    let state = ApiState { store, hub, with_mcp: false };
    let router = api::router(state);
    let addr: std::net::SocketAddr = format!("{host}:{web_port}").parse()?;
    tracing::info!(%addr, "serving dashboard");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(0)
}

async fn run_mcp(config: &Config, transport: &str, mcp_port: Option<u16>) -> Result<i32> {
    let store = open_store(config)?;
    let transport = mcphawk::cli::Commands::parse_transport(transport)?;
    let port = mcp_port.unwrap_or(config.mcp.port);
    run_mcp_server(store, transport, port).await?;
    Ok(0)
}

async fn run_mcp_server(
    store: Arc<MessageStore>,
    transport: McpTransportKind,
    port: u16,
) -> Result<()> {
    let server = QueryServer::new(store);
    match transport {
        McpTransportKind::Stdio => server.run_stdio().await,
        McpTransportKind::Http => {
            let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse()?;
            server.run_http(addr).await
        }
    }
}

async fn run_wrap(
    config: &Config,
    command: Vec<String>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("wrap requires a command to run");
    };
    let store = open_store(config)?;
    let hub = BroadcastHub::new();
    let wrapper = StdioWrapper::new(store, hub, command.join(" "));
    let code = wrapper.run(program, args, shutdown_rx).await?;
    Ok(code)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "mcphawk=debug" } else { "mcphawk=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
