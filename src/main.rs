//! qgw CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use qgw::config::{GatewayConfig, MonitoringConfig};
use qgw::runtime::{Gateway, SHUTDOWN_BUDGET};

/// Q-SYS Control Gateway
#[derive(Parser, Debug)]
#[command(name = "qgw", version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "qgw.toml")]
    config: PathBuf,

    /// Core hostname (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    // A panicking background task must not take the process down.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "Panic caught; continuing");
    }));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(config))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    // LOG_LEVEL wins; --verbose bumps the default.
    let default_level = if verbose { "debug" } else { "info" };
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> qgw::Result<GatewayConfig> {
    let mut config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .map_err(|e| qgw::QsysError::validation(format!("read config: {e}")))?;
        GatewayConfig::from_toml(&text)?
    } else {
        tracing::warn!(path = %args.config.display(), "Config file not found, using defaults");
        GatewayConfig::default()
    };

    if let Some(host) = &args.host {
        config.connection.host = host.clone();
    }
    if config.tool_timeout_ms == 0 {
        config.tool_timeout_ms = 30_000;
    }
    // Environment always wins for the recorder section.
    config.monitoring = MonitoringConfig::from_env();
    Ok(config)
}

async fn run(config: GatewayConfig) -> ExitCode {
    let gateway = match Gateway::new(config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            tracing::error!(error = %e, "Failed to assemble gateway");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.start().await {
        // Auto-reconnect may still bring the link up; keep serving.
        tracing::warn!(error = %e, "Initial connection failed");
    }

    tracing::info!(tools = gateway.tool_names().len(), "Gateway running");
    wait_for_signal().await;

    // Keep logging repeated signals while the shutdown runs.
    let shutting_down = Arc::new(AtomicBool::new(true));
    tokio::spawn({
        let shutting_down = Arc::clone(&shutting_down);
        async move {
            loop {
                wait_for_signal().await;
                if shutting_down.load(Ordering::Relaxed) {
                    tracing::warn!("Already shutting down");
                }
            }
        }
    });

    match tokio::time::timeout(SHUTDOWN_BUDGET, gateway.shutdown()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => {
            tracing::error!(
                budget_secs = SHUTDOWN_BUDGET.as_secs(),
                "Shutdown exceeded its budget, exiting hard"
            );
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
    }
}
