//! Relaygate - API/XML gateway.
//!
//! Startup:
//! 1. tracing (pretty or JSON, non-blocking stdout)
//! 2. process defaults from the environment
//! 3. configuration search, load and validation (warnings are logged, never fatal)
//! 4. policy trees for every service
//! 5. axum server until Ctrl-C/SIGTERM, then a bounded drain
//! 6. policy trees released within what is left of the shutdown timeout

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relaygate_core::config::{RelaygateDefaults, find_config_file, load_and_validate};
use relaygate_proxy::cli::Cli;
use relaygate_proxy::error::{ProxyError, ProxyResult};
use relaygate_proxy::logging;
use relaygate_proxy::service::Gateway;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let guard = logging::init(cli.log_format);

    if let Err(e) = run(cli).await {
        error!(error = %e, "Relaygate stopped with an error");
        // process::exit skips destructors; flush logs first.
        drop(guard);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ProxyResult<()> {
    let defaults = RelaygateDefaults::from_env();
    defaults.validate().map_err(ProxyError::Defaults)?;

    let path = find_config_file(cli.config.as_deref())?;
    info!(path = %path.display(), "Loading configuration file");
    let (config, result) = load_and_validate(&path)?;
    for warning in &result.warnings {
        warn!(warning = %warning, "Configuration warning");
    }

    let address = cli.bind.unwrap_or_else(|| config.listen.address.clone());
    let port = cli.port.unwrap_or(config.listen.port);
    let addr = format!("{address}:{port}");

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::build(config, defaults.clone(), shutdown.clone())?);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(
        addr = %addr,
        drain_timeout_secs = defaults.drain_timeout.as_secs(),
        "Relaygate listening"
    );

    setup_signal_handlers(shutdown.clone());

    let app = gateway
        .clone()
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    let graceful = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        graceful.cancelled().await;
        info!("Shutdown signal received, stopping new connections");
    });

    let drain_timeout = defaults.drain_timeout;
    let drained = shutdown.clone();
    tokio::select! {
        result = server => result?,
        () = async move {
            drained.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            warn!(drain_timeout_secs = drain_timeout.as_secs(), "Drain timeout exceeded, abandoning in-flight exchanges");
        }
    }

    let budget = defaults.release_budget();
    if gateway.release_within(budget).await {
        info!("Relaygate stopped");
    } else {
        warn!(shutdown_timeout_secs = defaults.shutdown_timeout.as_secs(), "Shutdown timeout exceeded, exiting");
    }
    Ok(())
}

/// Cancel `shutdown` on SIGINT (Ctrl+C) or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let on_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                on_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
            }
        }
    });

    #[cfg(not(unix))]
    let _ = shutdown;
}
