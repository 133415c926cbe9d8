//! Switchboard binary: load config, assemble the proxy, serve until a
//! shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use switchboard::pipeline::Proxy;
use switchboard::server;
use switchboard::Config;

#[derive(Debug, Parser)]
#[command(name = "switchboard", version, about = "Reverse proxy for LLM providers")]
struct Cli {
    /// Path to the configuration file (JSON with comments).
    #[arg(short, long, default_value = "switchboard.json5", env = "SWITCHBOARD_CONFIG")]
    config: PathBuf,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. `info` or `switchboard=debug,info`.
    #[arg(long, default_value = "info", env = "SWITCHBOARD_LOG")]
    log: String,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let grace = config.server.shutdown_grace();
    let proxy = Proxy::new(config).await.context("assembling proxy")?;
    proxy.start();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let stop = tokio_util::sync::CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
        });
    }

    // The server drains in-flight requests after the signal; the grace
    // period bounds that drain, not normal operation.
    let drain_deadline = {
        let stop = stop.clone();
        async move {
            stop.cancelled().await;
            tokio::time::sleep(grace).await;
        }
    };
    let serve = server::serve(Arc::clone(&proxy), listener, {
        let stop = stop.clone();
        async move { stop.cancelled().await }
    });

    tokio::select! {
        result = serve => result.context("server error")?,
        _ = drain_deadline => {
            tracing::warn!("drain exceeded shutdown grace, exiting");
            proxy.shutdown().await;
        }
    }
    Ok(())
}
