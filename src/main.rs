//! Service binary: CLI parsing, wiring and lifecycle.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use icc_service::applause::Applause;
use icc_service::auth::TokenAuth;
use icc_service::backend::RedisBackend;
use icc_service::config::{self, Config};
use icc_service::datastore::HttpDatastore;
use icc_service::http::{build_router, AppState};
use icc_service::notify::Notify;
use icc_service::observability;

#[derive(Parser)]
#[command(name = "icc-service")]
#[command(about = "Inter-client communication service for meetings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the service.
    Run,

    /// Prints the environment variable documentation.
    BuildDoc,

    /// Probes a running service's health endpoint.
    Health {
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Defaults to the configured `ICC_PORT`.
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        use_https: bool,

        /// Skip TLS certificate validation.
        #[arg(long)]
        insecure: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::BuildDoc => {
            print!("{}", config::build_doc());
            Ok(())
        }
        Command::Health {
            host,
            port,
            use_https,
            insecure,
        } => health(&host, port, use_https, insecure).await,
    };

    if let Err(err) = result {
        tracing::error!(error = ?err, "service failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env().context("load config")?;
    let metrics_handle = observability::init_observability(config.development);

    let shutdown = shutdown_signal();

    let backend = Arc::new(RedisBackend::new(&config.redis_addr).context("connect redis")?);
    tokio::select! {
        _ = backend.wait() => {}
        _ = wait_for_shutdown(shutdown.clone()) => return Ok(()),
    }
    tracing::info!(addr = %config.redis_addr, "redis backend ready");

    let datastore = Arc::new(HttpDatastore::new(&config.datastore_url));
    let token_key = config.auth_token_key().context("load auth token key")?;
    let auth = Arc::new(TokenAuth::new(token_key.as_bytes()));

    let notify = Arc::new(Notify::new(backend.clone()));
    Arc::clone(&notify).start_background(shutdown.clone());

    let applause = Arc::new(Applause::new(backend, datastore));
    Arc::clone(&applause).start_background(shutdown.clone());

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    tokio::spawn(observability::serve_metrics(metrics_handle, metrics_addr));

    let state = AppState {
        notify,
        applause,
        auth,
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listen on");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
        .context("HTTP server failed")?;

    tracing::info!("service stopped");
    Ok(())
}

/// Watches for SIGINT/SIGTERM. The first signal flips the returned
/// receiver so everything drains; a second signal forces exit with code 2.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = tx.send(true);

        wait_for_signal().await;
        tracing::warn!("second signal, forcing exit");
        std::process::exit(2);
    });
    rx
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt()).expect("listen for SIGINT");
        let mut terminate = signal(SignalKind::terminate()).expect("listen for SIGTERM");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    // Already flipped or sender gone both mean "stop".
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Client side of the health endpoint, for container health checks.
async fn health(host: &str, port: Option<u16>, use_https: bool, insecure: bool) -> Result<()> {
    let port = match port {
        Some(port) => port,
        None => Config::from_env().context("load config")?.port,
    };
    let proto = if use_https { "https" } else { "http" };
    let url = format!("{proto}://{host}:{port}/system/icc/health");

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .timeout(Duration::from_secs(5))
        .build()
        .context("build http client")?;

    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("request {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("health returned status {}", response.status());
    }

    #[derive(serde::Deserialize)]
    struct Health {
        healthy: bool,
    }
    let body: Health = response.json().await.context("decode health body")?;
    if !body.healthy {
        anyhow::bail!("server returned unhealthy response");
    }
    Ok(())
}
