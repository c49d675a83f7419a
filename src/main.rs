use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use letterbox::config::{Config, RunType};
use letterbox::storage::DatabaseError;
use letterbox::worker::WorkerPool;
use letterbox::{http, mail, Context};

#[derive(Parser, Debug)]
#[command(
    name = "letterbox",
    about = "Turns email newsletters into Atom feeds with WebSub push"
)]
struct Args {
    /// Configuration file (optional; defaults apply when missing)
    #[arg(long, value_name = "FILE", default_value = "letterbox.toml")]
    config: PathBuf,

    /// Run only some components
    #[arg(long, value_enum)]
    run_type: Option<RunType>,

    /// HTTP listen address, overrides the config file
    #[arg(long, value_name = "ADDR")]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.apply_env().context("Invalid environment override")?;
    if let Some(run_type) = args.run_type {
        config.run_type = run_type;
    }
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    config.validate().context("Invalid configuration")?;

    let ctx = match Context::from_config(&config).await {
        Ok(ctx) => ctx,
        Err(e) if matches!(e.downcast_ref::<DatabaseError>(), Some(DatabaseError::InstanceLocked)) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => return Err(e),
    };

    let cancel = CancellationToken::new();
    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    let pool = if config.run_type.runs_workers() {
        let mut pool = WorkerPool::new(ctx.clone(), config.workers.clone(), cancel.clone());
        pool.spawn();
        Some(pool)
    } else {
        None
    };

    if config.run_type.runs_http() {
        let listener = TcpListener::bind(&config.http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", config.http_addr))?;
        let (ctx, cancel) = (ctx.clone(), cancel.clone());
        servers.push(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, ctx, cancel).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }));
    }

    if config.run_type.runs_smtp() {
        let addr = format!("0.0.0.0:{}", config.smtp_port());
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind SMTP listener on {addr}"))?;
        tracing::info!(%addr, "SMTP server listening");
        servers.push(tokio::spawn(mail::smtp::serve(
            listener,
            ctx.clone(),
            cancel.clone(),
        )));
    }

    tracing::info!(
        hostname = %config.hostname,
        run_type = ?config.run_type,
        "letterbox started"
    );

    shutdown_signal().await;
    tracing::info!("Shutting down");
    cancel.cancel();

    let timeout = config.workers.shutdown_timeout();
    if let Some(pool) = pool {
        if let Err(e) = pool.shutdown_graceful(timeout).await {
            tracing::warn!(error = %e, "Workers did not stop cleanly");
        }
    }
    for server in servers {
        if tokio::time::timeout(timeout, server).await.is_err() {
            tracing::warn!("Listener did not stop within {:?}", timeout);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
