//! unimcp: a universal aggregating proxy for the Model Context Protocol.

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unimcp_config::{PidFile, PidRecord};
use unimcp_server::runtime::spawn_config_watcher;
use unimcp_server::{Runtime, RuntimeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InboundKind {
    /// Serve a single session over stdin/stdout.
    Stdio,
    /// Serve streamable HTTP (plus the legacy SSE shim) on host:port.
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "unimcp", version, about = "Aggregate many MCP servers behind one endpoint")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, env = "UNIMCP_CONFIG", default_value = "mcp.json")]
    config: PathBuf,

    /// Inbound transport.
    #[arg(short, long, value_enum, default_value_t = InboundKind::Http)]
    transport: InboundKind,

    /// Bind host for HTTP transports.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port for HTTP transports.
    #[arg(short, long, default_value_t = 3050)]
    port: u16,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, env = "UNIMCP_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // On stdio the protocol owns stdout; logs go to stderr regardless.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = Runtime::bootstrap(RuntimeOptions::new(&args.config))
        .await
        .with_context(|| format!("failed to start from {}", args.config.display()))?;

    let _watcher = spawn_config_watcher(&runtime)
        .map_err(|e| tracing::warn!(error = %e, "config watching disabled"))
        .ok();

    match args.transport {
        InboundKind::Stdio => {
            unimcp_server::stdio::run(Arc::clone(&runtime)).await?;
            runtime.shutdown().await;
        }
        InboundKind::Http => {
            let addr: SocketAddr = format!("{}:{}", args.host, args.port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;

            let pid_file = PidFile::write(
                &runtime.config_dir,
                &PidRecord {
                    pid: std::process::id(),
                    url: format!("http://{addr}/mcp"),
                    port: addr.port(),
                    host: args.host.clone(),
                    transport: "streamable-http".to_string(),
                    started_at: chrono::Utc::now(),
                    config_dir: runtime.config_dir.clone(),
                },
            )?;

            let app = unimcp_server::http::router(Arc::clone(&runtime));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(%addr, "listening");

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;

            runtime.shutdown().await;
            drop(pid_file);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
