use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vibe_migrate::{config::Config, server::run_server};

#[derive(Parser)]
#[command(name = "vibe-migrate")]
#[command(about = "Runs AI agent migration sessions against a git repository")]
struct Args {
    /// Configuration file (defaults to ~/.vibe-migrate/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long)]
    database_path: Option<String>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Repository the agent works in
    #[arg(long)]
    repo_path: Option<PathBuf>,

    /// Backend checkout providing docs/API.md
    #[arg(long)]
    backend_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing with both console and file logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let logs_dir = std::path::Path::new(".vibe-migrate/logs");
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(database_path) = args.database_path {
        config.database.path = database_path;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(repo_path) = args.repo_path {
        config.repository.path = repo_path;
    }
    if let Some(backend_path) = args.backend_path {
        config.repository.backend_path = Some(backend_path);
    }

    info!("Starting Vibe Migrate server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database.path);
    info!("Repository: {}", config.repository.path.display());
    info!("Server: {}", config.server_address());

    run_server(config).await?;

    Ok(())
}
