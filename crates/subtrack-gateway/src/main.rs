use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use clap::Parser;
use subtrack_core::config::{AuthMode, SubtrackConfig};
use subtrack_scheduler::SystemClock;
use tracing::info;

mod app;
mod auth;
mod cli;
mod http;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "subtrack_gateway=info,subtrack_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > SUBTRACK_CONFIG env > ~/.subtrack/subtrack.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("SUBTRACK_CONFIG").ok());
    let config = SubtrackConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        SubtrackConfig::default()
    });

    // single SQLite file shared by every subsystem
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    app::init_schema(&db)?;
    info!("database migrations complete");

    let stack = app::assemble(config, Arc::new(Mutex::new(db)), Arc::new(SystemClock))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(stack).await,
        Command::Users(cmd) => cli::run_users(&stack.state, cmd),
        Command::Subscriptions(cmd) => cli::run_subscriptions(&stack.state, cmd).await,
        Command::Workflows(cmd) => cli::run_workflows(&stack.state, cmd),
    }
}

async fn serve(stack: app::Stack) -> anyhow::Result<()> {
    let app::Stack { state, engine } = stack;
    let addr: SocketAddr =
        format!("{}:{}", state.config.gateway.bind, state.config.gateway.port).parse()?;
    let auth = &state.config.gateway.auth;
    if auth.mode == AuthMode::Token && auth.token.as_deref().unwrap_or("").is_empty() {
        tracing::warn!("gateway.auth.token is not set; the admin API will reject every request");
    }
    let router = app::build_router(state);

    // scheduler engine loop in background
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    info!("subtrack gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // signal scheduler to stop
    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
