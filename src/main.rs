use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use agent_hub::api::{self, AppState};
use agent_hub::bus::EventBus;
use agent_hub::db;
use agent_hub::hooks::HookServer;
use agent_hub::registry::AgentRegistry;
use agent_hub::ws::UiNotifier;

const DEFAULT_PORT: u16 = 4789;
/// Origin of the desktop front-end's dev server.
const UI_ORIGIN: &str = "http://localhost:1420";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_hub=info,tower_http=info".into()),
        )
        .init();

    // Resolve DB location: env override, else ~/.agent-hub/agents.db.
    let db_path = match std::env::var("AGENT_HUB_DB") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => {
            let home = dirs::home_dir().context("could not determine home directory")?;
            let db_dir = home.join(".agent-hub");
            std::fs::create_dir_all(&db_dir)
                .with_context(|| format!("failed to create {}", db_dir.display()))?;
            db_dir.join("agents.db")
        }
    };
    let db_url = format!("sqlite:{}", db_path.display());

    info!("Using database at {}", db_path.display());

    let connect_opts = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_opts)
        .await
        .context("failed to open SQLite database")?;

    db::init_db(&pool).await.context("failed to run schema migrations")?;

    let bus = EventBus::new();
    let notifier = UiNotifier::new();

    let hooks = Arc::new(HookServer::new(pool.clone(), bus.clone(), notifier.clone()));
    hooks.install_default_handlers();

    let registry = AgentRegistry::new(pool, Some(bus), notifier.clone());
    registry.init().await.context("failed to initialize agent registry")?;

    let state = AppState {
        registry: registry.clone(),
        hooks,
        notifier,
    };

    // Hook callers are local processes; the browser-facing surface is the
    // desktop front-end only.
    let cors = CorsLayer::new()
        .allow_origin(UI_ORIGIN.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let app = api::router(state).layer(cors);

    let port = std::env::var("AGENT_HUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind to port {port}"))?;

    info!("agent-hub listening on http://127.0.0.1:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(registry: Arc<AgentRegistry>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    registry.shutdown();
}
