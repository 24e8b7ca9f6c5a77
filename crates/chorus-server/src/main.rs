use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chorus_core::{events::EventBus, AppConfig, AppState};
use chorus_voice::VoiceService;

mod config;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "chorus-server", about = "Chorus voice control-plane server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP bind address, overrides config
    #[arg(long)]
    bind_addr: Option<String>,

    /// Database URL, overrides config
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }

    info!("chorus-server starting...");

    let db = chorus_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("failed to connect to {}", config.database_url))?;
    chorus_db::run_migrations(&db, &config.database_url).await?;

    let voice = Arc::new(VoiceService::new(db.clone(), config.voice_settings()?));
    let health_task =
        chorus_voice::health::start_health_checker(voice.clone(), config.health_check_interval());

    let shutdown = Arc::new(Notify::new());
    let state = AppState {
        db,
        event_bus: EventBus::default(),
        voice,
        config: AppConfig {
            jwt_secret: config.jwt_secret.clone(),
            jwt_expiry_seconds: config.jwt_expiry_seconds,
            voice_token_secret: config.voice_token_secret.clone(),
            database_url: config.database_url.clone(),
        },
        shutdown: shutdown.clone(),
    };

    // Control-plane RPCs have a bounded deadline.
    let app = chorus_api::build_router()
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(10)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("control plane listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.notify_waiters();
        })
        .await?;

    health_task.abort();
    info!("chorus-server stopped");
    Ok(())
}
