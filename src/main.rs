mod api;
mod checker;
mod config;
mod error;
mod market;
mod notify;
mod store;
mod strategy;
mod sweeper;
mod types;

use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::api::stats::CycleStats;
use crate::checker::{AlertChecker, CheckerSettings};
use crate::config::Config;
use crate::error::Result;
use crate::market::{HttpMarketClient, MarketQuery};
use crate::notify::{DiscordNotifier, Notifier};
use crate::store::AlertStore;
use crate::sweeper::ExpirySweeper;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let options = SqliteConnectOptions::new()
        .filename(&cfg.db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let store = AlertStore::new(pool);
    info!(alerts = store.count().await?, "Alert store loaded");

    if cfg.discord_token.is_empty() {
        warn!("DISCORD_TOKEN not set — notification delivery will fail until it is configured.");
    }

    // --- Collaborators ---
    let market: Arc<dyn MarketQuery> =
        Arc::new(HttpMarketClient::new(cfg.market_api_url.clone())?);
    let notifier: Arc<dyn Notifier> = Arc::new(DiscordNotifier::new(cfg.discord_token.clone())?);
    let stats = Arc::new(CycleStats::new());

    // --- Alert checker (recurring poll cycles) ---
    let checker = AlertChecker::new(
        store.clone(),
        market,
        notifier,
        Arc::clone(&stats),
        CheckerSettings::from_config(&cfg),
    );
    checker.start(&cfg);

    // --- Expiry sweeper (background, every 6h) ---
    let sweeper = ExpirySweeper::new(store.clone());
    tokio::spawn(async move { sweeper.run().await });

    // --- HTTP API server ---
    let api_state = ApiState {
        store,
        checker: Arc::clone(&checker),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
