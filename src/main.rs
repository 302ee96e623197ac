use std::{sync::Arc, time::Duration};

mod app;
mod auth;
mod config;
mod db;
mod mail;
mod session;
mod state;
mod storage;

use crate::{config::AppConfig, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "linkshare=debug,tower_sessions=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env()?);
    let pool = db::connect(&config.database_url).await?;

    db::migrate(&pool).await?;

    let state = AppState::init(config.clone(), pool)?;
    storage::spawn_expiry_sweeper(
        state.kv.clone(),
        Duration::from_secs(config.kv_sweep_interval_secs),
    );

    let app = app::build_app(state)?;
    app::serve(app).await
}
