//! Watchtower - synthetic uptime monitoring service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchtower::config::Config;
use watchtower::db::Store;
use watchtower::engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watchtower=info".parse()?),
        )
        .init();

    // Load configuration; a missing DATABASE_URL is fatal here.
    let cfg = Config::load()?;
    tracing::info!("Starting Watchtower...");

    // Initialize database
    let store = Store::connect(&cfg.database_url).await?;
    tracing::info!("Database initialized successfully");

    // Start the engine: probe loops, retention timer, bus sweeper.
    let engine = Arc::new(Engine::new(store, &cfg));
    engine.run().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    engine.shutdown().await;

    Ok(())
}
