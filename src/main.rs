use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use restaurant_intel::application::{UsageTracker, UsageTrackerConfig};
use restaurant_intel::infrastructure::{
    logging::init_logging, AppConfig, InMemoryUsageStore, JwtAuthenticator, PostgresUsageStore,
    RateLimitSweeper, RateLimiter, UsageStore,
};
use restaurant_intel::web::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;
    let _log_guards = init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting restaurant intelligence API");

    let store = build_usage_store(&config).await?;
    let usage_tracker = Arc::new(UsageTracker::new(
        store,
        UsageTrackerConfig {
            billing_offset: config.billing_offset,
            store_timeout: config.usage_store_timeout,
        },
    ));

    let rate_limiter = RateLimiter::default();
    let sweeper = RateLimitSweeper::new(rate_limiter.clone(), config.rate_limit_cleanup_interval);
    sweeper.start().await;

    if config.jwt_secret == AppConfig::default().jwt_secret {
        warn!("JWT_SECRET is not set, using the development secret");
    }
    let authenticator = Arc::new(JwtAuthenticator::new(config.jwt_secret.as_bytes()));

    let app = create_router(AppState {
        rate_limiter,
        usage_tracker,
        authenticator,
    });

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop().await;
    info!("Server stopped");
    Ok(())
}

async fn build_usage_store(config: &AppConfig) -> anyhow::Result<Arc<dyn UsageStore>> {
    match &config.database.url {
        Some(url) => {
            // Connections are opened on first use so an unreachable
            // database only degrades metering.
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .acquire_timeout(config.database.acquire_timeout)
                .connect_lazy(url)
                .context("Invalid DATABASE_URL")?;
            let store = PostgresUsageStore::new(pool);
            match store.ensure_schema().await {
                Ok(()) => info!("Usage records stored in PostgreSQL"),
                Err(e) => warn!(error = %e, "Usage database unavailable, usage tracking is degraded"),
            }
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL is not set, usage records are kept in memory");
            Ok(Arc::new(InMemoryUsageStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
