//! Credit Ledger Service - HTTP API for credit balances and plan grants
//!
//! This is the main entry point for the credit-ledger service.

use std::error::Error;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credit_ledger_core::PlanCatalog;
use credit_ledger_service::{create_router, AppState, ConfigError, ServiceConfig, StoreBackend};
use credit_ledger_store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,credit_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Credit Ledger Service");

    let config = ServiceConfig::from_env()?;
    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_backend = ?config.store_backend,
        grant_period = config.grant_period.as_str(),
        store_timeout_ms = config.store_timeout_ms,
        webhook_verification = config.webhook_secret.is_some(),
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;
    let catalog = load_catalog(&config).await?;

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(store, config);

    if state.ledger.seed_catalog(&catalog).await? {
        tracing::info!(
            plans = catalog.plans.len(),
            version = catalog.version,
            "Plan catalog seeded"
        );
    } else {
        tracing::debug!("Plan catalog already present, not seeding");
    }

    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - balances are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            tracing::info!("Connecting to PostgreSQL");
            let store = PgStore::connect(url, config.store_timeout()).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Rocksdb => open_rocks(config),
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_rocks(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(credit_ledger_store::RocksStore::open(
        &config.data_dir,
    )?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_rocks(_config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn Error>> {
    Err(Box::new(ConfigError::Invalid {
        key: "STORE_BACKEND",
        message: "built without the rocksdb-backend feature".into(),
    }))
}

/// The catalog to seed an empty store with: the configured file, or the
/// built-in default plans.
async fn load_catalog(config: &ServiceConfig) -> Result<PlanCatalog, Box<dyn Error>> {
    let Some(path) = &config.plan_catalog_path else {
        return Ok(PlanCatalog::default());
    };

    tracing::info!(path = %path, "Loading plan catalog");
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(PlanCatalog::from_json(&contents)?)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
