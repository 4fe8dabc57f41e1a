//! Paygate API Server
//!
//! Centralized billing and entitlements service: ingests provider webhooks,
//! maintains subscription/purchase mirrors, recomputes per-user
//! entitlements, and serves them under a TTL cache. The reconciliation
//! scheduler runs in-process, gated by configuration and a best-effort
//! leader lease.

mod auth;
mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use time::{Duration, OffsetDateTime};
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use paygate_billing::{store, LEASE_NAME};
use paygate_shared::{create_pool, PoolSettings};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,paygate_api=debug,paygate_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Paygate API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(
        &config.database_url,
        &PoolSettings {
            max_connections: config.db_max_connections,
            ..PoolSettings::default()
        },
    )
    .await?;
    tracing::info!("Database connection established");

    let reconciliation_enabled = config.reconciliation_enabled;
    let reconciliation_hour = config.reconciliation_hour_utc;
    let state = AppState::new(pool, config)?;

    // Scheduled reconciliation, one replica per tick via the shared lease.
    let mut scheduler = JobScheduler::new().await?;
    if reconciliation_enabled {
        let job_state = state.clone();
        let replica_id = Uuid::new_v4().to_string();
        let cron = format!("0 0 {reconciliation_hour} * * *");

        scheduler
            .add(Job::new_async(cron.as_str(), move |_uuid, _l| {
                let state = job_state.clone();
                let replica_id = replica_id.clone();
                Box::pin(async move {
                    let now = OffsetDateTime::now_utc();
                    let lease = store::try_acquire_lease(
                        &state.pool,
                        LEASE_NAME,
                        &replica_id,
                        now + Duration::minutes(30),
                        now,
                    )
                    .await;

                    match lease {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::info!("Another replica holds the reconciliation lease");
                            return;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to acquire reconciliation lease");
                            return;
                        }
                    }

                    tracing::info!("Starting scheduled reconciliation");
                    match state.reconciler.run().await {
                        Ok(summary) => {
                            tracing::info!(
                                tenants = summary.tenants.len(),
                                drift_detected = summary.total_drift(),
                                errors = summary.total_errors(),
                                "Scheduled reconciliation finished"
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Scheduled reconciliation failed");
                        }
                    }
                })
            })?)
            .await?;

        scheduler.start().await?;
        tracing::info!(
            hour_utc = reconciliation_hour,
            "Scheduled: daily reconciliation"
        );
    } else {
        tracing::info!("Reconciliation scheduling is disabled");
    }

    let addr: SocketAddr = state.config.bind_address.parse()?;
    let app = create_router(state).layer(TraceLayer::new_for_http());
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
