//! `acctsync`: an account-state synchronization engine that keeps a destination PostgreSQL
//! database current with a payment processor's account state, via webhook intake, a paginated
//! backfill engine, and an optional WebSocket live-stream client.
//!
//! # Modules
//!
//! - [`config`]: layered configuration (`figment` + `clap`)
//! - [`db`]: the Persistence Gateway — kind-partitioned entity storage, sync/object run tracking,
//!   advisory locking
//! - [`entities`]: the Entity Upserter — normalization and per-kind secondary effects
//! - [`webhooks`]: signature verification, event dispatch, and managed endpoint lifecycle
//! - [`source_api`]: the abstraction over the payment processor's REST API
//! - [`backfill`]: the paginated Backfill Engine and Sync Run Coordinator
//! - [`live_stream`]: the WebSocket Live-Stream Client
//! - [`api`]: the HTTP surface (webhook intake, health, authenticated sync triggers)
//! - [`telemetry`]: tracing/OpenTelemetry initialization
//! - [`errors`]: the application error hierarchy

pub mod api;
pub mod backfill;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod live_stream;
pub mod source_api;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;
pub mod webhooks;

use crate::config::Config;
use crate::source_api::{SourceApi, StripeSourceApi};
use axum::Router;
use bon::Builder;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

/// Shared state reachable from every HTTP handler (`axum::extract::State`).
#[derive(Clone, Builder)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub router: Arc<webhooks::Router>,
    pub registry: Arc<webhooks::Registry>,
    pub source_api: Arc<dyn SourceApi>,
}

/// Returns the migrator that applies everything under `migrations/`.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

async fn connect_pool(config: &Config) -> anyhow::Result<PgPool> {
    Ok(sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_postgres_connections)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&config.database_url)
        .await?)
}

/// Connects to `config.database_url`, rejecting a schema that looks like a legacy (non-this-system)
/// install before running migrations (spec.md §6/§9).
///
/// A migration failure is retried exactly once against a fresh connection pool before giving up:
/// the first attempt can race a database that has only just become reachable (e.g. right after a
/// container start), and a dropped/reconnected pool clears whatever transient connection state
/// caused the failure. A second failure is assumed real and surfaces as [`errors::Error::Migration`].
pub async fn connect_and_migrate(config: &Config) -> anyhow::Result<PgPool> {
    let pool = connect_pool(config).await?;

    if db::is_legacy_install(&pool).await? {
        return Err(errors::Error::Migration {
            message: "refusing to install into a schema that looks like a pre-existing, non-stripe-sync install".to_string(),
        }
        .into());
    }

    if let Err(e) = migrator().run(&pool).await {
        warn!(error = %e, "migration failed, retrying once against a fresh connection");
        pool.close().await;

        let retry_pool = connect_pool(config).await?;
        migrator()
            .run(&retry_pool)
            .await
            .map_err(|e| errors::Error::Migration { message: e.to_string() })?;
        db::ensure_account(&retry_pool, DEFAULT_ACCOUNT_ID).await?;
        return Ok(retry_pool);
    }

    db::ensure_account(&pool, DEFAULT_ACCOUNT_ID).await?;
    Ok(pool)
}

/// The single account this install tracks (spec.md §2, Non-goals: multi-tenant installs are out of
/// scope; every table FKs to `accounts`, so one row is seeded at startup).
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Interval between stale-run sweeps, independent of `config.sync.stale_run_interval_secs` (which
/// governs the staleness threshold itself, not how often the sweep runs).
const STALE_RUN_SWEEP_PERIOD_SECS: u64 = 60;

fn router(state: AppState) -> Router {
    api::router().with_state(state).layer(tower_http::trace::TraceLayer::new_for_http())
}

/// The running server: HTTP surface, optional live-stream client, and the stale-run sweep.
pub struct Application {
    config: Config,
    pool: PgPool,
    axum_router: Router,
    state: AppState,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = connect_and_migrate(&config).await?;
        Self::new_with_pool(config, pool).await
    }

    /// Builds an application around an existing pool, migrated and with its account seeded
    /// (used by tests, where `sqlx::test` already provides a pool run through migrations).
    pub async fn new_with_pool(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        db::ensure_account(&pool, DEFAULT_ACCOUNT_ID).await?;

        let source_api: Arc<dyn SourceApi> = Arc::new(StripeSourceApi::new(config.stripe_api_key.clone()));
        let upserter = entities::Upserter::new(pool.clone(), source_api.clone(), config.sync.clone());
        let webhook_router = Arc::new(webhooks::Router::new(pool.clone(), upserter, source_api.clone(), config.sync.clone()));
        let registry = Arc::new(webhooks::Registry::new(pool.clone(), source_api.clone()));

        let state = AppState::builder().pool(pool.clone()).config(config.clone()).router(webhook_router).registry(registry).source_api(source_api).build();

        let axum_router = router(state.clone());

        Ok(Self { config, pool, axum_router, state })
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.axum_router).expect("failed to build test server")
    }

    /// Binds the HTTP listener and serves until `shutdown` resolves, alongside the background
    /// stale-run sweep and (unless `public_base_url` is unset) the live-stream client.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("acctsync listening on http://{bind_addr}");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let stale_run_task = tokio::spawn(stale_run_sweep(self.pool.clone(), self.config.sync.stale_run_interval_secs, shutdown_rx.clone()));

        let live_stream_task = if let Some(base_url) = self.config.public_base_url.clone() {
            let endpoint = self.state.registry.find_or_create(DEFAULT_ACCOUNT_ID, &base_url).await?;
            let client = live_stream::LiveStreamClient::new(self.state.source_api.clone(), self.state.router.clone(), endpoint.local_uuid, DEFAULT_ACCOUNT_ID.to_string());
            Some(tokio::spawn(async move { client.run(shutdown_rx).await }))
        } else {
            None
        };

        let server_result = axum::serve(listener, self.axum_router.into_make_service()).with_graceful_shutdown(shutdown).await;

        info!("shutting down background tasks");
        let _ = shutdown_tx.send(true);
        let _ = stale_run_task.await;
        if let Some(task) = live_stream_task {
            let _ = task.await;
        }

        if !self.config.sync.keep_webhooks_on_shutdown
            && let Some(base_url) = self.config.public_base_url.as_ref()
        {
            let teardown: anyhow::Result<()> = async {
                let mut conn = self.pool.acquire().await?;
                let existing = db::handlers::ManagedWebhooks::new(&mut conn).find_by_account_and_url(DEFAULT_ACCOUNT_ID, base_url).await?;
                drop(conn);
                if let Some(endpoint) = existing {
                    self.state.registry.delete(endpoint.local_uuid).await?;
                }
                Ok(())
            }
            .await;
            if let Err(e) = teardown {
                warn!(error = %e, "failed to tear down managed webhook on shutdown");
            }
        }

        info!("closing database connections");
        self.pool.close().await;
        telemetry::shutdown_telemetry();

        server_result.map_err(Into::into)
    }
}

/// Periodically cancels sync runs that have gone quiet past `stale_run_interval_secs`
/// (spec.md §4.6).
#[instrument(skip(pool, shutdown))]
async fn stale_run_sweep(pool: PgPool, stale_run_interval_secs: i64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(STALE_RUN_SWEEP_PERIOD_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let older_than = chrono::Utc::now() - chrono::Duration::seconds(stale_run_interval_secs);
                let mut conn = match pool.acquire().await {
                    Ok(conn) => conn,
                    Err(e) => { warn!(error = %e, "stale-run sweep failed to acquire a connection"); continue; }
                };
                match db::handlers::SyncRuns::new(&mut conn).cancel_stale_runs(DEFAULT_ACCOUNT_ID, older_than).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "cancelled stale sync runs"),
                    Err(e) => warn!(error = %e, "stale-run sweep query failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    async fn health_check_reports_ok(pool: PgPool) {
        let config = test_utils::create_test_config();
        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_json(&serde_json::json!({ "status": "ok" }));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn sync_without_bearer_token_is_rejected_when_api_key_is_configured(pool: PgPool) {
        let mut config = test_utils::create_test_config();
        config.api_key = Some("secret-token".to_string());
        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let response = server.post("/sync").json(&serde_json::json!({})).await;
        response.assert_status_bad_request();
    }
}
