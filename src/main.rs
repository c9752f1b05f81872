use acctsync::config::{Args, Command, SupabaseAction};
use acctsync::{Application, Config, db, entities, source_api, telemetry};
use clap::Parser;

/// Wait for a shutdown signal (SIGTERM or Ctrl+C).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down gracefully..."),
        _ = terminate => tracing::info!("received SIGTERM, shutting down gracefully..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls crypto provider before anything (the source API client included) builds
    // a TLS connection.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;
    tracing::debug!(?args, "starting acctsync");

    let result = match &args.command {
        Command::Migrate => run_migrate(&config).await,
        Command::Start => run_start(config).await,
        Command::Backfill { entity_name } => run_backfill(&config, entity_name).await,
        Command::Supabase { action } => run_supabase(&config, action).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "acctsync exited with an error");
    }
    result
}

async fn connect(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    Ok(sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_postgres_connections)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&config.database_url)
        .await?)
}

async fn run_migrate(config: &Config) -> anyhow::Result<()> {
    acctsync::connect_and_migrate(config).await?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn run_start(config: Config) -> anyhow::Result<()> {
    let app = Application::new(config).await?;
    app.serve(shutdown_signal()).await
}

async fn run_backfill(config: &Config, entity_name: &str) -> anyhow::Result<()> {
    let pool = acctsync::connect_and_migrate(config).await?;

    let api: std::sync::Arc<dyn source_api::SourceApi> = std::sync::Arc::new(source_api::StripeSourceApi::new(config.stripe_api_key.clone()));
    let upserter = entities::Upserter::new(pool.clone(), api.clone(), config.sync.clone());
    let engine = acctsync::backfill::Engine::new(pool.clone(), api, upserter);
    engine
        .process_until_done(acctsync::DEFAULT_ACCOUNT_ID, entity_name, None, config.sync.max_concurrent_objects)
        .await?;
    tracing::info!(entity_name, "backfill complete");
    Ok(())
}

async fn run_supabase(config: &Config, action: &SupabaseAction) -> anyhow::Result<()> {
    match action {
        SupabaseAction::Install => {
            acctsync::connect_and_migrate(config).await?;
            tracing::info!("acctsync schema installed");
        }
        SupabaseAction::Uninstall => {
            let pool = connect(config).await?;
            if db::is_legacy_install(&pool).await? {
                anyhow::bail!("refusing to uninstall a schema that wasn't installed by acctsync");
            }
            // Tear down in FK-dependency order; migrations are re-runnable from a clean schema.
            for table in ["object_runs", "sync_runs", "managed_webhooks", "entities", "accounts", "_sqlx_migrations"] {
                sqlx::query(&format!("drop table if exists {table} cascade")).execute(&pool).await?;
            }
            sqlx::query("comment on schema public is null").execute(&pool).await?;
            tracing::info!("acctsync schema uninstalled");
        }
    }
    Ok(())
}
