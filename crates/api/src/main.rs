//! DocuPort API server entrypoint

use docuport_api::{routes::create_router, AppState, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docuport_api=info,docuport_billing=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let migration_pool = docuport_shared::db::create_migration_pool(&config.database_url).await?;
    docuport_shared::db::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = docuport_shared::db::create_pool(&config.database_url).await?;

    let state = AppState::new(pool, config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to build application state: {}", e))?;

    if config.seed_default_plans {
        state.billing.plans.seed_default_plans().await?;
    }

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "DocuPort API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
