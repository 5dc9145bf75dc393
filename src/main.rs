use diesel::{Connection, PgConnection};
use diesel_migrations::MigrationHarness;
use dotenvy::dotenv;
use log::info;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use learnserver::analytics::rollups::spawn_rollup_service;
use learnserver::api_router::configure_api_routes;
use learnserver::config::AppConfig;
use learnserver::shared::state::AppState;
use learnserver::shared::utils::create_conn;
use learnserver::MIGRATIONS;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    let pool = create_conn()?;

    {
        let mut conn = PgConnection::establish(&config.database_url())?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("migrations failed: {}", e))?;
    }

    let state = Arc::new(AppState {
        conn: pool,
        config: config.clone(),
    });

    spawn_rollup_service(state.clone());

    let app = configure_api_routes()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
