use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

use auto_review::AppState;
use auto_review::config::Config;
use auto_review::logging;
use auto_review::review::ReviewService;
use auto_review::routes::build_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let reviews = ReviewService::from_config(&config, pool)?;
    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState {
        reviews: Arc::new(reviews),
        batch_size: config.batch_size,
        shutdown: shutdown.clone(),
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("[server] Listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("[server] Shutdown requested, finishing in-flight reviews");
            shutdown.cancel();
        })
        .await
        .context("Server failed")?;

    Ok(())
}
