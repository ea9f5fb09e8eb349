use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::api::handler::{
    create_settlement, create_swap, get_balance, get_settlement, health_check,
    rail_webhook, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // API v1 routes
        .nest(
            "/api/v1",
            Router::new()
                // Settlement endpoints
                .route("/settlement", post(create_settlement))
                .route("/settlement/:operation_id", get(get_settlement))
                .route("/swap", post(create_swap))
                // Balance endpoint
                .route("/balance/:user_id/:asset", get(get_balance))
                // Provider callback
                .route("/webhook/rail", post(rail_webhook)),
        )
        .layer(
            ServiceBuilder::new()
                // Request tracing on the outside, so timeouts are visible
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(30)))
                .layer(CompressionLayer::new())
                .layer(CorsLayer::very_permissive()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
