//! API routes

pub mod checkout;
pub mod health;
pub mod settlement;
pub mod subscriptions;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{security::security_headers_middleware, state::AppState};

/// Gateway notifications and checkout bodies are small JSON documents
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_routes = Router::new()
        .route("/checkout", post(checkout::start_checkout))
        .route(
            "/checkout/:order_id/billing-key",
            post(checkout::register_billing_key),
        )
        .route("/checkout/:order_id/confirm", post(checkout::confirm_checkout))
        .route("/checkout/:order_id/cancel", post(checkout::cancel_checkout))
        .route(
            "/subscriptions/:id/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route("/webhooks/gateway", post(webhooks::gateway_webhook));

    let internal_routes =
        Router::new().route("/settlement/run", post(settlement::run_settlement));

    Router::new()
        .merge(health_routes)
        .nest("/v1", api_routes)
        .nest("/internal", internal_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
