pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod services;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use handlers::*;
use middleware::{rate_limit, OperatorRateLimit};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

/// Operator API routes. Health stays outside the rate limit so probes
/// never get throttled.
pub fn router(state: AppState, limit: OperatorRateLimit) -> Router {
    let api = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/verify-pending", post(verify_pending))
        .route("/api/rates", get(get_rates))
        .route("/api/rates/convert", get(convert))
        .route("/api/rates/:crypto/:fiat", get(get_rate))
        .route(
            "/api/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route("/api/subscriptions/:id", get(get_subscription))
        .route("/api/subscriptions/:id/:action", post(subscription_action))
        .layer(axum_middleware::from_fn_with_state(limit, rate_limit));

    Router::new()
        .route("/health", get(health_check))
        .merge(api)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
}
