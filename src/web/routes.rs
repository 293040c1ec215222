use crate::domain::rate_limit::API_RULE;
use crate::web::handlers::*;
use crate::web::rate_limit::rate_limit;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_router(state: AppState) -> Router {
    // Throttling runs before authentication and the handler.
    let usage = Router::new()
        .route("/usage", get(get_usage).post(track_usage))
        .route("/usage/check", get(check_usage_limit))
        .route_layer(rate_limit(state.rate_limiter.clone(), API_RULE));

    let admin = Router::new()
        .route("/admin/rate-limits", get(rate_limit_stats))
        .route("/admin/rate-limits/reset", post(reset_rate_limit));

    Router::new()
        .route("/health", get(health_check))
        .merge(usage)
        .merge(admin)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
