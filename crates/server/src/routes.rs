//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use windrose_core::config;

/// Create the application router.
///
/// Every path that is not one of the fixed endpoints is treated as a
/// repository path and handled by the dispatcher.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/metrics", get(metrics_handler))
        .route("/", get(handlers::repo_versions))
        .fallback(get(handlers::dispatch))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config::global().gzip {
        router = router.layer(CompressionLayer::new());
    }
    router
}
