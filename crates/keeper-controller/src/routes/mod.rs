//! Status server routes.

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod status;
pub mod sys;

/// Maximum requests handled concurrently by the status server.
const MAX_CONCURRENT_REQUESTS: usize = 32;

/// Build the full application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/v1/sys", sys::router())
        .nest("/v1/status", status::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            MAX_CONCURRENT_REQUESTS,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
