use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::require_api_key;
use crate::handlers;
use crate::state::AppState;

/// Builds the full façade router. `/health` is reachable without the
/// bearer token; everything under `/sandboxes` requires it when
/// `api_key` is configured.
pub fn build_router(state: AppState) -> Router {
    let sandbox_routes = Router::new()
        .route("/sandboxes", post(handlers::create_sandbox))
        .route(
            "/sandboxes/:id",
            get(handlers::get_sandbox).delete(handlers::destroy_sandbox),
        )
        .route("/sandboxes/:id/exec", post(handlers::exec))
        .route("/sandboxes/:id/files/write", post(handlers::write_file))
        .route("/sandboxes/:id/files/read", get(handlers::read_file))
        .route("/sandboxes/:id/files/list", get(handlers::list_files))
        .route("/sandboxes/:id/pause", post(handlers::pause))
        .route("/sandboxes/:id/resume", post(handlers::resume))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .merge(sandbox_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
