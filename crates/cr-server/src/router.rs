//! Axum router construction.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route(
            "/sessions",
            get(routes::sessions::list_sessions).post(routes::sessions::start_session),
        )
        .route(
            "/sessions/{id}",
            get(routes::sessions::get_session).delete(routes::sessions::stop_session),
        )
        .route("/sessions/{id}/stop", post(routes::sessions::stop_session))
        .route(
            "/sessions/{id}/diagnostics",
            get(routes::sessions::session_diagnostics),
        );

    // Players fetch playlists and segments cross-origin.
    let hls = Router::new()
        .route("/hls/{id}/{file}", get(routes::hls::serve_file))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api)
        .route("/ws/sessions/{id}", get(routes::frames::session_ws))
        .route("/ws/stream", get(routes::frames::stream_ws))
        .merge(hls)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
