//! HTTP API handlers

mod auth;
mod health;
pub mod response;
mod sockjs;
mod terminal;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Terminal routes
        .route("/misc/terminal", post(terminal::create_terminal))
        .route(
            "/misc/pod/{namespace}/{pod}/shell/{container}",
            get(terminal::exec_shell),
        )
        // Browser transport
        .route("/misc/sockjs/{*path}", any(sockjs::terminal_socket));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
