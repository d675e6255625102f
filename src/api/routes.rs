//! API route definitions

use super::handlers;
use super::note_handlers;
use super::subscription_handlers;
use crate::AppState;
use axum::{
    routing::{delete, get},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // ====================================================================
        // Notes
        // ====================================================================
        .route(
            "/notes",
            get(note_handlers::list_notes).post(note_handlers::create_note),
        )
        .route("/notes/{id}", get(note_handlers::get_note))
        // ====================================================================
        // Fanout subscriptions
        // ====================================================================
        .route(
            "/subscriptions",
            get(subscription_handlers::list_subscriptions)
                .post(subscription_handlers::create_subscription),
        )
        .route(
            "/subscriptions/{id}",
            delete(subscription_handlers::delete_subscription),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
