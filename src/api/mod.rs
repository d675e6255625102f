//! HTTP API for notes and fanout subscriptions

pub mod handlers;
pub mod note_handlers;
pub mod routes;
pub mod subscription_handlers;

pub use handlers::AppError;
pub use routes::create_router;
