use axum::Router;

pub mod processes;
pub mod system;
pub mod webhooks;

/// Router for all API endpoints (the `/health` probe is mounted separately).
pub fn router() -> Router {
    Router::new()
        .nest("/processes", processes::router())
        .nest("/webhooks", webhooks::router())
}
