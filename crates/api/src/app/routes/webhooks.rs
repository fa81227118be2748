use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use docket_core::webhook::validate_webhook_url;

use crate::app::dto;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/validate", post(validate))
        .route("/test-connectivity", post(test_connectivity))
}

/// `POST /webhooks/validate` - run the URL policy without side effects.
pub async fn validate(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::WebhookUrlRequest>,
) -> impl IntoResponse {
    let verdict = validate_webhook_url(
        &body.webhook_url,
        services.config().require_https_webhooks(),
    );
    match verdict {
        Ok(()) => Json(serde_json::json!({ "valid": true })),
        Err(e) => Json(serde_json::json!({ "valid": false, "error": e.to_string() })),
    }
}

/// `POST /webhooks/test-connectivity` - probe the URL for reachability.
pub async fn test_connectivity(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::WebhookUrlRequest>,
) -> impl IntoResponse {
    let report = services.dispatcher().probe(&body.webhook_url).await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "reachable": report.reachable,
            "status_code": report.status_code,
            "error": report.error,
        })),
    )
}
