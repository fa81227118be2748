use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docket_infra::SchedulerError;

pub fn scheduler_error_to_response(err: SchedulerError) -> axum::response::Response {
    match err {
        SchedulerError::InvalidWebhook(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_webhook", msg)
        }
        SchedulerError::UpstreamUnavailable(e) => json_error(
            StatusCode::BAD_GATEWAY,
            "upstream_unavailable",
            e.to_string(),
        ),
        SchedulerError::Storage(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            e.to_string(),
        ),
        SchedulerError::Broker(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "broker_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
