use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use docket_core::ProcessNumber;
use docket_infra::scheduler::MaterializeRequest;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_processes))
        .route("/:process_number", get(get_process))
        .route("/:process_number/status", get(get_status))
        .route("/:process_number/refresh", post(refresh_process))
}

/// `GET /processes/{n}` - delegate to the scheduler and return immediately;
/// the actual downloads proceed asynchronously.
pub async fn get_process(
    Extension(services): Extension<Arc<AppServices>>,
    Path(process_number): Path<String>,
    Query(query): Query<dto::MaterializeQuery>,
) -> axum::response::Response {
    let process_number: ProcessNumber = match process_number.parse() {
        Ok(v) => v,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_process_number", e.to_string())
        }
    };

    let request = MaterializeRequest {
        process_number,
        webhook_url: query.webhook_url,
        auto_download: query.auto_download.unwrap_or(true),
    };

    match services.scheduler().materialize(request).await {
        Ok(admission) => {
            (StatusCode::OK, Json(dto::admission_to_json(&admission))).into_response()
        }
        Err(e) => errors::scheduler_error_to_response(e),
    }
}

/// `GET /processes/{n}/status` - the poller-facing projection.
pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(process_number): Path<String>,
) -> axum::response::Response {
    let process_number: ProcessNumber = match process_number.parse() {
        Ok(v) => v,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_process_number", e.to_string())
        }
    };

    match services.projection().process_status(&process_number).await {
        Ok(Some(status)) => (StatusCode::OK, Json(status)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "process not found"),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            e.to_string(),
        ),
    }
}

/// `GET /processes` - paginated listing, newest first.
pub async fn list_processes(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);

    match services.store().list_processes(limit, offset).await {
        Ok(page) => {
            let items: Vec<_> = page.processes.iter().map(dto::process_to_json).collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "items": items,
                    "total": page.total,
                    "limit": limit,
                    "offset": offset,
                })),
            )
                .into_response()
        }
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            e.to_string(),
        ),
    }
}

/// `POST /processes/{n}/refresh` - re-fetch upstream metadata for a known
/// process, seeding any newly listed documents.
pub async fn refresh_process(
    Extension(services): Extension<Arc<AppServices>>,
    Path(process_number): Path<String>,
) -> axum::response::Response {
    let process_number: ProcessNumber = match process_number.parse() {
        Ok(v) => v,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_process_number", e.to_string())
        }
    };

    match services.scheduler().refresh(&process_number).await {
        Ok(Some(process)) => {
            (StatusCode::OK, Json(dto::process_to_json(&process))).into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "process not found"),
        Err(e) => errors::scheduler_error_to_response(e),
    }
}
