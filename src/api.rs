//! HTTP front end: sensor uploads and dashboard queries.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
};

use crate::db::Measurement;
use crate::error::{StorageError, ValidationError};
use crate::ingest::{Gateway, Reading};
use crate::query::QueryService;

/// Shared server state.
pub struct AppState {
    pub gateway: Gateway,
    pub queries: QueryService,
    pub development: bool,
}

#[derive(Deserialize)]
struct DataParams {
    range: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: String,
    /// Error cause, only filled in development mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Everything a handler can fail with, already mapped to a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    fn storage(message: &str, error: StorageError, development: bool) -> Self {
        log::error!("{message}: {error}");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_owned(),
            detail: development.then(|| error.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        log::warn!("Rejected reading: {error}");
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: error.to_string(),
            detail: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.status.is_client_error() {
            "fail"
        } else {
            "error"
        };

        (
            self.status,
            Json(StatusResponse {
                status,
                message: self.message,
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

async fn handle_post_data(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let reading = Reading::from_json_body(&body)?;

    state
        .gateway
        .submit(reading)
        .await
        .map_err(|e| ApiError::storage("Failed to save measurement", e, state.development))?;

    Ok((
        StatusCode::CREATED,
        Json(StatusResponse {
            status: "success",
            message: "Data saved successfully".to_owned(),
            detail: None,
        }),
    ))
}

async fn handle_get_data(
    State(state): State<Arc<AppState>>,
    params: Result<Query<DataParams>, QueryRejection>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    // A query string that does not parse is treated like an unknown range.
    let range = match params {
        Ok(Query(params)) => params.range,
        Err(rejection) => {
            log::debug!("Ignoring query string: {rejection}");
            None
        }
    };

    let rows = state
        .queries
        .fetch(range.as_deref())
        .await
        .map_err(|e| ApiError::storage("Failed to fetch measurements", e, state.development))?;

    Ok(Json(rows))
}

async fn handle_root() -> &'static str {
    "Backend is running. API available at /api"
}

async fn handle_not_found() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "Route not found".to_owned(),
        detail: None,
    }
}

fn handle_panic(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    log::error!("Request handler panicked");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "Internal server error".to_owned(),
        detail: None,
    }
    .into_response()
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = next.run(request).await;
    log::info!("{method} {path} -> {}", response.status().as_u16());

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/api/data", get(handle_get_data).post(handle_post_data))
        .fallback(handle_not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(log_request))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(Arc::new(state))
}
