//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::executor::ExecError;
use crate::rules::RuleError;
use crate::storage::StorageError;

/// Build the application router with all API routes.
///
/// `cors_origin` is the dashboard origin allowed to call the API.
pub fn router(state: AppState, cors_origin: Option<&str>) -> anyhow::Result<Router> {
    let mut app = Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(origin) = cors_origin {
        let origin: HeaderValue = origin
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid CORS origin '{origin}': {e}"))?;
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE]),
        );
    }
    Ok(app)
}

async fn fallback() -> ApiError {
    ApiError::NotFound("not found".to_string())
}

#[derive(Debug, Serialize)]
struct Meta {
    timestamp: DateTime<Utc>,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<usize>,
}

impl Meta {
    fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            total: None,
        }
    }
}

/// `{"data": ..., "meta": ...}` response body.
#[derive(Debug, Serialize)]
pub(crate) struct Envelope<T> {
    data: T,
    meta: Meta,
}

impl<T: Serialize> Envelope<T> {
    pub(crate) fn of(data: T) -> Json<Self> {
        Json(Self { data, meta: Meta::now() })
    }
}

impl<T: Serialize> Envelope<Vec<T>> {
    pub(crate) fn list(data: Vec<T>) -> Json<Self> {
        let meta = Meta {
            total: Some(data.len()),
            ..Meta::now()
        };
        Json(Self { data, meta })
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::NotFound(m) | ApiError::BadRequest(m) | ApiError::Conflict(m) | ApiError::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            error: &'a str,
            status: u16,
        }

        let status = self.status();
        let body = Envelope {
            data: ErrorBody {
                error: self.message(),
                status: status.as_u16(),
            },
            meta: Meta::now(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            StorageError::AlreadyFinalized(_) => ApiError::Conflict(e.to_string()),
            other => {
                tracing::error!(error = %other, "Storage failure while serving request");
                ApiError::Internal("storage unavailable".to_string())
            }
        }
    }
}

impl From<RuleError> for ApiError {
    fn from(e: RuleError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<ExecError> for ApiError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Storage(e) => e.into(),
            ExecError::Inactive(_) | ExecError::Rule(_) => ApiError::BadRequest(e.to_string()),
            ExecError::AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
