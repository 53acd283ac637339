use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::Error;
use crate::common::error::Violation;

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasons: Option<Vec<Violation>>,
}

/// Error returned by a handler, rendered as `{kind, message, reasons?}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self(Error::invalid(field, reason))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Validation(_) | Error::Conflict(_) => StatusCode::BAD_REQUEST,
            Error::QuotaExceeded(_) => StatusCode::CONFLICT,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Upstream(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.0.kind();
        let body = match self.0 {
            Error::Validation(violations) => ErrorBody {
                kind,
                message: "Request validation failed".to_string(),
                reasons: Some(violations),
            },
            Error::Upstream(detail) => {
                log::error!("Request failed on an upstream service: {detail}");
                ErrorBody {
                    kind,
                    message: "An upstream service is unavailable, try again later".to_string(),
                    reasons: None,
                }
            }
            Error::Internal(detail) => {
                log::error!("Request failed: {detail}");
                ErrorBody {
                    kind,
                    message: "Internal error".to_string(),
                    reasons: None,
                }
            }
            error => ErrorBody {
                kind,
                message: error.to_string(),
                reasons: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
