use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fusion_core::{FieldError, ValidationError};
use serde::Serialize;
use thiserror::Error;

use crate::AppState;

/// Failure taxonomy exposed at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Records the outcome against `route` and renders the error body.
    pub fn respond(self, state: &AppState, route: &str) -> Response {
        let status = self.status();
        state.record_http_request(route, status.as_u16());
        self.into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(reason = %rejection.body_text(), "rejected request body");
        let detail = match rejection {
            JsonRejection::MissingJsonContentType(_) => {
                FieldError::new("body", "must be sent as application/json")
            }
            JsonRejection::JsonSyntaxError(_) => FieldError::new("body", "must be valid JSON"),
            JsonRejection::JsonDataError(_) => {
                FieldError::new("body", "has a field with the wrong type or value")
            }
            _ => FieldError::new("body", "could not be read"),
        };
        ApiError::Validation(ValidationError::single(detail))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Validation(err) => ErrorBody::validation(err.into_details()),
            ApiError::NotFound(_) => ErrorBody::simple("not_found"),
            ApiError::Internal(err) => {
                tracing::error!(?err, "request failed");
                ErrorBody::simple("server_error")
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl<'a> ErrorBody<'a> {
    fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            details: Some(details),
        }
    }

    fn simple(error: &'a str) -> Self {
        Self {
            error,
            details: None,
        }
    }
}

/// Serves a JSON 404 for paths no route matches.
pub async fn not_found() -> Response {
    ApiError::NotFound("route").into_response()
}
