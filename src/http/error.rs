use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use crate::domain::error::{ErrorKind, ImportError};

/// Error body returned by every endpoint: `{"error", "codigo", ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into(), "codigo": code }),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

pub fn status_for(err: &ImportError) -> StatusCode {
    match (err.kind(), err) {
        (_, ImportError::AsyncUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        (ErrorKind::Structural, _) | (ErrorKind::Poison, _) => StatusCode::BAD_REQUEST,
        (ErrorKind::NotFound, _) => StatusCode::NOT_FOUND,
        (ErrorKind::Conflict, _) | (ErrorKind::RowValidation, _) => StatusCode::CONFLICT,
        (ErrorKind::Infrastructure, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, err);
        }

        let mut body = json!({ "error": err.to_string(), "codigo": err.code() });
        if let ImportError::MissingColumns { missing } = &err {
            body["columnas_faltantes"] = json!(missing);
        }
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl IntoResponse for ImportError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_for(&ImportError::NoDataRows), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&ImportError::JobNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ImportError::AsyncUnavailable("off".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ImportError::RetryLimitReached { job_id: "x".into(), max_retries: 2 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ImportError::Queue("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn missing_columns_are_listed_in_body() {
        let api = ApiError::from(ImportError::MissingColumns {
            missing: vec!["categoria".into()],
        });
        assert_eq!(api.body["codigo"], "COLUMNAS_FALTANTES");
        assert_eq!(api.body["columnas_faltantes"][0], "categoria");
    }
}
