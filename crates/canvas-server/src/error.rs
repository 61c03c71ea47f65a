use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use canvas_core::CanvasError;
use canvas_history::HistoryError;
use canvas_sync::SyncError;
use serde_json::json;
use thiserror::Error;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Canvas(#[from] CanvasError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Canvas(e) => AppError::Canvas(e),
            SyncError::History(e) => AppError::History(e),
            SyncError::Decode(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Canvas(e) => match e {
                CanvasError::ReadOnly(_) | CanvasError::CoreBlockImmutable(_) => {
                    StatusCode::FORBIDDEN
                }
                CanvasError::BlockNotFound(_) => StatusCode::NOT_FOUND,
                CanvasError::DuplicateConnection(_, _) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            },
            AppError::History(e) => match e {
                HistoryError::NotFound(_) => StatusCode::NOT_FOUND,
                HistoryError::HasChildren(_, _) => StatusCode::CONFLICT,
                HistoryError::Forbidden(_) => StatusCode::FORBIDDEN,
                HistoryError::EmptyIntent => StatusCode::BAD_REQUEST,
                HistoryError::Cycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            AppError::Canvas(e) => Some(e.code()),
            AppError::History(e) => Some(e.code()),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Database error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            AppError::Serialization(e) => {
                tracing::warn!("Serialization error: {:?}", e);
                "Invalid JSON".to_string()
            }
            AppError::History(HistoryError::Cycle(id)) => {
                tracing::error!("History chain through {} is cyclic", id);
                "Corrupt history".to_string()
            }
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Forbidden(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::Canvas(e) => e.to_string(),
            AppError::History(e) => e.to_string(),
        };

        let body = match self.code() {
            Some(code) => json!({ "error": message, "code": code }),
            None => json!({ "error": message }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::from(HistoryError::Forbidden("apply a history state")).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(HistoryError::HasChildren("s".into(), 2)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(CanvasError::ReadOnly("b".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(SyncError::Decode("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("project p1".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_domain_errors_carry_codes() {
        let err = AppError::from(SyncError::History(HistoryError::EmptyIntent));
        assert_eq!(err.code(), Some("EMPTY_INTENT"));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Conflict("x".into()).code(), None);
    }
}
