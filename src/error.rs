use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::lifecycle::TransitionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    ForbiddenMsg(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Forbidden | AppError::ForbiddenMsg(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::NotImplemented(_) => "not_implemented",
            AppError::Transition(_) => "transition_error",
            AppError::Db(_) | AppError::Internal(_) => "failure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Transition(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden | AppError::ForbiddenMsg(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::Db(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::Transition(err) => {
                let body = json!({
                    "error": "transition_error",
                    "code": err.code,
                    "from": err.from,
                    "to": err.to,
                    "message": err.message,
                });
                (status, Json(body)).into_response()
            }
            other => {
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = ?other, "request failed");
                }
                let body = json!({
                    "error": other.kind(),
                    "message": other.to_string(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
