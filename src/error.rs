//! 核心错误分类与 HTTP 响应转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::io;
use thiserror::Error;

use crate::range::RangeNotSatisfiable;
use crate::token::TokenError;

/// 访问流程中的所有失败情形。
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{0}")]
    BadRequest(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{0}")]
    NotFound(String),
    #[error("operation not permitted")]
    Forbidden,
    #[error("operation not permitted: {0}")]
    OperationNotPermitted(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("range not satisfiable")]
    RangeNotSatisfiable(u64),
    #[error("{0}")]
    Conflict(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<RangeNotSatisfiable> for AccessError {
    fn from(error: RangeNotSatisfiable) -> Self {
        AccessError::RangeNotSatisfiable(error.total)
    }
}

impl AccessError {
    /// 将文件 I/O 错误映射到业务错误。
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AccessError::NotFound(format!("No such file: {path}")),
            io::ErrorKind::PermissionDenied | io::ErrorKind::IsADirectory => {
                AccessError::OperationNotPermitted(path.to_string())
            }
            _ => AccessError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Conflict(String),
    RangeNotSatisfiable(u64),
    Internal(String),
}

fn detail(status: StatusCode, msg: String) -> Response {
    (status, Json(json!({ "detail": msg }))).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => detail(StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => detail(StatusCode::NOT_FOUND, msg),
            ApiError::Forbidden(msg) => detail(StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => detail(StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => detail(StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    Json(json!({ "detail": "Range not satisfiable" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<AccessError> for ApiError {
    fn from(error: AccessError) -> Self {
        match error {
            AccessError::BadRequest(msg) => ApiError::BadRequest(msg),
            AccessError::InvalidPath(path) => ApiError::Forbidden(format!("Invalid path: {path}")),
            AccessError::NotFound(msg) => ApiError::NotFound(msg),
            AccessError::Forbidden => ApiError::Forbidden("Operation not permitted.".into()),
            AccessError::OperationNotPermitted(path) => {
                ApiError::Forbidden(format!("Operation on ({path}) is forbidden."))
            }
            AccessError::Token(TokenError::Expired) => ApiError::Forbidden("JWT expired".into()),
            AccessError::Token(TokenError::InvalidSignature) => {
                ApiError::Forbidden("Invalid signature".into())
            }
            AccessError::Token(TokenError::NotYetValid) => {
                ApiError::Forbidden("JWT not yet valid".into())
            }
            AccessError::Token(TokenError::Malformed) => {
                ApiError::Forbidden("Malformed token".into())
            }
            AccessError::Token(TokenError::InvalidClaims) => {
                ApiError::Internal("token could not be issued".into())
            }
            AccessError::RangeNotSatisfiable(size) => ApiError::RangeNotSatisfiable(size),
            AccessError::Conflict(msg) => ApiError::Conflict(msg),
            AccessError::UpstreamUnavailable(msg) => ApiError::Internal(msg),
            AccessError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}
