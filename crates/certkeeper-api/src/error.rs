//! API error taxonomy
//!
//! Every handler failure funnels through [`ApiError`]; the JSON body carries
//! only the status and a message. Unauthorized responses are deliberately
//! uniform regardless of cause.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use certkeeper_acme::AcmeError;
use certkeeper_crypto::CryptoError;
use certkeeper_orders::OrderError;
use certkeeper_storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("record not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    /// Secret disclosure requested over a non-TLS channel
    #[error("unavailable over http")]
    UnavailableHttp,

    #[error("{0}")]
    Conflict(String),

    #[error("storage error")]
    StorageGeneric,

    /// An ACME action an operator triggered directly (register, revoke, ...)
    #[error("acme error: {0}")]
    Acme(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::UnavailableHttp => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::StorageGeneric | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Acme(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // disclosure refused over plain http: status only, zero body bytes
        if matches!(self, ApiError::UnavailableHttp) {
            return status.into_response();
        }

        let body = serde_json::json!({
            "status": status.as_u16(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound,
            StorageError::Conflict(message) => ApiError::Conflict(message),
            StorageError::TerminalOrder => {
                ApiError::Validation("order is in a final state".to_string())
            }
            StorageError::Db(e) => {
                tracing::error!("storage failure: {e}");
                ApiError::StorageGeneric
            }
        }
    }
}

impl From<AcmeError> for ApiError {
    fn from(err: AcmeError) -> Self {
        ApiError::Acme(err.to_string())
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Storage(e) => e.into(),
            OrderError::Acme(e) => e.into(),
            OrderError::Crypto(e) => e.into(),
            OrderError::AccountNotRegistered => {
                ApiError::Validation("account is not registered with the acme server".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
