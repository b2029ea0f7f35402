//! HTTP mapping of pool errors
//!
//! Expected outcomes (empty pool, unknown id or email) are produced by the
//! handlers directly. Everything that reaches this type is a failed
//! operation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// A pool error on its way out of an admin handler.
#[derive(Debug)]
pub struct ApiError(pub account_pool::Error);

impl From<account_pool::Error> for ApiError {
    fn from(e: account_pool::Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            account_pool::Error::TokenExchange(_) | account_pool::Error::Producer(_) => {
                StatusCode::BAD_GATEWAY
            }
            account_pool::Error::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            account_pool::Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "admin request failed");
        }
        json_response(status, serde_json::json!({ "error": self.0.to_string() }))
    }
}

/// JSON body with an explicit content type.
pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
