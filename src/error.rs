// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The closed error taxonomy for the provider, per the design's error table.
//!
//! Every fallible path that crosses the wire maps into one of these variants;
//! internal/startup failures that can't surface to a client stay as `anyhow`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Closed set of provider error codes. Each maps to a wire `error.code`,
/// an HTTP status (media plane), and an optional WS close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid message")]
    InvalidMessage,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("asset not found")]
    AssetNotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("upload failed, retry")]
    UploadFailedRetryable,
    #[error("authentication failed")]
    AuthFailed,
    #[error("token revoked")]
    TokenRevoked,
    #[error("device not approved")]
    DeviceNotApproved,
    #[error("pair request rejected")]
    PairRejected,
    #[error("pair request denied")]
    PairDenied,
    #[error("pair request timed out")]
    PairTimeout,
    #[error("session replaced by newer auth")]
    SessionReplaced,
    #[error("internal server error")]
    ServerError,
    #[error("bind address not allowed")]
    BindNotAllowed,
    #[error("database is corrupt")]
    DbCorrupt,
    #[error("database is locked")]
    DbLocked,
    #[error("advisory lock unavailable")]
    LockUnavailable,
    #[error("media storage unavailable")]
    MediaUnavailable,
}

impl ProviderError {
    /// Machine-readable wire code used in `error{code,...}` frames and HTTP bodies.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::PayloadTooLarge => "payload_too_large",
            Self::AssetNotFound => "asset_not_found",
            Self::RateLimited => "rate_limited",
            Self::UploadFailedRetryable => "upload_failed_retryable",
            Self::AuthFailed => "auth_failed",
            Self::TokenRevoked => "token_revoked",
            Self::DeviceNotApproved => "device_not_approved",
            Self::PairRejected => "pair_rejected",
            Self::PairDenied => "pair_denied",
            Self::PairTimeout => "pair_timeout",
            Self::SessionReplaced => "session_replaced",
            Self::ServerError => "server_error",
            Self::BindNotAllowed => "bind_not_allowed",
            Self::DbCorrupt => "db_corrupt",
            Self::DbLocked => "db_locked",
            Self::LockUnavailable => "lock_unavailable",
            Self::MediaUnavailable => "media_unavailable",
        }
    }

    /// HTTP status for the media plane (§6).
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AuthFailed | Self::TokenRevoked => StatusCode::UNAUTHORIZED,
            Self::DeviceNotApproved => StatusCode::FORBIDDEN,
            Self::AssetNotFound => StatusCode::NOT_FOUND,
            Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UploadFailedRetryable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServerError
            | Self::BindNotAllowed
            | Self::DbCorrupt
            | Self::DbLocked
            | Self::LockUnavailable
            | Self::MediaUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PairRejected | Self::PairDenied | Self::PairTimeout | Self::SessionReplaced => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    /// WS close code per §4.10's mapping table. `None` means the socket stays open.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::InvalidMessage | Self::AuthFailed | Self::TokenRevoked | Self::RateLimited => {
                Some(1008)
            }
            Self::ServerError
            | Self::BindNotAllowed
            | Self::DbCorrupt
            | Self::DbLocked
            | Self::LockUnavailable
            | Self::MediaUnavailable => Some(1011),
            Self::SessionReplaced | Self::PairRejected | Self::PairDenied | Self::PairTimeout => {
                Some(1000)
            }
            Self::PayloadTooLarge => Some(1008),
            Self::AssetNotFound | Self::UploadFailedRetryable | Self::DeviceNotApproved => None,
        }
    }

    pub fn to_error_body(self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.wire_code().to_owned(), message: message.into() }
    }

    pub fn to_http_response(self, message: impl Into<String>) -> Response {
        let body = ErrorResponse { error: self.to_error_body(message) };
        (self.http_status(), Json(body)).into_response()
    }
}

/// Top-level HTTP error response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ProviderError {
    fn into_response(self) -> Response {
        self.to_http_response(self.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
