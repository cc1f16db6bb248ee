// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the media plane (§4.9, §6): `/version` (unauthenticated),
//! `/upload`, and `/download/:assetId`, sharing the WebSocket port and the
//! same Bearer JWT rules as the front door.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ProviderError;
use crate::state::ProviderState;
use crate::transport::auth::authenticate_request;

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
}

/// `GET /version` — unauthenticated, per §6.
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse { protocol_version: 1 })
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(rename = "assetId")]
    asset_id: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    size: u64,
}

/// `POST /upload` — multipart, single part named `file` (§4.9).
pub async fn upload(
    State(state): State<Arc<ProviderState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let claims = match authenticate_request(&state.pairing, &headers).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };

    match state.media.upload(&claims.user_id, claims.device_id.as_str(), multipart).await {
        Ok(uploaded) => {
            let row = match state.store.fetch_asset(&uploaded.asset_id).await {
                Ok(Some(row)) => row,
                _ => return ProviderError::ServerError.into_response(),
            };
            Json(UploadResponse {
                asset_id: uploaded.asset_id.as_str().to_owned(),
                mime_type: row.mime_type,
                size: uploaded.size,
            })
            .into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// `GET /download/:assetId` — ownership-checked raw bytes (§4.9).
pub async fn download(
    State(state): State<Arc<ProviderState>>,
    headers: HeaderMap,
    Path(asset_id): Path<String>,
) -> Response {
    let claims = match authenticate_request(&state.pairing, &headers).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    let Ok(asset_id) = asset_id.parse() else {
        return ProviderError::AssetNotFound.into_response();
    };

    let asset = match state.media.download(&claims.user_id, &asset_id).await {
        Ok(asset) => asset,
        Err(err) => return err.into_response(),
    };

    let bytes = match tokio::fs::read(&asset.path).await {
        Ok(bytes) => bytes,
        Err(_) => return ProviderError::AssetNotFound.into_response(),
    };
    let content_length = bytes.len();
    let content_type =
        asset.mime_type.parse().unwrap_or_else(|_| header::HeaderValue::from_static("application/octet-stream"));

    let mut response = (StatusCode::OK, bytes).into_response();
    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    response.headers_mut().insert(header::CONTENT_LENGTH, (content_length as u64).into());
    response
}
