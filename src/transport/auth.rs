// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer JWT extraction for the HTTP media plane (§4.9): "authenticate via
//! Bearer JWT, same rules as auth". Reuses [`PairingManager::authenticate`]
//! rather than re-deriving the JWT rules.

use axum::http::HeaderMap;

use crate::error::ProviderError;
use crate::ids::DeviceId;
use crate::pairing::{PairingManager, VerifiedClaims};

/// Pull `Authorization: Bearer <token>` and `X-Device-Id` out of the request
/// and run it through the same authentication path the WebSocket front door
/// uses. The media plane has no `deviceId` in its JSON body, so it travels
/// as a header instead.
pub async fn authenticate_request(
    pairing: &PairingManager,
    headers: &HeaderMap,
) -> Result<VerifiedClaims, ProviderError> {
    let token = bearer_token(headers).ok_or(ProviderError::AuthFailed)?;
    let device_id = device_id_header(headers).ok_or(ProviderError::AuthFailed)?;
    pairing.authenticate(token, &device_id).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn device_id_header(headers: &HeaderMap) -> Option<DeviceId> {
    headers.get("X-Device-Id")?.to_str().ok()?.parse().ok()
}
