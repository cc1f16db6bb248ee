// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn close_code_mapping_matches_table() {
    assert_eq!(ProviderError::InvalidMessage.close_code(), Some(1008));
    assert_eq!(ProviderError::RateLimited.close_code(), Some(1008));
    assert_eq!(ProviderError::ServerError.close_code(), Some(1011));
    assert_eq!(ProviderError::SessionReplaced.close_code(), Some(1000));
    assert_eq!(ProviderError::AssetNotFound.close_code(), None);
}

#[test]
fn http_status_mapping() {
    assert_eq!(ProviderError::AuthFailed.http_status(), StatusCode::UNAUTHORIZED);
    assert_eq!(ProviderError::AssetNotFound.http_status(), StatusCode::NOT_FOUND);
    assert_eq!(ProviderError::PayloadTooLarge.http_status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[test]
fn wire_codes_are_snake_case() {
    assert_eq!(ProviderError::DeviceNotApproved.wire_code(), "device_not_approved");
    assert_eq!(ProviderError::UploadFailedRetryable.wire_code(), "upload_failed_retryable");
}
