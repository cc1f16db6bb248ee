// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pairing state machine, admin approval, JWT issue/verify, bootstrap, and
//! re-issue rules (§4.4). Grounded on the credential broker's account-state
//! map and `transport::auth`'s constant-time comparison.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::{AuthConfig, PairingConfig};
use crate::error::ProviderError;
use crate::ids::{DeviceId, UserId};
use crate::store::allowlist::{AllowlistEntry, AllowlistStore};
use crate::store::denylist::DenylistStore;
use crate::store::keyfile::SigningKey;

/// An in-memory pending pair request (§3). Replaced, not reset, on reconnect
/// with the same `deviceId`.
#[derive(Debug, Clone)]
pub struct PendingPairRequest {
    pub device_id: DeviceId,
    pub claimed_name: Option<String>,
    pub device_info: HashMap<String, String>,
    pub created_at_ms: u64,
}

/// Outcome of a `pair_request` (§4.4).
pub enum PairRequestOutcome {
    BecameAdmin { user_id: UserId },
    Pending,
    /// The device is already allowlisted (a decision was made while it was
    /// offline, or it is reconnecting after approval). The caller resolves
    /// this the same way a reissue during `auth` would, instead of
    /// re-queuing an already-decided device as pending.
    AlreadyAllowlisted { entry: AllowlistEntry },
}

/// Outcome of an admin's `pair_decision` (§4.4).
pub enum PairDecisionOutcome {
    Approved { device_id: DeviceId, user_id: UserId },
    Denied { device_id: DeviceId },
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "isAdmin")]
    is_admin: bool,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// A decoded, structurally valid token (signature and `exp` already checked).
pub struct VerifiedClaims {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub is_admin: bool,
}

pub struct PairingManager {
    allowlist: Arc<AllowlistStore>,
    denylist: Arc<DenylistStore>,
    signing_key: SigningKey,
    pairing_config: PairingConfig,
    auth_config: AuthConfig,
    pending: RwLock<HashMap<DeviceId, PendingPairRequest>>,
    /// Serializes concurrent `auth` attempts for the same device (§4.4, §5).
    auth_locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl PairingManager {
    pub fn new(
        allowlist: Arc<AllowlistStore>,
        denylist: Arc<DenylistStore>,
        signing_key: SigningKey,
        pairing_config: PairingConfig,
        auth_config: AuthConfig,
    ) -> Self {
        Self {
            allowlist,
            denylist,
            signing_key,
            pairing_config,
            auth_config,
            pending: RwLock::new(HashMap::new()),
            auth_locks: DashMap::new(),
        }
    }

    /// Handle `pair_request` (§4.4). Bootstraps the first admin if none
    /// exists; otherwise records (or refreshes the socket for) a pending
    /// request.
    pub async fn handle_pair_request(
        &self,
        device_id: DeviceId,
        claimed_name: Option<String>,
        device_info: HashMap<String, String>,
        now_ms: u64,
    ) -> anyhow::Result<PairRequestOutcome> {
        let claimed_name = claimed_name.map(|s| sanitize(&s));
        let device_info: HashMap<String, String> =
            device_info.into_iter().map(|(k, v)| (k, sanitize(&v))).collect();

        let device_id_for_entry = device_id.clone();
        let claimed_name_for_entry = claimed_name.clone();
        let device_info_for_entry = device_info.clone();
        let minted = self
            .allowlist
            .bootstrap_if_no_admin(move |user_id| AllowlistEntry {
                device_id: device_id_for_entry,
                user_id,
                is_admin: true,
                token_delivered: false,
                claimed_name: claimed_name_for_entry,
                device_info: device_info_for_entry,
                created_at_ms: now_ms,
                last_seen_at_ms: None,
            })
            .await?;

        if let Some(entry) = minted {
            return Ok(PairRequestOutcome::BecameAdmin { user_id: entry.user_id });
        }

        if let Some(entry) = self.allowlist.get(&device_id).await {
            return Ok(PairRequestOutcome::AlreadyAllowlisted { entry });
        }

        let mut pending = self.pending.write().await;
        let created_at_ms = pending.get(&device_id).map(|p| p.created_at_ms).unwrap_or(now_ms);
        pending.insert(
            device_id.clone(),
            PendingPairRequest { device_id, claimed_name, device_info, created_at_ms },
        );
        Ok(PairRequestOutcome::Pending)
    }

    pub async fn pending_requests(&self) -> Vec<PendingPairRequest> {
        self.pending.read().await.values().cloned().collect()
    }

    /// Drop pending requests whose TTL has expired; returns the evicted device ids.
    pub async fn expire_pending(&self, now_ms: u64) -> Vec<DeviceId> {
        let ttl_ms = self.pairing_config.pending_ttl().as_millis() as u64;
        let mut pending = self.pending.write().await;
        let expired: Vec<DeviceId> = pending
            .values()
            .filter(|p| now_ms.saturating_sub(p.created_at_ms) > ttl_ms)
            .map(|p| p.device_id.clone())
            .collect();
        for device_id in &expired {
            pending.remove(device_id);
        }
        expired
    }

    /// Handle an admin's `pair_decision`. First decision wins; a second
    /// decision for the same device returns `invalid_message` without
    /// closing the admin's socket.
    pub async fn handle_pair_decision(
        &self,
        device_id: DeviceId,
        approve: bool,
        user_id: Option<UserId>,
        now_ms: u64,
    ) -> Result<PairDecisionOutcome, ProviderError> {
        let removed = { self.pending.write().await.remove(&device_id) };
        let Some(pending) = removed else {
            return Err(ProviderError::InvalidMessage);
        };

        if approve {
            let Some(user_id) = user_id else {
                // Re-insert: malformed decision must not consume the pending request.
                self.pending.write().await.insert(device_id.clone(), pending);
                return Err(ProviderError::InvalidMessage);
            };
            self.allowlist
                .insert(AllowlistEntry {
                    device_id: device_id.clone(),
                    user_id: user_id.clone(),
                    is_admin: false,
                    token_delivered: false,
                    claimed_name: pending.claimed_name,
                    device_info: pending.device_info,
                    created_at_ms: now_ms,
                    last_seen_at_ms: None,
                })
                .await
                .map_err(|_| ProviderError::ServerError)?;
            Ok(PairDecisionOutcome::Approved { device_id, user_id })
        } else {
            if user_id.is_some() {
                self.pending.write().await.insert(device_id.clone(), pending);
                return Err(ProviderError::InvalidMessage);
            }
            Ok(PairDecisionOutcome::Denied { device_id })
        }
    }

    /// JWT authentication (§4.4). Runs under the per-device FIFO so that the
    /// newest successful attempt always wins takeover.
    pub async fn authenticate(&self, token: &str, device_id: &DeviceId) -> Result<VerifiedClaims, ProviderError> {
        let lock = self.auth_locks.entry(device_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = lock.lock().await;
        self.authenticate_locked(token, device_id).await
    }

    async fn authenticate_locked(&self, token: &str, device_id: &DeviceId) -> Result<VerifiedClaims, ProviderError> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = self.auth_config.token_ttl().is_some();
        validation.set_required_spec_claims::<&str>(&[]);
        let decoded = jsonwebtoken::decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.signing_key.as_bytes()),
            &validation,
        )
        .map_err(|_| ProviderError::AuthFailed)?;
        let claims = decoded.claims;

        if !constant_time_eq(&claims.device_id, device_id.as_str()) {
            return Err(ProviderError::AuthFailed);
        }
        if self.denylist.is_revoked(device_id).await {
            return Err(ProviderError::TokenRevoked);
        }
        let Some(entry) = self.allowlist.get(device_id).await else {
            return Err(ProviderError::AuthFailed);
        };
        if entry.user_id.as_str() != claims.sub {
            return Err(ProviderError::AuthFailed);
        }
        if self.pending.read().await.contains_key(device_id) {
            return Err(ProviderError::DeviceNotApproved);
        }

        Ok(VerifiedClaims { user_id: entry.user_id, device_id: device_id.clone(), is_admin: entry.is_admin })
    }

    /// Re-issue truth table (§4.4): whether a fresh token may be minted for
    /// an already-allowlisted device.
    pub fn may_reissue(&self, entry: &AllowlistEntry, now_ms: u64) -> bool {
        if !entry.token_delivered {
            return true;
        }
        if entry.last_seen_at_ms.is_none() {
            return now_ms.saturating_sub(entry.created_at_ms) <= self.reissue_grace_ms();
        }
        false
    }

    fn reissue_grace_ms(&self) -> u64 {
        self.auth_config.reissue_grace_seconds * 1000
    }

    /// Mint a fresh token for an allowlisted device and mark it delivered.
    pub async fn issue_token(&self, entry: &AllowlistEntry, now_ms: u64) -> anyhow::Result<String> {
        let iat = (now_ms / 1000) as i64;
        let exp = self.auth_config.token_ttl().map(|ttl| iat + ttl.as_secs() as i64);
        let claims = TokenClaims {
            sub: entry.user_id.as_str().to_owned(),
            device_id: entry.device_id.as_str().to_owned(),
            is_admin: entry.is_admin,
            iat,
            exp,
        };
        let token = jsonwebtoken::encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.signing_key.as_bytes()),
        )?;
        self.allowlist
            .update(&entry.device_id, |e| e.token_delivered = true)
            .await?;
        Ok(token)
    }

    pub fn allowlist(&self) -> &Arc<AllowlistStore> {
        &self.allowlist
    }
}

/// Strip control characters and trim to at most 64 UTF-8 bytes (§4.4).
fn sanitize(input: &str) -> String {
    let cleaned: String = input.chars().filter(|c| !c.is_control()).collect();
    let mut end = cleaned.len().min(64);
    while end > 0 && !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_owned()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
mod pairing_tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_chars_and_trims() {
        let input = format!("hello\u{0007}{}", "x".repeat(100));
        let out = sanitize(&input);
        assert!(out.len() <= 64);
        assert!(!out.contains('\u{0007}'));
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("abc", "abc"));
    }
}
