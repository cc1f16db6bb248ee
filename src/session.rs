// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry and fan-out: `byDevice`/`byUser` indices, takeover, and
//! best-effort broadcast to every device of a user (§4.5). Generalizes the
//! bridge's per-client outbound `ClientSlot` map from a single upstream
//! session to one fan-out set per user.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ids::{DeviceId, SessionId, UserId};
use crate::wire::ServerFrame;

/// Outbound channel capacity per socket. A full channel is treated as an
/// outbound buffer overage and closes the socket (§4.5).
const OUTBOUND_CAPACITY: usize = 64;

struct SessionSlot {
    session_id: SessionId,
    user_id: UserId,
    is_admin: bool,
    tx: mpsc::Sender<ServerFrame>,
    close: CancellationToken,
}

/// Outbound channel capacity for a pre-auth pending-pair socket. Small: it
/// only ever carries a single `pair_result`.
const PENDING_CAPACITY: usize = 4;

/// Registered sessions, indexed both by device (unique) and by user (set),
/// per §4.5.
pub struct SessionRegistry {
    by_device: DashMap<DeviceId, SessionSlot>,
    by_user: DashMap<UserId, HashSet<DeviceId>>,
    /// Devices connected but not yet authenticated, waiting on a
    /// `pair_decision` (§4.4). Keyed separately from `by_device` since a
    /// pending socket has no `userId` yet.
    pending: DashMap<DeviceId, mpsc::Sender<ServerFrame>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle describing the session a caller just installed, including
/// whatever socket it displaced (best-effort notified by the caller).
pub struct RegisteredSession {
    pub session_id: SessionId,
    pub replaced: Option<mpsc::Sender<ServerFrame>>,
    /// Cancelled when this socket should close: takeover, fan-out failure,
    /// or revocation (§4.5). The connection task selects on this.
    pub close: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { by_device: DashMap::new(), by_user: DashMap::new(), pending: DashMap::new() }
    }

    /// Register (or replace) the pending socket for a device awaiting a
    /// `pair_decision`, keeping the original `createdAt`/TTL in the pairing
    /// manager but replacing which connection receives the eventual
    /// `pair_result` (§4.4 "pending reconnect").
    pub fn register_pending(&self, device_id: DeviceId) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(PENDING_CAPACITY);
        self.pending.insert(device_id, tx);
        rx
    }

    /// Best-effort delivery to a still-connected pending socket. Returns
    /// `false` if the device disconnected since requesting pairing.
    pub fn send_pending(&self, device_id: &DeviceId, frame: ServerFrame) -> bool {
        self.pending.get(device_id).map(|tx| tx.try_send(frame).is_ok()).unwrap_or(false)
    }

    pub fn remove_pending(&self, device_id: &DeviceId) {
        self.pending.remove(device_id);
    }

    /// Register a newly authenticated session, returning the outbound
    /// receiver the caller's socket task should drain, plus the prior
    /// occupant's sender (if any) for takeover notification.
    pub fn register(
        &self,
        device_id: DeviceId,
        user_id: UserId,
        is_admin: bool,
    ) -> (RegisteredSession, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session_id = SessionId::generate();
        let close = CancellationToken::new();
        let replaced = self
            .by_device
            .insert(
                device_id.clone(),
                SessionSlot { session_id: session_id.clone(), user_id: user_id.clone(), is_admin, tx, close: close.clone() },
            )
            .map(|old| {
                old.close.cancel();
                old.tx
            });

        self.by_user.entry(user_id).or_default().insert(device_id);

        (RegisteredSession { session_id, replaced, close }, rx)
    }

    /// Remove a device's session, but only if `session_id` still matches —
    /// guards against a stale socket's cleanup clobbering a newer takeover.
    pub fn remove(&self, device_id: &DeviceId, session_id: &SessionId) {
        let should_remove = self
            .by_device
            .get(device_id)
            .map(|slot| slot.session_id == *session_id)
            .unwrap_or(false);
        if !should_remove {
            return;
        }
        if let Some((_, slot)) = self.by_device.remove(device_id) {
            if let Some(mut devices) = self.by_user.get_mut(&slot.user_id) {
                devices.remove(device_id);
            }
        }
    }

    pub fn is_admin(&self, device_id: &DeviceId) -> bool {
        self.by_device.get(device_id).map(|s| s.is_admin).unwrap_or(false)
    }

    /// Non-blocking best-effort broadcast to every device of `user_id`.
    /// Returns device ids whose socket should be closed due to a full
    /// outbound channel (§4.5).
    pub fn fan_out(&self, user_id: &UserId, frame: &ServerFrame) -> Vec<DeviceId> {
        let Some(devices) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        for device_id in devices.iter() {
            if let Some(slot) = self.by_device.get(device_id) {
                if slot.tx.try_send(frame.clone()).is_err() {
                    slot.close.cancel();
                    failed.push(device_id.clone());
                }
            }
        }
        failed
    }

    /// Best-effort live broadcast to every currently connected admin device
    /// (§4.4). Durable state (`PairingManager::pending_requests`) is the
    /// source of truth; a dropped notification here just means the admin
    /// sees it on next reconnect instead of immediately.
    pub fn fan_out_admins(&self, frame: &ServerFrame) {
        for entry in self.by_device.iter() {
            if entry.is_admin {
                let _ = entry.tx.try_send(frame.clone());
            }
        }
    }

    /// Send to a single device only (used for streaming partials, §4.7).
    /// Closes the socket on failure, same as `fan_out`.
    pub fn send_to_device(&self, device_id: &DeviceId, frame: ServerFrame) -> bool {
        let Some(slot) = self.by_device.get(device_id) else {
            return false;
        };
        if slot.tx.try_send(frame).is_ok() {
            true
        } else {
            slot.close.cancel();
            false
        }
    }

    /// Request that a device's session close (e.g. on revocation via denylist watch).
    pub fn request_close(&self, device_id: &DeviceId) {
        if let Some(slot) = self.by_device.get(device_id) {
            slot.close.cancel();
        }
    }

    pub fn user_of(&self, device_id: &DeviceId) -> Option<UserId> {
        self.by_device.get(device_id).map(|s| s.user_id.clone())
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    fn user() -> UserId {
        UserId::generate()
    }

    #[test]
    fn takeover_replaces_prior_session_for_same_device() {
        let registry = SessionRegistry::new();
        let device = DeviceId::generate();
        let user_id = user();

        let (first, _rx1) = registry.register(device.clone(), user_id.clone(), false);
        assert!(first.replaced.is_none());

        let (second, _rx2) = registry.register(device.clone(), user_id, false);
        assert!(second.replaced.is_some());
        assert!(first.close.is_cancelled());
    }

    #[test]
    fn remove_is_noop_for_stale_session_id() {
        let registry = SessionRegistry::new();
        let device = DeviceId::generate();
        let user_id = user();

        let (first, _rx1) = registry.register(device.clone(), user_id.clone(), false);
        let (_second, _rx2) = registry.register(device.clone(), user_id.clone(), false);

        registry.remove(&device, &first.session_id);
        assert!(registry.send_to_device(&device, ServerFrame::Ack { id: "c_1".into() }));
    }

    #[test]
    fn pending_socket_is_replaced_on_reconnect_not_duplicated() {
        let registry = SessionRegistry::new();
        let device = DeviceId::generate();

        let mut first_rx = registry.register_pending(device.clone());
        let mut second_rx = registry.register_pending(device.clone());

        assert!(registry.send_pending(&device, ServerFrame::Ack { id: "c_1".into() }));
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_ok());
    }

    #[test]
    fn fan_out_admins_skips_non_admin_devices() {
        let registry = SessionRegistry::new();
        let admin_device = DeviceId::generate();
        let plain_device = DeviceId::generate();
        let (_admin, mut admin_rx) = registry.register(admin_device, user(), true);
        let (_plain, mut plain_rx) = registry.register(plain_device, user(), false);

        registry.fan_out_admins(&ServerFrame::Ack { id: "c_1".into() });

        assert!(admin_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_err());
    }
}
