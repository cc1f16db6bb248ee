// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The allowlist: one entry per device, persisted as JSON, mutated only
//! inside the allowlist-lock critical section and persisted atomically by
//! write-then-rename (§3, §4.4, §9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::ids::{DeviceId, UserId};
use crate::store::lock::FileLock;

const RETRY_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// One persisted allowlist record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub is_admin: bool,
    pub token_delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_name: Option<String>,
    #[serde(default)]
    pub device_info: HashMap<String, String>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowlistFile {
    #[serde(default = "allowlist_version")]
    version: u32,
    #[serde(default)]
    entries: Vec<AllowlistEntry>,
}

fn allowlist_version() -> u32 {
    1
}

/// In-memory snapshot plus the cross-process file lock guarding it.
pub struct AllowlistStore {
    path: PathBuf,
    snapshot: Mutex<HashMap<DeviceId, AllowlistEntry>>,
    file_lock: Mutex<FileLock>,
}

impl AllowlistStore {
    /// Load from `path`; a missing file is treated as empty (§4.1 step 3).
    pub fn load(path: &Path, lock_path: &Path) -> anyhow::Result<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => {
                let file: AllowlistFile = serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parsing allowlist {}: {e}", path.display()))?;
                file.entries.into_iter().map(|e| (e.device_id.clone(), e)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let file_lock = FileLock::open(lock_path)?;
        Ok(Self { path: path.to_path_buf(), snapshot: Mutex::new(entries), file_lock: Mutex::new(file_lock) })
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<AllowlistEntry> {
        self.snapshot.lock().await.get(device_id).cloned()
    }

    pub async fn has_admin(&self) -> bool {
        self.snapshot.lock().await.values().any(|e| e.is_admin)
    }

    /// Bootstrap-or-pending race: atomically check for an existing admin and,
    /// if none, mint `entry` as admin with a fresh `userId`; otherwise leave
    /// the allowlist untouched and report that bootstrap lost the race (§4.4).
    pub async fn bootstrap_if_no_admin(
        &self,
        make_entry: impl FnOnce(UserId) -> AllowlistEntry,
    ) -> anyhow::Result<Option<AllowlistEntry>> {
        let mut guard = self.snapshot.lock().await;
        if guard.values().any(|e| e.is_admin) {
            return Ok(None);
        }
        let entry = make_entry(UserId::generate());
        guard.insert(entry.device_id.clone(), entry.clone());
        drop(guard);
        self.persist().await?;
        Ok(Some(entry))
    }

    pub async fn insert(&self, entry: AllowlistEntry) -> anyhow::Result<()> {
        self.snapshot.lock().await.insert(entry.device_id.clone(), entry);
        self.persist().await
    }

    /// Apply `mutate` to the entry for `device_id`, if present, then persist.
    pub async fn update<F>(&self, device_id: &DeviceId, mutate: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut AllowlistEntry),
    {
        let mut guard = self.snapshot.lock().await;
        let Some(entry) = guard.get_mut(device_id) else {
            return Ok(false);
        };
        mutate(entry);
        drop(guard);
        self.persist().await?;
        Ok(true)
    }

    pub async fn remove(&self, device_id: &DeviceId) -> anyhow::Result<bool> {
        let removed = self.snapshot.lock().await.remove(device_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Persist the in-memory snapshot under the advisory file lock, retrying
    /// acquisition every 500 ms up to 10 s before giving up (§5).
    async fn persist(&self) -> anyhow::Result<()> {
        let mut lock = self.file_lock.lock().await;
        let _guard = lock
            .acquire_with_retry(RETRY_INTERVAL, RETRY_TIMEOUT)
            .await
            .map_err(|_: ProviderError| anyhow::anyhow!("allowlist lock unavailable"))?;
        let entries: Vec<AllowlistEntry> = self.snapshot.lock().await.values().cloned().collect();
        let file = AllowlistFile { version: allowlist_version(), entries };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod allowlist_tests {
    use super::*;

    fn entry(device: DeviceId, user: UserId, admin: bool) -> AllowlistEntry {
        AllowlistEntry {
            device_id: device,
            user_id: user,
            is_admin: admin,
            token_delivered: false,
            claimed_name: None,
            device_info: HashMap::new(),
            created_at_ms: 0,
            last_seen_at_ms: None,
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store =
            AllowlistStore::load(&dir.path().join("allowlist.json"), &dir.path().join("allowlist.lock"))
                .unwrap_or_else(|e| panic!("load: {e}"));
        assert!(!store.has_admin().await);
    }

    #[tokio::test]
    async fn bootstrap_only_succeeds_once() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store =
            AllowlistStore::load(&dir.path().join("allowlist.json"), &dir.path().join("allowlist.lock"))
                .unwrap_or_else(|e| panic!("load: {e}"));
        let device_a = DeviceId::generate();
        let device_b = DeviceId::generate();

        let minted = store
            .bootstrap_if_no_admin(|user| entry(device_a.clone(), user, true))
            .await
            .unwrap_or_else(|e| panic!("bootstrap: {e}"));
        assert!(minted.is_some());

        let second = store
            .bootstrap_if_no_admin(|user| entry(device_b.clone(), user, true))
            .await
            .unwrap_or_else(|e| panic!("bootstrap: {e}"));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let allow_path = dir.path().join("allowlist.json");
        let lock_path = dir.path().join("allowlist.lock");
        let device = DeviceId::generate();
        let user = UserId::generate();
        {
            let store =
                AllowlistStore::load(&allow_path, &lock_path).unwrap_or_else(|e| panic!("load: {e}"));
            store
                .insert(entry(device.clone(), user.clone(), false))
                .await
                .unwrap_or_else(|e| panic!("insert: {e}"));
        }
        let reloaded = AllowlistStore::load(&allow_path, &lock_path).unwrap_or_else(|e| panic!("reload: {e}"));
        let found = reloaded.get(&device).await.unwrap_or_else(|| panic!("entry missing after reload"));
        assert_eq!(found.user_id, user);
    }
}
