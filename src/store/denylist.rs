// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The denylist: a persisted JSON array of revoked devices, watched for
//! live revocation so an already-connected session is closed promptly (§3,
//! §4.4, scenario 6).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::ids::DeviceId;

const WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenylistEntry {
    pub device_id: DeviceId,
    pub revoked_at_ms: u64,
}

pub struct DenylistStore {
    path: PathBuf,
    revoked: RwLock<HashSet<DeviceId>>,
}

impl DenylistStore {
    /// Load from `path`; a missing file is treated as empty (§4.1 step 3).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let entries = read_entries(path)?;
        let revoked = entries.into_iter().map(|e| e.device_id).collect();
        Ok(Self { path: path.to_path_buf(), revoked: RwLock::new(revoked) })
    }

    pub async fn is_revoked(&self, device_id: &DeviceId) -> bool {
        self.revoked.read().await.contains(device_id)
    }

    /// Re-read the file from disk, returning device ids newly present since
    /// the last refresh (for closing already-connected sessions).
    async fn refresh(&self) -> anyhow::Result<Vec<DeviceId>> {
        let entries = read_entries(&self.path)?;
        let mut current = self.revoked.write().await;
        let mut newly_revoked = Vec::new();
        for entry in entries {
            if current.insert(entry.device_id.clone()) {
                newly_revoked.push(entry.device_id);
            }
        }
        Ok(newly_revoked)
    }

    /// Spawn a background task that polls the denylist file every 5 s and
    /// invokes `on_revoked` for each device id newly observed as revoked.
    pub fn spawn_watch(
        self: std::sync::Arc<Self>,
        shutdown: tokio_util::sync::CancellationToken,
        on_revoked: impl Fn(DeviceId) + Send + Sync + 'static,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_INTERVAL) => {
                        match self.refresh().await {
                            Ok(newly_revoked) => {
                                for device_id in newly_revoked {
                                    on_revoked(device_id);
                                }
                            }
                            Err(e) => tracing::warn!(err = %e, "denylist refresh failed"),
                        }
                    }
                }
            }
        });
    }
}

fn read_entries(path: &Path) -> anyhow::Result<Vec<DenylistEntry>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing denylist {}: {e}", path.display()))?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod denylist_tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store = DenylistStore::load(&dir.path().join("denylist.json"))
            .unwrap_or_else(|e| panic!("load: {e}"));
        assert!(!store.is_revoked(&DeviceId::generate()).await);
    }

    #[tokio::test]
    async fn refresh_picks_up_newly_appended_entries() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("denylist.json");
        std::fs::write(&path, "[]").unwrap_or_else(|e| panic!("write: {e}"));
        let store = DenylistStore::load(&path).unwrap_or_else(|e| panic!("load: {e}"));
        let device = DeviceId::generate();
        assert!(!store.is_revoked(&device).await);

        let entries = vec![DenylistEntry { device_id: device.clone(), revoked_at_ms: 0 }];
        std::fs::write(&path, serde_json::to_string(&entries).unwrap_or_default())
            .unwrap_or_else(|e| panic!("write: {e}"));
        let newly = store.refresh().await.unwrap_or_else(|e| panic!("refresh: {e}"));
        assert_eq!(newly, vec![device.clone()]);
        assert!(store.is_revoked(&device).await);
    }
}
