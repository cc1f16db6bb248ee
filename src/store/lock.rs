// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Advisory file locking, abstracted behind a small interface so the POSIX
//! `flock` reference implementation (via `fd-lock`) can be swapped for an
//! equivalent mutual-exclusion primitive on platforms that need one (§9).

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use fd_lock::{RwLock, RwLockWriteGuard};

use crate::error::ProviderError;

/// An exclusive advisory lock held on a file for the lifetime of the value.
pub struct FileLock {
    inner: RwLock<File>,
}

impl FileLock {
    /// Open (creating if absent) the lock file at `path` without acquiring it yet.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
        Ok(Self { inner: RwLock::new(file) })
    }

    /// Acquire the lock immediately, failing with `LockUnavailable` if contended.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>, ProviderError> {
        self.inner.try_write().map_err(|_| ProviderError::LockUnavailable)
    }

    /// Retry acquisition every `interval` up to `timeout`, per the allowlist
    /// lock's documented 500 ms / 10 s retry policy (§5).
    pub async fn acquire_with_retry(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<RwLockWriteGuard<'_, File>, ProviderError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.inner.try_write() {
                Ok(guard) => return Ok(guard),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(interval).await;
                }
                Err(_) => return Err(ProviderError::LockUnavailable),
            }
        }
    }
}
