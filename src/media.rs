// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Media service (§4.9): upload and download of binary assets backed by the
//! filesystem, referenced from SQL by `asset_id`. Uploads stream straight to
//! a temp file and only rename into place once the size cap is respected
//! and the multipart body completes cleanly, so a request never buffers a
//! whole upload in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::multipart::{Field, Multipart};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::MediaConfig;
use crate::error::ProviderError;
use crate::ids::{AssetId, UserId};
use crate::store::sql::{AssetRow, SqlStore};
use crate::writer::WriteQueue;

/// How many swept assets to delete before checking whether the sweep has
/// run long enough to warn about (§4.9).
const SWEEP_WARN_BATCH: usize = 10_000;
const SWEEP_WARN_AFTER: Duration = Duration::from_secs(30);

pub struct UploadedAsset {
    pub asset_id: AssetId,
    pub size: u64,
}

pub struct DownloadedAsset {
    pub mime_type: String,
    pub path: PathBuf,
}

pub struct MediaService {
    config: MediaConfig,
    store: Arc<SqlStore>,
    writer: WriteQueue,
}

impl MediaService {
    pub fn new(config: MediaConfig, store: Arc<SqlStore>, writer: WriteQueue) -> Self {
        Self { config, store, writer }
    }

    /// Create `assets/` and `tmp/` under the media root if absent (§4.1 step 2).
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.config.assets_dir())?;
        std::fs::create_dir_all(self.config.tmp_dir())?;
        Ok(())
    }

    /// Delete leftover temp files from uploads that never completed (§4.1 step 6).
    pub async fn startup_sweep(&self) -> anyhow::Result<u64> {
        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(self.config.tmp_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Accept a multipart upload with a single `file` field, enforcing
    /// `maxUploadBytes` as bytes arrive rather than after the fact (§4.9).
    /// `mimeType` comes from that part's own `Content-Type` header, not a
    /// separate form field.
    pub async fn upload(
        &self,
        user_id: &UserId,
        uploader_device_id: &str,
        mut multipart: Multipart,
    ) -> Result<UploadedAsset, ProviderError> {
        let asset_id = AssetId::generate();
        let tmp_path = self.config.tmp_dir().join(format!("{}.tmp", asset_id.as_str()));

        let result = self.upload_fields(user_id, uploader_device_id, &mut multipart, &asset_id, &tmp_path).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn upload_fields(
        &self,
        user_id: &UserId,
        uploader_device_id: &str,
        multipart: &mut Multipart,
        asset_id: &AssetId,
        tmp_path: &Path,
    ) -> Result<UploadedAsset, ProviderError> {
        let mut upload: Option<(String, u64)> = None;

        while let Some(mut field) = multipart.next_field().await.map_err(|_| ProviderError::InvalidMessage)? {
            if field.name() != Some("file") {
                continue;
            }
            let mime_type = field.content_type().unwrap_or("application/octet-stream").to_owned();
            let size = stream_field_to_file(&mut field, tmp_path, self.config.max_upload_bytes).await?;
            upload = Some((mime_type, size));
        }

        let Some((mime_type, size)) = upload else {
            return Err(ProviderError::InvalidMessage);
        };

        let final_path = self.config.assets_dir().join(asset_id.as_str());
        tokio::fs::rename(tmp_path, &final_path).await.map_err(|_| ProviderError::MediaUnavailable)?;

        let row = AssetRow {
            asset_id: asset_id.clone(),
            user_id: user_id.clone(),
            uploader_device_id: uploader_device_id.to_owned(),
            mime_type,
            size: size as i64,
            created_at_ms: crate::now_ms(),
        };
        if self.writer.insert_asset(row).await.is_none() {
            let _ = tokio::fs::remove_file(&final_path).await;
            return Err(ProviderError::RateLimited);
        }

        Ok(UploadedAsset { asset_id: asset_id.clone(), size })
    }

    /// Resolve an asset for download, enforcing that only its owning user
    /// can fetch it (§4.9). Drops the DB row if the blob is missing from disk.
    pub async fn download(&self, user_id: &UserId, asset_id: &AssetId) -> Result<DownloadedAsset, ProviderError> {
        let row = self
            .store
            .fetch_asset(asset_id)
            .await
            .map_err(|_| ProviderError::ServerError)?
            .ok_or(ProviderError::AssetNotFound)?;
        if &row.user_id != user_id {
            return Err(ProviderError::AssetNotFound);
        }
        let path = self.config.assets_dir().join(asset_id.as_str());
        if tokio::fs::metadata(&path).await.is_err() {
            let _ = self.store.delete_asset_row(asset_id).await;
            return Err(ProviderError::AssetNotFound);
        }
        Ok(DownloadedAsset { mime_type: row.mime_type, path })
    }

    /// Delete assets older than `unreferencedUploadTtl` with no referencing
    /// message, both the DB row (via the writer) and the blob on disk (§4.9).
    pub async fn sweep_unreferenced(&self) -> anyhow::Result<usize> {
        let cutoff = crate::now_ms() - self.config.unreferenced_upload_ttl().as_millis() as i64;
        let ids = self
            .writer
            .sweep_assets(cutoff)
            .await
            .ok_or_else(|| anyhow::anyhow!("write queue unavailable for asset sweep"))??;

        let started = tokio::time::Instant::now();
        for (i, asset_id) in ids.iter().enumerate() {
            let path = self.config.assets_dir().join(asset_id.as_str());
            let _ = tokio::fs::remove_file(&path).await;
            if i > 0 && i % SWEEP_WARN_BATCH == 0 && started.elapsed() > SWEEP_WARN_AFTER {
                tracing::warn!(swept = i, total = ids.len(), "asset sweep is taking longer than 30s");
            }
        }
        Ok(ids.len())
    }

    /// Spawn the periodic sweep loop at the configured interval (§4.9).
    pub fn spawn_periodic_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.sweep_unreferenced().await {
                            tracing::warn!(err = %e, "asset sweep failed");
                        }
                    }
                }
            }
        });
    }
}

async fn stream_field_to_file(field: &mut Field<'_>, tmp_path: &Path, max_bytes: u64) -> Result<u64, ProviderError> {
    let mut file = tokio::fs::File::create(tmp_path).await.map_err(|_| ProviderError::MediaUnavailable)?;
    let mut total: u64 = 0;
    loop {
        let chunk = field.chunk().await.map_err(|_| ProviderError::UploadFailedRetryable)?;
        let Some(chunk) = chunk else { break };
        total += chunk.len() as u64;
        if total > max_bytes {
            return Err(ProviderError::PayloadTooLarge);
        }
        file.write_all(&chunk).await.map_err(|_| ProviderError::UploadFailedRetryable)?;
    }
    file.flush().await.map_err(|_| ProviderError::UploadFailedRetryable)?;
    Ok(total)
}

#[cfg(test)]
mod media_tests {
    use super::*;
    use crate::config::MediaConfig;

    async fn test_service() -> (tempfile::TempDir, MediaService) {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store =
            Arc::new(SqlStore::open(&dir.path().join("clawline.sqlite")).await.unwrap_or_else(|e| panic!("open: {e}")));
        let writer = WriteQueue::spawn(Arc::clone(&store), 16, CancellationToken::new());
        let config = MediaConfig { media_path: dir.path().join("media"), ..MediaConfig::default() };
        let service = MediaService::new(config, store, writer);
        service.ensure_dirs().unwrap_or_else(|e| panic!("ensure_dirs: {e}"));
        (dir, service)
    }

    async fn insert_asset(service: &MediaService, asset_id: &AssetId, user_id: &UserId, bytes: &[u8]) {
        tokio::fs::write(service.config.assets_dir().join(asset_id.as_str()), bytes)
            .await
            .unwrap_or_else(|e| panic!("write asset: {e}"));
        service
            .writer
            .insert_asset(AssetRow {
                asset_id: asset_id.clone(),
                user_id: user_id.clone(),
                uploader_device_id: "dev".to_owned(),
                mime_type: "image/png".to_owned(),
                size: bytes.len() as i64,
                created_at_ms: crate::now_ms(),
            })
            .await
            .unwrap_or_else(|| panic!("queue accepted the job"))
            .unwrap_or_else(|e| panic!("insert: {e}"));
    }

    #[tokio::test]
    async fn download_rejects_non_owning_user() {
        let (_dir, service) = test_service().await;
        let owner = UserId::generate();
        let other = UserId::generate();
        let asset_id = AssetId::generate();
        insert_asset(&service, &asset_id, &owner, b"hello").await;

        let result = service.download(&other, &asset_id).await;
        assert!(matches!(result, Err(ProviderError::AssetNotFound)));

        let ok = service.download(&owner, &asset_id).await.unwrap_or_else(|e| panic!("download: {e}"));
        assert_eq!(ok.mime_type, "image/png");
    }

    #[tokio::test]
    async fn download_drops_orphaned_row_when_blob_missing() {
        let (_dir, service) = test_service().await;
        let owner = UserId::generate();
        let asset_id = AssetId::generate();
        service
            .writer
            .insert_asset(AssetRow {
                asset_id: asset_id.clone(),
                user_id: owner.clone(),
                uploader_device_id: "dev".to_owned(),
                mime_type: "image/png".to_owned(),
                size: 3,
                created_at_ms: crate::now_ms(),
            })
            .await
            .unwrap_or_else(|| panic!("queue accepted the job"))
            .unwrap_or_else(|e| panic!("insert: {e}"));

        let result = service.download(&owner, &asset_id).await;
        assert!(matches!(result, Err(ProviderError::AssetNotFound)));
        assert!(service.store.fetch_asset(&asset_id).await.unwrap_or_else(|e| panic!("fetch: {e}")).is_none());
    }

    #[tokio::test]
    async fn startup_sweep_clears_stray_tmp_files() {
        let (_dir, service) = test_service().await;
        tokio::fs::write(service.config.tmp_dir().join("leftover.tmp"), b"x")
            .await
            .unwrap_or_else(|e| panic!("write: {e}"));
        let removed = service.startup_sweep().await.unwrap_or_else(|e| panic!("sweep: {e}"));
        assert_eq!(removed, 1);
    }
}
