// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single-writer queue: an in-process FIFO of write tasks, each wrapped
//! in an immediate-mode transaction, that is the sole mutator of `events`,
//! `messages`, `message_assets`, `assets`, and `user_sequences` (§4.3).
//!
//! Modeled on the upstream bridge's single-consumer run loop: one task owns
//! the receiver and processes jobs strictly in submission order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ids::{AssetId, DeviceId, EventId, UserId};
use crate::store::sql::{AssetRow, SqlStore};

/// Errors a write job can fail with, distinct from the transport-facing
/// `ProviderError` taxonomy because most callers need to distinguish "asset
/// missing" from "everything else" without matching on wire codes.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("referenced asset not found")]
    AssetNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct AcceptedMessage {
    pub event_id: EventId,
    pub sequence: i64,
}

enum Job {
    ReserveSequence {
        user_id: UserId,
        reply: oneshot::Sender<Result<i64, WriteError>>,
    },
    AcceptUserMessage {
        user_id: UserId,
        device_id: DeviceId,
        client_id: String,
        content: String,
        content_hash: String,
        attachments_hash: String,
        attachments_json: String,
        asset_ids: Vec<AssetId>,
        payload_json: String,
        byte_size: i64,
        timestamp_ms: i64,
        reply: oneshot::Sender<Result<AcceptedMessage, WriteError>>,
    },
    MarkAckSent {
        device_id: DeviceId,
        client_id: String,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    BeginStream {
        user_id: UserId,
        event_id: EventId,
        sequence: i64,
        payload_json: String,
        timestamp_ms: i64,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    FlushStreamChunk {
        event_id: EventId,
        payload_json: String,
        timestamp_ms: i64,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    FinalizeStream {
        event_id: EventId,
        device_id: DeviceId,
        client_id: String,
        payload_json: String,
        timestamp_ms: i64,
        success: bool,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    FinalizeAssistantEvent {
        user_id: UserId,
        event_id: EventId,
        sequence: i64,
        payload_json: String,
        timestamp_ms: i64,
        device_id: DeviceId,
        client_id: String,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    InsertAsset {
        row: AssetRow,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    SweepAssets {
        cutoff_ms: i64,
        reply: oneshot::Sender<Result<Vec<AssetId>, WriteError>>,
    },
    RecoverStartup {
        cutoff_ms: i64,
        reply: oneshot::Sender<Result<(u64, u64), WriteError>>,
    },
    FailMessage {
        device_id: DeviceId,
        client_id: String,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
}

/// Handle used by the rest of the provider to enqueue writes. Cloneable;
/// cheap to hold per connection.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Job>,
}

impl WriteQueue {
    /// Spawn the writer task bound to `store`, with a bounded channel of
    /// depth `max_depth` (§4.3: full queue returns `rate_limited`).
    pub fn spawn(store: Arc<SqlStore>, max_depth: usize, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(max_depth);
        tokio::spawn(run_loop(store, rx, shutdown));
        Self { tx }
    }

    /// Attempt to enqueue; `None` indicates the queue is at capacity and the
    /// caller should surface `rate_limited` without blocking.
    fn try_send(&self, job: Job) -> Option<()> {
        self.tx.try_send(job).ok()
    }

    pub async fn reserve_sequence(&self, user_id: UserId) -> Option<Result<i64, WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::ReserveSequence { user_id, reply })?;
        rx.await.ok()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn accept_user_message(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        client_id: String,
        content: String,
        content_hash: String,
        attachments_hash: String,
        attachments_json: String,
        asset_ids: Vec<AssetId>,
        payload_json: String,
        byte_size: i64,
        timestamp_ms: i64,
    ) -> Option<Result<AcceptedMessage, WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::AcceptUserMessage {
            user_id,
            device_id,
            client_id,
            content,
            content_hash,
            attachments_hash,
            attachments_json,
            asset_ids,
            payload_json,
            byte_size,
            timestamp_ms,
            reply,
        })?;
        rx.await.ok()
    }

    pub async fn mark_ack_sent(&self, device_id: DeviceId, client_id: String) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::MarkAckSent { device_id, client_id, reply })?;
        rx.await.ok()
    }

    pub async fn begin_stream(
        &self,
        user_id: UserId,
        event_id: EventId,
        sequence: i64,
        payload_json: String,
        timestamp_ms: i64,
    ) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::BeginStream { user_id, event_id, sequence, payload_json, timestamp_ms, reply })?;
        rx.await.ok()
    }

    pub async fn flush_stream_chunk(
        &self,
        event_id: EventId,
        payload_json: String,
        timestamp_ms: i64,
    ) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::FlushStreamChunk { event_id, payload_json, timestamp_ms, reply })?;
        rx.await.ok()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_stream(
        &self,
        event_id: EventId,
        device_id: DeviceId,
        client_id: String,
        payload_json: String,
        timestamp_ms: i64,
        success: bool,
    ) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::FinalizeStream {
            event_id,
            device_id,
            client_id,
            payload_json,
            timestamp_ms,
            success,
            reply,
        })?;
        rx.await.ok()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_assistant_event(
        &self,
        user_id: UserId,
        event_id: EventId,
        sequence: i64,
        payload_json: String,
        timestamp_ms: i64,
        device_id: DeviceId,
        client_id: String,
    ) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::FinalizeAssistantEvent {
            user_id,
            event_id,
            sequence,
            payload_json,
            timestamp_ms,
            device_id,
            client_id,
            reply,
        })?;
        rx.await.ok()
    }

    pub async fn insert_asset(&self, row: AssetRow) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::InsertAsset { row, reply })?;
        rx.await.ok()
    }

    pub async fn sweep_assets(&self, cutoff_ms: i64) -> Option<Result<Vec<AssetId>, WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::SweepAssets { cutoff_ms, reply })?;
        rx.await.ok()
    }

    pub async fn recover_startup(&self, cutoff_ms: i64) -> Option<Result<(u64, u64), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::RecoverStartup { cutoff_ms, reply })?;
        rx.await.ok()
    }

    /// Mark a message row failed (`streaming=2`) with no paired event, for
    /// adapter failures that never got far enough to create one.
    pub async fn fail_message(&self, device_id: DeviceId, client_id: String) -> Option<Result<(), WriteError>> {
        let (reply, rx) = oneshot::channel();
        self.try_send(Job::FailMessage { device_id, client_id, reply })?;
        rx.await.ok()
    }
}

async fn run_loop(store: Arc<SqlStore>, mut rx: mpsc::Receiver<Job>, shutdown: CancellationToken) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        run_job(&store, job).await;
    }
    // Drain whatever is left so in-flight client requests still get a reply
    // during graceful shutdown (§4.1 shutdown sequence).
    while let Some(job) = rx.recv().await {
        run_job(&store, job).await;
    }
}

async fn run_job(store: &Arc<SqlStore>, job: Job) {
    match job {
        Job::ReserveSequence { user_id, reply } => {
            let result = reserve_sequence(store, &user_id).await;
            let _ = reply.send(result);
        }
        Job::AcceptUserMessage {
            user_id,
            device_id,
            client_id,
            content,
            content_hash,
            attachments_hash,
            attachments_json,
            asset_ids,
            payload_json,
            byte_size,
            timestamp_ms,
            reply,
        } => {
            let _ = reply.send(
                accept_user_message(
                    store,
                    user_id,
                    device_id,
                    client_id,
                    content,
                    content_hash,
                    attachments_hash,
                    attachments_json,
                    asset_ids,
                    payload_json,
                    byte_size,
                    timestamp_ms,
                )
                .await,
            );
        }
        Job::MarkAckSent { device_id, client_id, reply } => {
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                store.mark_ack_sent(&mut tx, device_id.as_str(), &client_id).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
        Job::BeginStream { user_id, event_id, sequence, payload_json, timestamp_ms, reply } => {
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                let row = crate::store::sql::EventRow {
                    id: event_id,
                    user_id,
                    sequence,
                    originating_device_id: None,
                    event_type: "message".to_owned(),
                    streaming: 1,
                    payload_bytes: payload_json.len() as i64,
                    payload_json,
                    timestamp_ms,
                };
                store.insert_event(&mut tx, &row).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
        Job::FlushStreamChunk { event_id, payload_json, timestamp_ms, reply } => {
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                store.update_event_payload(&mut tx, &event_id, &payload_json, 1, timestamp_ms).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
        Job::FinalizeStream { event_id, device_id, client_id, payload_json, timestamp_ms, success, reply } => {
            let streaming = if success { 0 } else { 2 };
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                store.update_event_payload(&mut tx, &event_id, &payload_json, streaming, timestamp_ms).await?;
                store.update_message_streaming(&mut tx, device_id.as_str(), &client_id, streaming).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
        Job::FinalizeAssistantEvent {
            user_id,
            event_id,
            sequence,
            payload_json,
            timestamp_ms,
            device_id,
            client_id,
            reply,
        } => {
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                let row = crate::store::sql::EventRow {
                    id: event_id,
                    user_id,
                    sequence,
                    originating_device_id: None,
                    event_type: "message".to_owned(),
                    streaming: 0,
                    payload_bytes: payload_json.len() as i64,
                    payload_json,
                    timestamp_ms,
                };
                store.insert_event(&mut tx, &row).await?;
                store.update_message_streaming(&mut tx, device_id.as_str(), &client_id, 0).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
        Job::InsertAsset { row, reply } => {
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                store.insert_asset(&mut tx, &row).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
        Job::SweepAssets { cutoff_ms, reply } => {
            let result = store.sweep_unreferenced_assets(cutoff_ms).await.map_err(WriteError::from);
            let _ = reply.send(result);
        }
        Job::RecoverStartup { cutoff_ms, reply } => {
            let result = store.recover_stale_streams(cutoff_ms).await.map_err(WriteError::from);
            let _ = reply.send(result);
        }
        Job::FailMessage { device_id, client_id, reply } => {
            let result: Result<(), WriteError> = async {
                let mut tx = begin_immediate(store).await?;
                store.update_message_streaming(&mut tx, device_id.as_str(), &client_id, 2).await?;
                tx.commit().await.map_err(anyhow::Error::from)?;
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_user_message(
    store: &Arc<SqlStore>,
    user_id: UserId,
    device_id: DeviceId,
    client_id: String,
    content: String,
    content_hash: String,
    attachments_hash: String,
    attachments_json: String,
    asset_ids: Vec<AssetId>,
    payload_json: String,
    byte_size: i64,
    timestamp_ms: i64,
) -> Result<AcceptedMessage, WriteError> {
    let mut tx = begin_immediate(store).await?;
    let sequence = store.allocate_sequence(&mut tx, &user_id).await?;
    let event_id = EventId::generate();
    let row = crate::store::sql::EventRow {
        id: event_id.clone(),
        user_id: user_id.clone(),
        sequence,
        originating_device_id: Some(device_id.as_str().to_owned()),
        event_type: "message".to_owned(),
        streaming: 0,
        payload_bytes: payload_json.len() as i64,
        payload_json,
        timestamp_ms,
    };
    store.insert_event(&mut tx, &row).await?;
    store
        .insert_message(
            &mut tx,
            device_id.as_str(),
            &client_id,
            &user_id,
            &event_id,
            sequence,
            &content,
            &content_hash,
            &attachments_hash,
            &attachments_json,
            byte_size,
            timestamp_ms,
            1,
        )
        .await?;
    for asset_id in &asset_ids {
        if !store.asset_exists_for_user(asset_id, &user_id).await? {
            tx.rollback().await.ok();
            return Err(WriteError::AssetNotFound);
        }
        store.insert_message_asset(&mut tx, device_id.as_str(), &client_id, asset_id).await?;
    }
    tx.commit().await.map_err(anyhow::Error::from)?;
    Ok(AcceptedMessage { event_id, sequence })
}

async fn reserve_sequence(store: &Arc<SqlStore>, user_id: &UserId) -> Result<i64, WriteError> {
    let mut tx = begin_immediate(store).await?;
    let sequence = store.allocate_sequence(&mut tx, user_id).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;
    Ok(sequence)
}

async fn begin_immediate(store: &Arc<SqlStore>) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, WriteError> {
    let tx = store.pool().begin().await.map_err(anyhow::Error::from)?;
    Ok(tx)
}

#[cfg(test)]
mod writer_tests {
    use super::*;
    use crate::ids::{DeviceId, UserId};

    async fn spawn_queue() -> (tempfile::TempDir, Arc<SqlStore>, WriteQueue) {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store = Arc::new(
            SqlStore::open(&dir.path().join("clawline.sqlite")).await.unwrap_or_else(|e| panic!("open: {e}")),
        );
        let queue = WriteQueue::spawn(Arc::clone(&store), 16, CancellationToken::new());
        (dir, store, queue)
    }

    #[tokio::test]
    async fn accept_user_message_persists_event_and_message() {
        let (_dir, store, queue) = spawn_queue().await;
        let user_id = UserId::generate();
        let device_id = DeviceId::generate();

        let accepted = queue
            .accept_user_message(
                user_id,
                device_id.clone(),
                "c_1".to_owned(),
                "hello".to_owned(),
                "hash-content".to_owned(),
                "hash-attachments".to_owned(),
                "[]".to_owned(),
                Vec::new(),
                r#"{"role":"user","content":"hello"}"#.to_owned(),
                5,
                1_000,
            )
            .await
            .unwrap_or_else(|| panic!("queue accepted the job"))
            .unwrap_or_else(|e| panic!("accept: {e}"));
        assert_eq!(accepted.sequence, 1);

        let lookup = store
            .lookup_message(device_id.as_str(), "c_1")
            .await
            .unwrap_or_else(|e| panic!("lookup: {e}"))
            .unwrap_or_else(|| panic!("message row should exist"));
        assert_eq!(lookup.content_hash, "hash-content");
        assert_eq!(lookup.streaming, 1);
    }

    #[tokio::test]
    async fn accept_user_message_rolls_back_on_missing_asset() {
        let (_dir, store, queue) = spawn_queue().await;
        let user_id = UserId::generate();
        let device_id = DeviceId::generate();
        let bogus_asset = crate::ids::AssetId::generate();

        let result = queue
            .accept_user_message(
                user_id,
                device_id.clone(),
                "c_2".to_owned(),
                "hi".to_owned(),
                "hash-content".to_owned(),
                "hash-attachments".to_owned(),
                r#"[{"type":"asset","assetId":"bogus"}]"#.to_owned(),
                vec![bogus_asset],
                r#"{"role":"user","content":"hi"}"#.to_owned(),
                2,
                1_000,
            )
            .await
            .unwrap_or_else(|| panic!("queue accepted the job"));
        assert!(matches!(result, Err(WriteError::AssetNotFound)));

        let lookup = store.lookup_message(device_id.as_str(), "c_2").await.unwrap_or_else(|e| panic!("lookup: {e}"));
        assert!(lookup.is_none());
    }

    #[tokio::test]
    async fn fail_message_marks_streaming_without_event() {
        let (_dir, store, queue) = spawn_queue().await;
        let user_id = UserId::generate();
        let device_id = DeviceId::generate();

        queue
            .accept_user_message(
                user_id,
                device_id.clone(),
                "c_3".to_owned(),
                "hi".to_owned(),
                "hash-content".to_owned(),
                "hash-attachments".to_owned(),
                "[]".to_owned(),
                Vec::new(),
                r#"{"role":"user","content":"hi"}"#.to_owned(),
                2,
                1_000,
            )
            .await
            .unwrap_or_else(|| panic!("queue accepted the job"))
            .unwrap_or_else(|e| panic!("accept: {e}"));

        queue
            .fail_message(device_id.clone(), "c_3".to_owned())
            .await
            .unwrap_or_else(|| panic!("queue accepted the job"))
            .unwrap_or_else(|e| panic!("fail: {e}"));

        let lookup = store
            .lookup_message(device_id.as_str(), "c_3")
            .await
            .unwrap_or_else(|e| panic!("lookup: {e}"))
            .unwrap_or_else(|| panic!("message row should exist"));
        assert_eq!(lookup.streaming, 2);
    }
}
