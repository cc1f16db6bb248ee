// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming adapter output (§4.7): buffered partial broadcast to the
//! originating device, periodic persistence, and an inactivity watchdog.
//!
//! The adapter call itself is never cancelled once started — only its
//! output stops being observed once the watchdog decides the generation is
//! dead. Cancelling in-flight adapter work is an explicit non-goal; this
//! just stops waiting on it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::adapter::{Adapter, ChunkSink};
use crate::config::StreamsConfig;
use crate::ids::{ClientId, DeviceId, EventId, UserId};
use crate::session::SessionRegistry;
use crate::wire::{EventPayload, Role, ServerFrame};
use crate::writer::WriteQueue;

struct StreamBuf {
    content: String,
    unflushed_bytes: usize,
    last_flush: tokio::time::Instant,
}

struct StreamingSink {
    event_id: EventId,
    device_id: DeviceId,
    writer: WriteQueue,
    sessions: Arc<SessionRegistry>,
    config: StreamsConfig,
    buf: Mutex<StreamBuf>,
    cancelled: Arc<AtomicBool>,
    last_activity_ms: Arc<AtomicI64>,
}

#[async_trait]
impl ChunkSink for StreamingSink {
    async fn write_output(&self, chunk: &str) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.last_activity_ms.store(crate::now_ms(), Ordering::SeqCst);

        let (snapshot, should_flush) = {
            let mut buf = self.buf.lock().await;
            buf.content.push_str(chunk);
            buf.unflushed_bytes += chunk.len();
            let oversized = buf.unflushed_bytes > self.config.chunk_buffer_bytes;
            if oversized {
                tracing::warn!(event_id = %self.event_id, bytes = buf.unflushed_bytes, "stream chunk buffer exceeded cap, forcing flush");
            }
            let interval_elapsed = buf.last_flush.elapsed() >= self.config.chunk_persist_interval();
            let should_flush = interval_elapsed || oversized;
            if should_flush {
                buf.unflushed_bytes = 0;
                buf.last_flush = tokio::time::Instant::now();
            }
            (buf.content.clone(), should_flush)
        };

        self.sessions.send_to_device(
            &self.device_id,
            ServerFrame::Message {
                id: self.event_id.clone(),
                role: Role::Assistant,
                content: snapshot.clone(),
                timestamp: crate::now_ms(),
                streaming: true,
                attachments: Vec::new(),
                device_id: None,
            },
        );

        if should_flush {
            let payload = EventPayload { role: Role::Assistant, content: snapshot, attachments: Vec::new(), device_id: None };
            if let Ok(payload_json) = serde_json::to_string(&payload) {
                let _ = self.writer.flush_stream_chunk(self.event_id.clone(), payload_json, crate::now_ms()).await;
            }
        }
    }
}

/// Run one streaming generation end to end: reserve the sequence, open the
/// in-flight event row, race the detached adapter task against the
/// inactivity watchdog, then finalize and fan out the result.
pub async fn run_streaming_generation(
    writer: &WriteQueue,
    sessions: &Arc<SessionRegistry>,
    adapter: &Arc<dyn Adapter>,
    streams: &StreamsConfig,
    user_id: UserId,
    device_id: DeviceId,
    client_id: ClientId,
    prompt: String,
) {
    let sequence = match writer.reserve_sequence(user_id.clone()).await {
        Some(Ok(seq)) => seq,
        _ => {
            fail_before_event(writer, sessions, &device_id, &client_id).await;
            return;
        }
    };

    let event_id = EventId::generate();
    let now = crate::now_ms();
    let begin_payload = EventPayload { role: Role::Assistant, content: String::new(), attachments: Vec::new(), device_id: None };
    let Ok(begin_json) = serde_json::to_string(&begin_payload) else {
        fail_before_event(writer, sessions, &device_id, &client_id).await;
        return;
    };
    if writer.begin_stream(user_id.clone(), event_id.clone(), sequence, begin_json, now).await.is_none() {
        fail_before_event(writer, sessions, &device_id, &client_id).await;
        return;
    }

    let cancelled = Arc::new(AtomicBool::new(false));
    let last_activity_ms = Arc::new(AtomicI64::new(crate::now_ms()));
    let sink = Arc::new(StreamingSink {
        event_id: event_id.clone(),
        device_id: device_id.clone(),
        writer: writer.clone(),
        sessions: Arc::clone(sessions),
        config: streams.clone(),
        buf: Mutex::new(StreamBuf { content: String::new(), unflushed_bytes: 0, last_flush: tokio::time::Instant::now() }),
        cancelled: Arc::clone(&cancelled),
        last_activity_ms: Arc::clone(&last_activity_ms),
    });

    let (done_tx, mut done_rx) = oneshot::channel();
    let adapter_task = Arc::clone(adapter);
    let sink_task = Arc::clone(&sink);
    tokio::spawn(async move {
        let result = adapter_task.execute_with_tui(&prompt, sink_task.as_ref()).await;
        let _ = done_tx.send(result);
    });

    let inactivity = streams.stream_inactivity();
    let poll_interval = Duration::from_millis(500).min(inactivity);
    let outcome = loop {
        tokio::select! {
            result = &mut done_rx => break result.ok(),
            _ = tokio::time::sleep(poll_interval) => {
                let idle_ms = crate::now_ms().saturating_sub(last_activity_ms.load(Ordering::SeqCst));
                if idle_ms as u128 >= inactivity.as_millis() {
                    break None;
                }
            }
        }
    };
    cancelled.store(true, Ordering::SeqCst);

    let final_content = sink.buf.lock().await.content.clone();
    let now = crate::now_ms();
    let success = matches!(&outcome, Some(Ok(r)) if r.exit_code == 0);
    let content = match &outcome {
        Some(Ok(r)) if r.exit_code == 0 && final_content.is_empty() => r.output.clone(),
        _ => final_content,
    };

    let payload = EventPayload { role: Role::Assistant, content: content.clone(), attachments: Vec::new(), device_id: None };
    let payload_json = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_owned());

    let _ = writer
        .finalize_stream(event_id.clone(), device_id.clone(), client_id.as_str().to_owned(), payload_json, now, success)
        .await;

    if success {
        let frame = ServerFrame::Message {
            id: event_id,
            role: Role::Assistant,
            content,
            timestamp: now,
            streaming: false,
            attachments: Vec::new(),
            device_id: None,
        };
        sessions.fan_out(&user_id, &frame);
    } else {
        tracing::warn!(device = %device_id, "streaming generation failed or timed out from inactivity");
        sessions.send_to_device(
            &device_id,
            ServerFrame::Error {
                code: "server_error",
                message: "assistant generation failed".into(),
                message_id: Some(client_id.as_str().to_owned()),
            },
        );
    }
}

async fn fail_before_event(writer: &WriteQueue, sessions: &Arc<SessionRegistry>, device_id: &DeviceId, client_id: &ClientId) {
    let _ = writer.fail_message(device_id.clone(), client_id.as_str().to_owned()).await;
    sessions.send_to_device(
        device_id,
        ServerFrame::Error {
            code: "server_error",
            message: "failed to start generation".into(),
            message_id: Some(client_id.as_str().to_owned()),
        },
    );
}

#[cfg(test)]
mod stream_tests {
    use super::*;
    use crate::adapter::AdapterResult;
    use crate::store::sql::SqlStore;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct ChunkyAdapter;

    #[async_trait]
    impl Adapter for ChunkyAdapter {
        fn supports_streaming(&self) -> bool {
            true
        }

        async fn execute(&self, prompt: &str) -> anyhow::Result<AdapterResult> {
            Ok(AdapterResult::ok(prompt.to_owned()))
        }

        async fn execute_with_tui(&self, _prompt: &str, sink: &dyn ChunkSink) -> anyhow::Result<AdapterResult> {
            sink.write_output("hel").await;
            sink.write_output("lo").await;
            Ok(AdapterResult::ok("hello"))
        }
    }

    #[tokio::test]
    async fn streaming_generation_finalizes_and_fans_out() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let store = Arc::new(SqlStore::open(&dir.path().join("clawline.sqlite")).await.unwrap_or_else(|e| panic!("open: {e}")));
        let writer = WriteQueue::spawn(Arc::clone(&store), 16, CancellationToken::new());
        let sessions = Arc::new(SessionRegistry::new());
        let adapter: Arc<dyn Adapter> = Arc::new(ChunkyAdapter);
        let streams = StreamsConfig::default();

        let user_id = UserId::generate();
        let device_id = DeviceId::generate();
        let (_registered, mut rx) = sessions.register(device_id.clone(), user_id.clone(), false);

        run_streaming_generation(
            &writer,
            &sessions,
            &adapter,
            &streams,
            user_id,
            device_id,
            "c_1".parse().unwrap_or_else(|_| unreachable!()),
            "User: hi".to_owned(),
        )
        .await;

        let mut saw_final = false;
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::Message { streaming: false, content, .. } = &frame {
                assert_eq!(content, "hello");
                saw_final = true;
            }
        }
        assert!(saw_final, "expected a finalized assistant message frame");
    }
}
