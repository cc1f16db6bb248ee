// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user dispatcher (§4.6): validates an inbound `message` frame,
//! persists it idempotently, echoes and acks it, assembles the prompt, and
//! drives the adapter. Serialized one generation at a time per user so a
//! slow adapter call can't interleave two replies into the same event log.
//!
//! Streaming chunk buffering and the inactivity watchdog live in
//! [`stream`], which this module calls into once the non-streaming setup
//! (sequence reservation, idempotency, persistence) is done.

mod stream;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};

use crate::adapter::Adapter;
use crate::config::{AuthConfig, SessionsConfig, StreamsConfig};
use crate::error::ProviderError;
use crate::eventlog;
use crate::ids::{AssetId, ClientId, DeviceId, EventId, UserId};
use crate::session::SessionRegistry;
use crate::store::sql::{MessageLookup, SqlStore};
use crate::wire::{EventPayload, InboundAttachment, Role, ServerFrame};
use crate::writer::{WriteError, WriteQueue};

const MAX_ATTACHMENTS: usize = 4;
const ALLOWED_INLINE_MIME: [&str; 5] = ["image/png", "image/jpeg", "image/gif", "image/webp", "image/heic"];

/// How many consecutive adapter failures trigger a warning (§4.6).
const CONSECUTIVE_FAILURE_WARN_THRESHOLD: u32 = 5;

/// Bounds how many messages from one user can be queued awaiting processing
/// and serializes their handling so only one generation runs at a time.
struct UserGate {
    order: Mutex<()>,
    queue_depth: Semaphore,
}

pub struct Dispatcher {
    store: Arc<SqlStore>,
    writer: WriteQueue,
    sessions: Arc<SessionRegistry>,
    adapter: Arc<dyn Adapter>,
    auth: AuthConfig,
    sessions_config: SessionsConfig,
    streams: StreamsConfig,
    gates: DashMap<UserId, Arc<UserGate>>,
    consecutive_adapter_failures: AtomicU32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SqlStore>,
        writer: WriteQueue,
        sessions: Arc<SessionRegistry>,
        adapter: Arc<dyn Adapter>,
        auth: AuthConfig,
        sessions_config: SessionsConfig,
        streams: StreamsConfig,
    ) -> Self {
        Self {
            store,
            writer,
            sessions,
            adapter,
            auth,
            sessions_config,
            streams,
            gates: DashMap::new(),
            consecutive_adapter_failures: AtomicU32::new(0),
        }
    }

    /// Reset the consecutive-failure count after a generation succeeds (§4.6).
    fn record_adapter_success(&self) {
        self.consecutive_adapter_failures.store(0, Ordering::Relaxed);
    }

    /// Count one more adapter failure, warning only once the streak reaches
    /// [`CONSECUTIVE_FAILURE_WARN_THRESHOLD`] rather than on every failure (§4.6).
    fn record_adapter_failure(&self, device_id: &DeviceId) {
        let streak = self.consecutive_adapter_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak == CONSECUTIVE_FAILURE_WARN_THRESHOLD {
            tracing::warn!(device = %device_id, streak, "adapter has failed several times in a row");
        }
    }

    fn gate_for(&self, user_id: &UserId) -> Arc<UserGate> {
        Arc::clone(self.gates.entry(user_id.clone()).or_insert_with(|| {
            Arc::new(UserGate { order: Mutex::new(()), queue_depth: Semaphore::new(self.sessions_config.max_queued_messages) })
        }))
    }

    /// Handle one `message` frame from an authenticated device (§4.6).
    pub async fn handle_message(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        raw_id: String,
        content: String,
        attachments: Vec<InboundAttachment>,
    ) {
        let validated = match validate(&raw_id, &content, &attachments, &self.auth) {
            Ok(v) => v,
            Err(err) => {
                self.send_error(&device_id, err, Some(raw_id));
                return;
            }
        };

        let gate = self.gate_for(&user_id);
        let Ok(permit) = gate.queue_depth.clone().try_acquire_owned() else {
            self.send_error(&device_id, ProviderError::RateLimited, Some(validated.client_id.as_str().to_owned()));
            return;
        };

        let _serialize = gate.order.lock().await;
        self.process_locked(user_id, device_id, validated).await;
        drop(permit);
    }

    async fn process_locked(&self, user_id: UserId, device_id: DeviceId, validated: ValidatedMessage) {
        let client_id = validated.client_id.clone();

        match self.store.lookup_message(device_id.as_str(), client_id.as_str()).await {
            Ok(Some(existing)) => {
                self.handle_duplicate(&user_id, &device_id, &client_id, &validated, existing).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(err = %e, "idempotency lookup failed");
                self.send_error(&device_id, ProviderError::ServerError, Some(client_id.as_str().to_owned()));
                return;
            }
        }

        self.persist_and_dispatch(user_id, device_id, client_id, validated).await;
    }

    async fn handle_duplicate(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        client_id: &ClientId,
        validated: &ValidatedMessage,
        existing: MessageLookup,
    ) {
        if existing.content_hash != validated.content_hash || existing.attachments_hash != validated.attachments_hash {
            self.send_error(device_id, ProviderError::InvalidMessage, Some(client_id.as_str().to_owned()));
            return;
        }
        match existing.streaming {
            2 => {
                self.send_error(device_id, ProviderError::InvalidMessage, Some(client_id.as_str().to_owned()));
            }
            1 => {
                self.ack(device_id, client_id);
            }
            _ if existing.server_event_id.is_none() => {
                self.ack(device_id, client_id);
                self.run_generation(user_id.clone(), device_id.clone(), client_id.clone(), validated.content.clone()).await;
            }
            _ => {
                self.ack(device_id, client_id);
            }
        }
    }

    async fn persist_and_dispatch(&self, user_id: UserId, device_id: DeviceId, client_id: ClientId, validated: ValidatedMessage) {
        let payload = EventPayload {
            role: Role::User,
            content: validated.content.clone(),
            attachments: validated.attachments.clone(),
            device_id: Some(device_id.clone()),
        };
        let Ok(payload_json) = serde_json::to_string(&payload) else {
            self.send_error(&device_id, ProviderError::ServerError, Some(client_id.as_str().to_owned()));
            return;
        };

        let accepted = self
            .writer
            .accept_user_message(
                user_id.clone(),
                device_id.clone(),
                client_id.as_str().to_owned(),
                validated.content.clone(),
                validated.content_hash.clone(),
                validated.attachments_hash.clone(),
                validated.canonical_attachments_json.clone(),
                validated.asset_ids.clone(),
                payload_json,
                validated.byte_size as i64,
                crate::now_ms(),
            )
            .await;

        let accepted = match accepted {
            Some(Ok(accepted)) => accepted,
            Some(Err(WriteError::AssetNotFound)) => {
                self.send_error(&device_id, ProviderError::AssetNotFound, Some(client_id.as_str().to_owned()));
                return;
            }
            Some(Err(WriteError::Internal(e))) => {
                tracing::error!(err = %e, "failed to persist user message");
                self.send_error(&device_id, ProviderError::ServerError, Some(client_id.as_str().to_owned()));
                return;
            }
            None => {
                self.send_error(&device_id, ProviderError::RateLimited, Some(client_id.as_str().to_owned()));
                return;
            }
        };

        self.ack(&device_id, &client_id);

        let writer = self.writer.clone();
        let mark_device = device_id.clone();
        let mark_client = client_id.as_str().to_owned();
        tokio::spawn(async move {
            let _ = writer.mark_ack_sent(mark_device, mark_client).await;
        });

        let echo = ServerFrame::Message {
            id: accepted.event_id,
            role: Role::User,
            content: validated.content.clone(),
            timestamp: crate::now_ms(),
            streaming: false,
            attachments: validated.attachments.clone(),
            device_id: Some(device_id.clone()),
        };
        self.sessions.fan_out(&user_id, &echo);

        self.run_generation(user_id, device_id, client_id, validated.content).await;
    }

    fn ack(&self, device_id: &DeviceId, client_id: &ClientId) {
        self.sessions.send_to_device(device_id, ServerFrame::Ack { id: client_id.as_str().to_owned() });
    }

    fn send_error(&self, device_id: &DeviceId, err: ProviderError, message_id: Option<String>) {
        self.sessions.send_to_device(
            device_id,
            ServerFrame::Error { code: err.wire_code(), message: err.to_string(), message_id },
        );
    }

    async fn run_generation(&self, user_id: UserId, device_id: DeviceId, client_id: ClientId, content: String) {
        let prompt = match eventlog::build_prompt(&self.store, &user_id, &content, self.sessions_config.max_prompt_messages).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(err = %e, "prompt assembly failed");
                let _ = self.writer.fail_message(device_id.clone(), client_id.as_str().to_owned()).await;
                self.send_error(&device_id, ProviderError::ServerError, Some(client_id.as_str().to_owned()));
                return;
            }
        };

        if self.adapter.supports_streaming() {
            stream::run_streaming_generation(
                &self.writer,
                &self.sessions,
                &self.adapter,
                &self.streams,
                user_id,
                device_id,
                client_id,
                prompt,
            )
            .await;
        } else {
            self.run_non_streaming(user_id, device_id, client_id, prompt).await;
        }
    }

    async fn run_non_streaming(&self, user_id: UserId, device_id: DeviceId, client_id: ClientId, prompt: String) {
        let timeout = self.streams.adapter_execute_timeout();
        let result = tokio::time::timeout(timeout, self.adapter.execute(&prompt)).await;

        let adapter_result = match result {
            Ok(Ok(r)) if r.exit_code == 0 => {
                self.record_adapter_success();
                r
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                self.record_adapter_failure(&device_id);
                self.fail(&device_id, &client_id).await;
                return;
            }
        };

        let now = crate::now_ms();
        let payload =
            EventPayload { role: Role::Assistant, content: adapter_result.output.clone(), attachments: Vec::new(), device_id: None };
        let Ok(payload_json) = serde_json::to_string(&payload) else {
            self.fail(&device_id, &client_id).await;
            return;
        };

        let sequence = match self.writer.reserve_sequence(user_id.clone()).await {
            Some(Ok(seq)) => seq,
            _ => {
                self.fail(&device_id, &client_id).await;
                return;
            }
        };

        let event_id = EventId::generate();
        let outcome = self
            .writer
            .finalize_assistant_event(
                user_id.clone(),
                event_id.clone(),
                sequence,
                payload_json,
                now,
                device_id.clone(),
                client_id.as_str().to_owned(),
            )
            .await;

        match outcome {
            Some(Ok(())) => {
                let frame = ServerFrame::Message {
                    id: event_id,
                    role: Role::Assistant,
                    content: adapter_result.output,
                    timestamp: now,
                    streaming: false,
                    attachments: Vec::new(),
                    device_id: None,
                };
                self.sessions.fan_out(&user_id, &frame);
            }
            _ => self.fail(&device_id, &client_id).await,
        }
    }

    async fn fail(&self, device_id: &DeviceId, client_id: &ClientId) {
        let _ = self.writer.fail_message(device_id.clone(), client_id.as_str().to_owned()).await;
        self.send_error(device_id, ProviderError::ServerError, Some(client_id.as_str().to_owned()));
    }
}

struct ValidatedMessage {
    client_id: ClientId,
    content: String,
    attachments: Vec<InboundAttachment>,
    asset_ids: Vec<AssetId>,
    content_hash: String,
    attachments_hash: String,
    canonical_attachments_json: String,
    byte_size: usize,
}

/// Validate an inbound `message` frame against the size and shape limits in
/// §8, and build the canonical attachment hash by reusing
/// [`InboundAttachment`]'s derived `Serialize` so its key order matches the
/// data model exactly without hand-assembling JSON.
fn validate(
    raw_id: &str,
    content: &str,
    attachments: &[InboundAttachment],
    auth: &AuthConfig,
) -> Result<ValidatedMessage, ProviderError> {
    let client_id: ClientId = raw_id.parse().map_err(|_| ProviderError::InvalidMessage)?;
    if content.is_empty() {
        return Err(ProviderError::InvalidMessage);
    }
    if content.len() > auth.max_message_bytes {
        return Err(ProviderError::PayloadTooLarge);
    }
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(ProviderError::InvalidMessage);
    }

    let mut inline_bytes = 0usize;
    let mut asset_ids = Vec::new();
    for attachment in attachments {
        match attachment {
            InboundAttachment::Image { mime_type, data } => {
                if !ALLOWED_INLINE_MIME.contains(&mime_type.as_str()) {
                    return Err(ProviderError::InvalidMessage);
                }
                let decoded =
                    base64::engine::general_purpose::STANDARD.decode(data).map_err(|_| ProviderError::InvalidMessage)?;
                inline_bytes += decoded.len();
            }
            InboundAttachment::Asset { asset_id } => asset_ids.push(asset_id.clone()),
        }
    }
    if inline_bytes > auth.max_inline_bytes {
        return Err(ProviderError::PayloadTooLarge);
    }
    let byte_size = content.len() + inline_bytes;
    if byte_size > auth.max_total_payload_bytes() {
        return Err(ProviderError::PayloadTooLarge);
    }

    let canonical_attachments_json = serde_json::to_string(attachments).map_err(|_| ProviderError::InvalidMessage)?;
    let content_hash = hex_sha256(content.as_bytes());
    let attachments_hash = hex_sha256(canonical_attachments_json.as_bytes());

    Ok(ValidatedMessage {
        client_id,
        content: content.to_owned(),
        attachments: attachments.to_vec(),
        asset_ids,
        content_hash,
        attachments_hash,
        canonical_attachments_json,
        byte_size,
    })
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;

    fn auth() -> AuthConfig {
        AuthConfig::default()
    }

    #[test]
    fn rejects_empty_content() {
        let err = validate("c_1", "", &[], &auth()).unwrap_err();
        assert_eq!(err, ProviderError::InvalidMessage);
    }

    #[test]
    fn rejects_malformed_client_id() {
        let err = validate("not-prefixed", "hi", &[], &auth()).unwrap_err();
        assert_eq!(err, ProviderError::InvalidMessage);
    }

    #[test]
    fn rejects_disallowed_inline_mime_type() {
        let attachments = vec![InboundAttachment::Image { mime_type: "image/svg+xml".to_owned(), data: "AA==".to_owned() }];
        let err = validate("c_1", "hi", &attachments, &auth()).unwrap_err();
        assert_eq!(err, ProviderError::InvalidMessage);
    }

    #[test]
    fn rejects_more_than_four_attachments() {
        let attachments = std::iter::repeat(InboundAttachment::Asset { asset_id: AssetId::generate() }).take(5).collect::<Vec<_>>();
        let err = validate("c_1", "hi", &attachments, &auth()).unwrap_err();
        assert_eq!(err, ProviderError::InvalidMessage);
    }

    #[test]
    fn attachments_hash_is_stable_for_empty_attachments() {
        let validated = validate("c_1", "hi", &[], &auth()).unwrap_or_else(|e| panic!("validate: {e}"));
        assert_eq!(validated.canonical_attachments_json, "[]");
    }

    #[test]
    fn valid_message_computes_hashes() {
        let validated = validate("c_1", "hello", &[], &auth()).unwrap_or_else(|e| panic!("validate: {e}"));
        assert_eq!(validated.content, "hello");
        assert_eq!(validated.content_hash.len(), 64);
    }
}
