// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket front door (§4.10): framing, `type` dispatch, `protocolVersion`
//! enforcement, rate limiting, keepalive, and close-code mapping. One task
//! per connection, driven by a single `tokio::select!` loop that moves
//! through unauthenticated → pending-pair → authenticated phases on the
//! same socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::ids::{DeviceId, UserId};
use crate::pairing::{PairDecisionOutcome, PairRequestOutcome};
use crate::ratelimit::{Window, AUTH, OVERSIZE, PAIR};
use crate::session::RegisteredSession;
use crate::state::ProviderState;
use crate::wire::{ClientFrame, ServerFrame};

/// WS-frame payload cap (§4.10).
const WS_FRAME_CAP: usize = 384 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

pub async fn ws_handler(
    State(state): State<Arc<ProviderState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, addr, socket))
}

/// Authenticated phase state, installed once `auth` succeeds.
struct Authed {
    registered: RegisteredSession,
    user_id: UserId,
    device_id: DeviceId,
    is_admin: bool,
    outbound_rx: mpsc::Receiver<ServerFrame>,
}

async fn handle_socket(state: Arc<ProviderState>, addr: SocketAddr, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let rate_key = addr.to_string();

    let mut pending_device: Option<DeviceId> = None;
    let mut pending_rx: Option<mpsc::Receiver<ServerFrame>> = None;
    let mut authed: Option<Authed> = None;
    let mut oversize_strikes: u32 = 0;

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately; consume it
    let mut last_pong = Instant::now();

    let close_code: Option<u16> = loop {
        let has_pending = pending_rx.is_some();
        let has_authed = authed.is_some();

        tokio::select! {
            biased;

            _ = keepalive.tick() => {
                if last_pong.elapsed() > KEEPALIVE_TIMEOUT {
                    break Some(1001);
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break None;
                }
            }

            maybe = recv_pending(&mut pending_rx), if has_pending => {
                let Some(frame) = maybe else { continue };
                let is_denied = matches!(&frame, ServerFrame::PairResult { success: false, .. });
                let _ = send_frame(&mut sink, &frame).await;
                pending_rx = None;
                pending_device = None;
                if is_denied {
                    break Some(1000);
                }
            }

            maybe = recv_authed(&mut authed), if has_authed => {
                let Some(frame) = maybe else { break Some(1000) };
                if send_frame(&mut sink, &frame).await.is_err() {
                    break None;
                }
            }

            _ = wait_close(&authed), if has_authed => {
                let mut code = 1000;
                if let Some(a) = authed.as_mut() {
                    while let Ok(frame) = a.outbound_rx.try_recv() {
                        code = close_code_for_frame(&frame);
                        let _ = send_frame(&mut sink, &frame).await;
                    }
                }
                break Some(code);
            }

            incoming = stream.next() => {
                let Some(incoming) = incoming else { break None };
                let Ok(message) = incoming else { break Some(1002) };
                match message {
                    Message::Close(_) => break None,
                    Message::Ping(_) | Message::Pong(_) => {
                        last_pong = Instant::now();
                        continue;
                    }
                    Message::Text(text) => {
                        if text.len() > WS_FRAME_CAP {
                            oversize_strikes += 1;
                            let _ = send_frame(&mut sink, &ServerFrame::Error {
                                code: "payload_too_large",
                                message: "frame exceeds 384 KiB".into(),
                                message_id: None,
                            }).await;
                            if oversize_strikes >= OVERSIZE.limit
                                || !state.rate_limiter.attempt(&format!("oversize:{rate_key}"), OVERSIZE, crate::now_ms() as u64).await
                            {
                                break Some(1008);
                            }
                            continue;
                        }
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                            break Some(1002);
                        };
                        if let Some(code) = dispatch(
                            &state,
                            &rate_key,
                            frame,
                            &mut pending_device,
                            &mut pending_rx,
                            &mut authed,
                            &mut sink,
                        )
                        .await
                        {
                            break Some(code);
                        }
                    }
                    Message::Binary(_) => continue,
                }
            }
        }
    };

    if let Some(device_id) = pending_device {
        state.sessions.remove_pending(&device_id);
    }
    if let Some(a) = authed {
        state.sessions.remove(&a.device_id, &a.registered.session_id);
    }
    let code = close_code.unwrap_or(1000);
    let _ = sink.send(Message::Close(Some(CloseFrame { code, reason: "".into() }))).await;
}

async fn recv_pending(rx: &mut Option<mpsc::Receiver<ServerFrame>>) -> Option<ServerFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_authed(authed: &mut Option<Authed>) -> Option<ServerFrame> {
    match authed {
        Some(a) => a.outbound_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_close(authed: &Option<Authed>) {
    match authed {
        Some(a) => a.registered.close.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn send_frame(sink: &mut (impl Sink<Message> + Unpin), frame: &ServerFrame) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(frame) else { return Err(()) };
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

fn close_code_for_frame(frame: &ServerFrame) -> u16 {
    match frame {
        ServerFrame::Error { code, .. } => match *code {
            "token_revoked" | "auth_failed" | "invalid_message" | "rate_limited" | "payload_too_large" => 1008,
            "server_error" => 1011,
            _ => 1000,
        },
        _ => 1000,
    }
}

/// Dispatch one parsed client frame. Returns `Some(close_code)` if the
/// connection should close afterward.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &Arc<ProviderState>,
    rate_key: &str,
    frame: ClientFrame,
    pending_device: &mut Option<DeviceId>,
    pending_rx: &mut Option<mpsc::Receiver<ServerFrame>>,
    authed: &mut Option<Authed>,
    sink: &mut (impl Sink<Message> + Unpin),
) -> Option<u16> {
    match frame {
        ClientFrame::PairRequest { protocol_version, device_id, claimed_name, device_info } => {
            if authed.is_some() {
                let _ = send_frame(sink, &error_frame(ProviderError::InvalidMessage, None)).await;
                return None;
            }
            if protocol_version != 1 {
                let _ = send_frame(sink, &error_frame(ProviderError::InvalidMessage, None)).await;
                return Some(1008);
            }
            if !state.rate_limiter.attempt(&format!("pair:{rate_key}"), PAIR, crate::now_ms() as u64).await {
                let _ = send_frame(sink, &error_frame(ProviderError::RateLimited, None)).await;
                return None;
            }
            handle_pair_request(state, device_id, claimed_name, device_info, pending_device, pending_rx, sink).await
        }
        ClientFrame::PairDecision { device_id, approve, user_id } => {
            let Some(a) = authed.as_ref() else {
                let _ = send_frame(sink, &error_frame(ProviderError::AuthFailed, None)).await;
                return Some(1008);
            };
            if !a.is_admin {
                let _ = send_frame(sink, &error_frame(ProviderError::InvalidMessage, None)).await;
                return None;
            }
            handle_pair_decision(state, device_id, approve, user_id).await;
            None
        }
        ClientFrame::Auth { protocol_version, token, device_id, last_message_id } => {
            if protocol_version != 1 {
                let _ = send_frame(sink, &error_frame(ProviderError::InvalidMessage, None)).await;
                return Some(1008);
            }
            if !state.rate_limiter.attempt(&format!("auth:{rate_key}"), AUTH, crate::now_ms() as u64).await {
                let _ = send_frame(
                    sink,
                    &ServerFrame::AuthResult {
                        success: false,
                        user_id: None,
                        session_id: None,
                        replay_count: 0,
                        replay_truncated: false,
                        history_reset: None,
                        reason: Some("rate_limited"),
                    },
                )
                .await;
                return None;
            }
            handle_auth(state, token, device_id, last_message_id, pending_device, pending_rx, authed, sink).await
        }
        ClientFrame::Message { id, content, attachments } => {
            let Some(a) = authed.as_ref() else {
                let _ = send_frame(sink, &error_frame(ProviderError::AuthFailed, None)).await;
                return Some(1008);
            };
            let window = Window::new(state.config.sessions.max_messages_per_second, Duration::from_secs(1));
            if !state.rate_limiter.attempt(&format!("message:{}", a.device_id), window, crate::now_ms() as u64).await {
                let _ = send_frame(sink, &error_frame(ProviderError::RateLimited, Some(id))).await;
                return None;
            }
            state.dispatcher.handle_message(a.user_id.clone(), a.device_id.clone(), id, content, attachments).await;
            None
        }
        ClientFrame::Typing { active } => {
            let Some(a) = authed.as_ref() else {
                let _ = send_frame(sink, &error_frame(ProviderError::AuthFailed, None)).await;
                return Some(1008);
            };
            let window = Window::new(state.config.sessions.max_typing_per_second, Duration::from_secs(1));
            if !state.rate_limiter.attempt(&format!("typing:{}", a.device_id), window, crate::now_ms() as u64).await {
                return None;
            }
            state.sessions.fan_out(&a.user_id, &ServerFrame::Typing { active, role: None });
            None
        }
    }
}

fn error_frame(err: ProviderError, message_id: Option<String>) -> ServerFrame {
    ServerFrame::Error { code: err.wire_code(), message: err.to_string(), message_id }
}

async fn handle_pair_request(
    state: &Arc<ProviderState>,
    device_id: DeviceId,
    claimed_name: Option<String>,
    device_info: std::collections::HashMap<String, String>,
    pending_device: &mut Option<DeviceId>,
    pending_rx: &mut Option<mpsc::Receiver<ServerFrame>>,
    sink: &mut (impl Sink<Message> + Unpin),
) -> Option<u16> {
    let now_ms = crate::now_ms() as u64;
    let outcome = match state.pairing.handle_pair_request(device_id.clone(), claimed_name, device_info, now_ms).await {
        Ok(o) => o,
        Err(e) => {
            tracing::error!(err = %e, "pair_request failed");
            let _ = send_frame(sink, &error_frame(ProviderError::ServerError, None)).await;
            return Some(1011);
        }
    };

    match outcome {
        PairRequestOutcome::BecameAdmin { user_id } => {
            let Some(entry) = state.pairing.allowlist().get(&device_id).await else {
                let _ = send_frame(sink, &error_frame(ProviderError::ServerError, None)).await;
                return Some(1011);
            };
            let Ok(token) = state.pairing.issue_token(&entry, now_ms).await else {
                let _ = send_frame(sink, &error_frame(ProviderError::ServerError, None)).await;
                return Some(1011);
            };
            let _ = send_frame(
                sink,
                &ServerFrame::PairResult { success: true, token: Some(token), user_id: Some(user_id), reason: None },
            )
            .await;
            None
        }
        PairRequestOutcome::Pending => {
            let rx = state.sessions.register_pending(device_id.clone());
            let approval_frame = state
                .pairing
                .pending_requests()
                .await
                .into_iter()
                .find(|p| p.device_id == device_id)
                .map(|pending| ServerFrame::PairApprovalRequest {
                    device_id: pending.device_id,
                    claimed_name: pending.claimed_name,
                    device_info: pending.device_info,
                });
            *pending_device = Some(device_id);
            *pending_rx = Some(rx);
            if let Some(frame) = approval_frame {
                state.sessions.fan_out_admins(&frame);
            }
            None
        }
        PairRequestOutcome::AlreadyAllowlisted { entry } => {
            if state.pairing.may_reissue(&entry, now_ms) {
                let user_id = entry.user_id.clone();
                let Ok(token) = state.pairing.issue_token(&entry, now_ms).await else {
                    let _ = send_frame(sink, &error_frame(ProviderError::ServerError, None)).await;
                    return Some(1011);
                };
                let _ = send_frame(
                    sink,
                    &ServerFrame::PairResult { success: true, token: Some(token), user_id: Some(user_id), reason: None },
                )
                .await;
                None
            } else {
                let _ = send_frame(sink, &error_frame(ProviderError::InvalidMessage, None)).await;
                Some(1008)
            }
        }
    }
}

async fn handle_pair_decision(state: &Arc<ProviderState>, device_id: DeviceId, approve: bool, user_id: Option<UserId>) {
    let now_ms = crate::now_ms() as u64;
    match state.pairing.handle_pair_decision(device_id.clone(), approve, user_id, now_ms).await {
        Ok(PairDecisionOutcome::Approved { device_id, user_id }) => {
            let Some(entry) = state.pairing.allowlist().get(&device_id).await else { return };
            let Ok(token) = state.pairing.issue_token(&entry, now_ms).await else { return };
            let frame =
                ServerFrame::PairResult { success: true, token: Some(token), user_id: Some(user_id), reason: None };
            state.sessions.send_pending(&device_id, frame);
            state.sessions.remove_pending(&device_id);
        }
        Ok(PairDecisionOutcome::Denied { device_id }) => {
            let frame =
                ServerFrame::PairResult { success: false, token: None, user_id: None, reason: Some("pair_denied") };
            state.sessions.send_pending(&device_id, frame);
            state.sessions.remove_pending(&device_id);
        }
        Err(_) => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_auth(
    state: &Arc<ProviderState>,
    token: String,
    device_id: DeviceId,
    last_message_id: Option<crate::ids::EventId>,
    pending_device: &mut Option<DeviceId>,
    pending_rx: &mut Option<mpsc::Receiver<ServerFrame>>,
    authed: &mut Option<Authed>,
    sink: &mut (impl Sink<Message> + Unpin),
) -> Option<u16> {
    let claims = match state.pairing.authenticate(&token, &device_id).await {
        Ok(c) => c,
        Err(err) => {
            let reason = match err {
                ProviderError::TokenRevoked => "token_revoked",
                ProviderError::DeviceNotApproved => "device_not_approved",
                _ => "auth_failed",
            };
            let _ = send_frame(
                sink,
                &ServerFrame::AuthResult {
                    success: false,
                    user_id: None,
                    session_id: None,
                    replay_count: 0,
                    replay_truncated: false,
                    history_reset: None,
                    reason: Some(reason),
                },
            )
            .await;
            return err.close_code();
        }
    };

    // Drop any leftover pending registration for this socket; auth supersedes it.
    if let Some(pending) = pending_device.take() {
        state.sessions.remove_pending(&pending);
    }
    *pending_rx = None;

    let replay = match crate::eventlog::resolve_replay(
        &state.store,
        &claims.user_id,
        last_message_id.as_ref(),
        state.config.sessions.max_replay_messages as i64,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(err = %e, "replay resolution failed");
            let _ = send_frame(sink, &error_frame(ProviderError::ServerError, None)).await;
            return Some(1011);
        }
    };

    let (registered, outbound_rx) =
        state.sessions.register(claims.device_id.clone(), claims.user_id.clone(), claims.is_admin);
    if let Some(replaced) = &registered.replaced {
        let _ = replaced.try_send(ServerFrame::Error {
            code: "session_replaced",
            message: "session replaced by a newer authentication".into(),
            message_id: None,
        });
    }

    let replay_count = replay.events.len() as u32;
    let _ = send_frame(
        sink,
        &ServerFrame::AuthResult {
            success: true,
            user_id: Some(claims.user_id.clone()),
            session_id: Some(registered.session_id.as_str().to_owned()),
            replay_count,
            replay_truncated: replay.replay_truncated,
            history_reset: Some(replay.history_reset),
            reason: None,
        },
    )
    .await;

    if claims.is_admin {
        for pending in state.pairing.pending_requests().await {
            let _ = send_frame(
                sink,
                &ServerFrame::PairApprovalRequest {
                    device_id: pending.device_id,
                    claimed_name: pending.claimed_name,
                    device_info: pending.device_info,
                },
            )
            .await;
        }
    }

    for row in &replay.events {
        match crate::eventlog::event_to_frame(row) {
            Ok(frame) => {
                if send_frame(sink, &frame).await.is_err() {
                    return None;
                }
            }
            Err(e) => tracing::warn!(err = %e, "skipping undecodable replay event"),
        }
    }

    *authed = Some(Authed {
        registered,
        user_id: claims.user_id,
        device_id: claims.device_id,
        is_admin: claims.is_admin,
        outbound_rx,
    });
    None
}
