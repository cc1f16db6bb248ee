// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event log replay on reconnect (§4.8). Sequence allocation and append live
//! in the single-writer queue; this module only resolves the replay window.

use std::sync::Arc;

use crate::ids::{EventId, UserId};
use crate::store::sql::{EventRow, SqlStore};
use crate::wire::{EventPayload, Role, ServerFrame};

/// Resolved replay window, ready to stream oldest-to-newest.
pub struct Replay {
    pub events: Vec<EventRow>,
    pub replay_truncated: bool,
    pub history_reset: bool,
}

/// Resolve the replay window for a reconnecting session (§4.8).
///
/// - `last_message_id` omitted or unresolvable (wrong user, purged, never
///   existed) falls back to the last `max_replay` events with `historyReset=true`.
/// - Otherwise returns events strictly after the anchor's sequence.
pub async fn resolve_replay(
    store: &Arc<SqlStore>,
    user_id: &UserId,
    last_message_id: Option<&EventId>,
    max_replay: i64,
) -> anyhow::Result<Replay> {
    let anchor_sequence = match last_message_id {
        Some(event_id) => store.find_event_sequence(user_id, event_id).await?,
        None => None,
    };

    match anchor_sequence {
        Some(sequence) => {
            let (events, replay_truncated) = store.fetch_events_since(user_id, sequence, max_replay).await?;
            Ok(Replay { events, replay_truncated, history_reset: false })
        }
        None => {
            let (events, total) = store.fetch_last_events(user_id, max_replay).await?;
            Ok(Replay { events, replay_truncated: total > max_replay, history_reset: true })
        }
    }
}

/// Decode one stored event row into the outbound `message` frame (§4.8).
pub fn event_to_frame(row: &EventRow) -> anyhow::Result<ServerFrame> {
    let payload: EventPayload = serde_json::from_str(&row.payload_json)?;
    Ok(ServerFrame::Message {
        id: row.id.clone(),
        role: payload.role,
        content: payload.content,
        timestamp: row.timestamp_ms,
        streaming: row.streaming == 1,
        attachments: payload.attachments,
        device_id: payload.device_id,
    })
}

/// Assemble the prompt for an adapter call (§4.6 step 5): the last
/// `max_prompt_messages - 1` events oldest-to-newest, each prefixed by role,
/// followed by the new user turn as the final line.
pub async fn build_prompt(
    store: &Arc<SqlStore>,
    user_id: &UserId,
    new_content: &str,
    max_prompt_messages: u32,
) -> anyhow::Result<String> {
    let history_cap = (max_prompt_messages.max(1) - 1) as i64;
    let (events, _total) = store.fetch_last_events(user_id, history_cap).await?;

    let mut lines = Vec::with_capacity(events.len() + 1);
    for row in &events {
        let payload: EventPayload = serde_json::from_str(&row.payload_json)?;
        let prefix = match payload.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        lines.push(format!("{prefix}: {}", payload.content));
    }
    lines.push(format!("User: {new_content}"));
    Ok(lines.join("\n"))
}
