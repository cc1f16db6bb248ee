// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire message shapes for the WebSocket control plane (§6).

use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, DeviceId, EventId, UserId};

/// Inbound frames, dispatched on `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    PairRequest {
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "claimedName", default)]
        claimed_name: Option<String>,
        #[serde(rename = "deviceInfo", default)]
        device_info: std::collections::HashMap<String, String>,
    },
    PairDecision {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        approve: bool,
        #[serde(rename = "userId", default)]
        user_id: Option<UserId>,
    },
    Auth {
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        token: String,
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "lastMessageId", default)]
        last_message_id: Option<EventId>,
    },
    Message {
        id: String,
        content: String,
        #[serde(default)]
        attachments: Vec<InboundAttachment>,
    },
    Typing {
        active: bool,
    },
}

/// An attachment as given by the client: either inline base64 or a reference
/// to a previously uploaded asset (§4.6 step 1).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundAttachment {
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    Asset {
        #[serde(rename = "assetId")]
        asset_id: AssetId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Shape stored as `events.payload_json` (§4.6 step 3): the wire envelope
/// for one event, independent of its `id`/`sequence`/`streaming` columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// Outbound frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    PairApprovalRequest {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        #[serde(rename = "claimedName", skip_serializing_if = "Option::is_none")]
        claimed_name: Option<String>,
        #[serde(rename = "deviceInfo")]
        device_info: std::collections::HashMap<String, String>,
    },
    PairResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    AuthResult {
        success: bool,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(rename = "replayCount")]
        replay_count: u32,
        #[serde(rename = "replayTruncated")]
        replay_truncated: bool,
        #[serde(rename = "historyReset", skip_serializing_if = "Option::is_none")]
        history_reset: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    Ack {
        id: String,
    },
    Message {
        id: EventId,
        role: Role,
        content: String,
        timestamp: i64,
        streaming: bool,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<InboundAttachment>,
        #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
    },
    Typing {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<&'static str>,
    },
    Error {
        code: &'static str,
        message: String,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
}

#[cfg(test)]
mod wire_tests {
    use super::*;

    #[test]
    fn client_frame_dispatches_on_type_tag() {
        let json = r#"{"type":"typing","active":true}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap_or_else(|e| panic!("parse: {e}"));
        assert!(matches!(frame, ClientFrame::Typing { active: true }));
    }

    #[test]
    fn message_frame_round_trips_required_fields() {
        let json = r#"{"type":"message","id":"c_1","content":"hello"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap_or_else(|e| panic!("parse: {e}"));
        match frame {
            ClientFrame::Message { id, content, attachments } => {
                assert_eq!(id, "c_1");
                assert_eq!(content, "hello");
                assert!(attachments.is_empty());
            }
            _ => panic!("expected Message frame"),
        }
    }
}
