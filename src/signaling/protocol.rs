#![forbid(unsafe_code)]

// Signaling protocol - event types exchanged over the WebSocket
//
// Every frame is a JSON object `{"event": "<kebab-name>", "data": {...}}`.

use crate::identity::Identity;
use crate::room::history::{ChatMessage, FileRecord};
use crate::room::roles::{Capability, ParticipantRole, PermissionsSnapshot};
use crate::room::settings::{RoomSettings, SettingsPatch};
use crate::room::{ParticipantInfo, RoomSnapshot, RoomSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Create a room (or reclaim an empty one) as its host
    #[serde(rename_all = "camelCase")]
    RegisterHost {
        room_id: String,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        password: Option<String>,
        /// Only honoured for admin identities asking for moderator
        #[serde(default)]
        role: Option<ParticipantRole>,
    },
    LeaveRoom {},
    GetRooms {},
    #[serde(rename_all = "camelCase")]
    GetRoomStatus {
        room_id: String,
    },
    #[serde(alias = "ping")]
    Heartbeat {},
    #[serde(rename_all = "camelCase")]
    ScreenFrame {
        room_id: String,
        image_data: Value,
        #[serde(default)]
        settings: Option<SettingsPatch>,
    },
    #[serde(rename_all = "camelCase")]
    MouseEvent {
        room_id: String,
        #[serde(rename = "type")]
        kind: String,
        x: f64,
        y: f64,
        #[serde(default)]
        button: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    KeyboardEvent {
        room_id: String,
        #[serde(rename = "type")]
        kind: String,
        key: String,
        #[serde(default)]
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        message: String,
    },
    #[serde(alias = "room-settings", rename_all = "camelCase")]
    UpdateRoomSettings {
        room_id: String,
        settings: SettingsPatch,
    },
    #[serde(rename_all = "camelCase")]
    SetPermissions {
        room_id: String,
        user_id: String,
        permission: Capability,
        value: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetRole {
        room_id: String,
        user_id: String,
        role: ParticipantRole,
    },
    #[serde(rename_all = "camelCase")]
    KickParticipant {
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    WhiteboardDraw {
        room_id: String,
        draw_data: Value,
    },
    #[serde(rename_all = "camelCase")]
    UploadFile {
        room_id: String,
        filename: String,
        file_data: String,
    },
}

impl ClientEvent {
    /// Parse a text frame. Payload-less events may omit `data`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_str(text)?;
        if let Some(frame) = value.as_object_mut() {
            if frame.get("data").map_or(true, Value::is_null) {
                frame.insert("data".to_string(), Value::Object(Default::default()));
            }
        }
        serde_json::from_value(value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RegisterHost { .. } => "register-host",
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom {} => "leave-room",
            ClientEvent::GetRooms {} => "get-rooms",
            ClientEvent::GetRoomStatus { .. } => "get-room-status",
            ClientEvent::Heartbeat {} => "heartbeat",
            ClientEvent::ScreenFrame { .. } => "screen-frame",
            ClientEvent::MouseEvent { .. } => "mouse-event",
            ClientEvent::KeyboardEvent { .. } => "keyboard-event",
            ClientEvent::ChatMessage { .. } => "chat-message",
            ClientEvent::UpdateRoomSettings { .. } => "update-room-settings",
            ClientEvent::SetPermissions { .. } => "set-permissions",
            ClientEvent::SetRole { .. } => "set-role",
            ClientEvent::KickParticipant { .. } => "kick-participant",
            ClientEvent::WhiteboardDraw { .. } => "whiteboard-draw",
            ClientEvent::UploadFile { .. } => "upload-file",
        }
    }
}

/// Identity of the participant a relayed event came from, stamped by the
/// server. Flattened into the relayed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderStamp {
    pub sender_id: String,
    pub sender_name: String,
    pub color: String,
    pub timestamp: u64,
}

/// Server-to-Client events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First frame on every connection
    Connected { user: Identity },
    HostConfirmed { room: RoomSnapshot },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room: RoomSnapshot,
        user_color: String,
        user_data: ParticipantInfo,
    },
    UserJoined { user: ParticipantInfo },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    HostChanged {
        room_id: String,
        new_host_id: String,
        previous_host_id: String,
    },
    SystemMessage {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        timestamp: u64,
    },
    /// Rejection of one inbound event, sent to its originator only
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    RoomsList { rooms: Vec<RoomSummary> },
    RoomStatus { room: RoomSummary },
    HeartbeatAck { timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    RoomSettingsUpdated {
        room_id: String,
        settings: RoomSettings,
        updated_by: String,
    },
    #[serde(rename_all = "camelCase")]
    PermissionsUpdated {
        room_id: String,
        user_id: String,
        permission: Capability,
        value: bool,
        updated_by: String,
        permissions: PermissionsSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    RoleChanged {
        room_id: String,
        user_id: String,
        role: ParticipantRole,
        updated_by: String,
    },
    #[serde(rename_all = "camelCase")]
    Kicked { room_id: String, by: String },
    #[serde(rename_all = "camelCase")]
    RoomClosed { room_id: String, reason: String },

    // --- Relayed events, stamped with the sender ---
    #[serde(rename_all = "camelCase")]
    ScreenFrame {
        room_id: String,
        image_data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<RoomSettings>,
        #[serde(flatten)]
        sender: SenderStamp,
    },
    #[serde(rename_all = "camelCase")]
    MouseEvent {
        room_id: String,
        #[serde(rename = "type")]
        kind: String,
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        button: Option<u8>,
        #[serde(flatten)]
        sender: SenderStamp,
    },
    #[serde(rename_all = "camelCase")]
    KeyboardEvent {
        room_id: String,
        #[serde(rename = "type")]
        kind: String,
        key: String,
        code: String,
        #[serde(flatten)]
        sender: SenderStamp,
    },
    ChatMessage(ChatMessage),
    #[serde(rename_all = "camelCase")]
    WhiteboardDraw {
        room_id: String,
        draw_data: Value,
        #[serde(flatten)]
        sender: SenderStamp,
    },
    #[serde(rename_all = "camelCase")]
    UploadFile {
        room_id: String,
        file: FileRecord,
        file_data: String,
        #[serde(flatten)]
        sender: SenderStamp,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::HostConfirmed { .. } => "host-confirmed",
            ServerEvent::RoomJoined { .. } => "room-joined",
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::UserLeft { .. } => "user-left",
            ServerEvent::HostChanged { .. } => "host-changed",
            ServerEvent::SystemMessage { .. } => "system-message",
            ServerEvent::Error { .. } => "error",
            ServerEvent::RoomsList { .. } => "rooms-list",
            ServerEvent::RoomStatus { .. } => "room-status",
            ServerEvent::HeartbeatAck { .. } => "heartbeat-ack",
            ServerEvent::RoomSettingsUpdated { .. } => "room-settings-updated",
            ServerEvent::PermissionsUpdated { .. } => "permissions-updated",
            ServerEvent::RoleChanged { .. } => "role-changed",
            ServerEvent::Kicked { .. } => "kicked",
            ServerEvent::RoomClosed { .. } => "room-closed",
            ServerEvent::ScreenFrame { .. } => "screen-frame",
            ServerEvent::MouseEvent { .. } => "mouse-event",
            ServerEvent::KeyboardEvent { .. } => "keyboard-event",
            ServerEvent::ChatMessage(_) => "chat-message",
            ServerEvent::WhiteboardDraw { .. } => "whiteboard-draw",
            ServerEvent::UploadFile { .. } => "upload-file",
        }
    }

    pub fn error(code: &str, message: impl Into<String>, event: Option<&str>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
            event: event.map(String::from),
        }
    }
}
