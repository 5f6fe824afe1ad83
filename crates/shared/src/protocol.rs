//! Real-time socket protocol shared by the three devchat connections.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three independent real-time connections a session holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionName {
    /// Direct messages
    Dm,
    /// Workspace channels
    Channel,
    /// Friend list
    Friends,
}

impl ConnectionName {
    pub const ALL: [ConnectionName; 3] = [
        ConnectionName::Dm,
        ConnectionName::Channel,
        ConnectionName::Friends,
    ];

    /// Socket path relative to the websocket base URL
    pub fn path(&self) -> &'static str {
        match self {
            ConnectionName::Dm => "/ws/dm",
            ConnectionName::Channel => "/ws/channels",
            ConnectionName::Friends => "/ws/friends",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionName::Dm => "dm",
            ConnectionName::Channel => "channel",
            ConnectionName::Friends => "friends",
        }
    }
}

impl fmt::Display for ConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Start receiving events for a scope (e.g. a workspace id)
    Subscribe { scope: String },
    Unsubscribe { scope: String },
}

/// Domain change notifications pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "channel.created", rename_all = "camelCase")]
    ChannelCreated {
        workspace_id: String,
        channel_id: String,
    },
    #[serde(rename = "channel.deleted", rename_all = "camelCase")]
    ChannelDeleted {
        workspace_id: String,
        channel_id: String,
    },
    #[serde(rename = "channel.members", rename_all = "camelCase")]
    ChannelMembersChanged {
        workspace_id: String,
        channel_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "workspace.roles")]
    WorkspaceRolesChanged {},
    #[serde(rename = "friends.changed", rename_all = "camelCase")]
    FriendsChanged {
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "dm.message", rename_all = "camelCase")]
    DirectMessage {
        conversation_id: String,
        message_id: String,
    },
}

impl ServerEvent {
    /// Wire name of the event, used as the listener key
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ChannelCreated { .. } => "channel.created",
            ServerEvent::ChannelDeleted { .. } => "channel.deleted",
            ServerEvent::ChannelMembersChanged { .. } => "channel.members",
            ServerEvent::WorkspaceRolesChanged {} => "workspace.roles",
            ServerEvent::FriendsChanged { .. } => "friends.changed",
            ServerEvent::DirectMessage { .. } => "dm.message",
        }
    }

    /// Workspace the event is scoped to, if any
    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ChannelCreated { workspace_id, .. }
            | ServerEvent::ChannelDeleted { workspace_id, .. }
            | ServerEvent::ChannelMembersChanged { workspace_id, .. } => Some(workspace_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_event_frame() {
        let frame = r#"{
            "id": "e1",
            "type": "channel.created",
            "data": { "workspaceId": "W2", "channelId": "c9" },
            "ts": "2024-05-01T10:00:00Z"
        }"#;

        let envelope: WsEnvelope<ServerEvent> = serde_json::from_str(frame).unwrap();
        assert_eq!(envelope.payload.name(), "channel.created");
        assert_eq!(envelope.payload.workspace_id(), Some("W2"));
    }

    #[test]
    fn parses_unit_like_roles_event() {
        let frame = r#"{"id":"e2","type":"workspace.roles","data":{},"ts":"2024-05-01T10:00:00Z"}"#;
        let envelope: WsEnvelope<ServerEvent> = serde_json::from_str(frame).unwrap();
        assert_eq!(envelope.payload, ServerEvent::WorkspaceRolesChanged {});
        assert_eq!(envelope.payload.workspace_id(), None);
    }

    #[test]
    fn subscribe_command_serializes_as_tagged_frame() {
        let envelope = WsEnvelope::new(ClientCommand::Subscribe {
            scope: "W1".to_string(),
        });
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["data"]["scope"], "W1");
    }
}
