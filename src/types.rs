// src/types.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

/// Engine-independent view of a peer connection's lifecycle.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    Receiver,
    Forwarder,
    Hybrid,
}

impl Role {
    pub fn is_forwarding(&self) -> bool {
        matches!(self, Role::Forwarder | Role::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Receiver => "receiver",
            Role::Forwarder => "forwarder",
            Role::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub source_node_id: String,
    pub media_type: MediaType,
}

/// Output of one role-assigner evaluation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RoleAssignment {
    pub role: Role,
    pub streams: Vec<StreamInfo>,
}

impl RoleAssignment {
    pub fn receiver() -> Self {
        Self::default()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.iter().map(|s| s.stream_id.clone()).collect()
    }
}
