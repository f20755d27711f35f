//! Built-in network event types.

use crate::events::registry::{EventMetadata, NetworkEvent};
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Lifecycle state a server can announce to the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Starting,
    Online,
    Maintenance,
    ShuttingDown,
    Offline,
    Error,
}

/// Fired when a server's status changes (startup, shutdown, maintenance...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatusEvent {
    #[serde(rename = "sourceServerId")]
    pub source_node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub status: ServerStatus,
    pub reason: String,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl ServerStatusEvent {
    pub fn new(source: NodeId, status: ServerStatus, reason: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        let mut metadata = EventMetadata::new();
        metadata.insert("statusChange".to_string(), json!(format!("{status:?}")));
        metadata.insert("timestamp".to_string(), json!(timestamp.to_rfc3339()));
        Self {
            source_node_id: source,
            timestamp,
            status,
            reason: reason.into(),
            metadata,
        }
    }

    /// Whether the server is coming up.
    pub fn is_startup(&self) -> bool {
        matches!(self.status, ServerStatus::Starting | ServerStatus::Online)
    }

    /// Whether the server is going away.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.status, ServerStatus::ShuttingDown | ServerStatus::Offline)
    }

    /// Whether the server is accepting players.
    pub fn is_available(&self) -> bool {
        self.status == ServerStatus::Online
    }
}

impl NetworkEvent for ServerStatusEvent {
    const TYPE_NAME: &'static str = "shardlink.events.ServerStatusEvent";

    fn source_node(&self) -> &NodeId {
        &self.source_node_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// What a player did, network-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerEventKind {
    JoinNetwork,
    LeaveNetwork,
    ServerSwitch,
    Kicked,
    Banned,
    Unbanned,
    Achievement,
    ImportantAction,
}

/// Fired when a player performs a significant network action (join, leave,
/// server switch, moderation outcome...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerNetworkEvent {
    #[serde(rename = "sourceServerId")]
    pub source_node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "playerId")]
    pub player_id: Uuid,
    #[serde(rename = "playerName")]
    pub player_name: String,
    #[serde(rename = "eventType")]
    pub kind: PlayerEventKind,
    /// Target node for transfers and switches.
    #[serde(rename = "targetServerId", skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl PlayerNetworkEvent {
    pub fn new(
        source: NodeId,
        player_id: Uuid,
        player_name: impl Into<String>,
        kind: PlayerEventKind,
    ) -> Self {
        Self::with_target(source, player_id, player_name, kind, None)
    }

    pub fn with_target(
        source: NodeId,
        player_id: Uuid,
        player_name: impl Into<String>,
        kind: PlayerEventKind,
        target_node_id: Option<NodeId>,
    ) -> Self {
        let player_name = player_name.into();
        let timestamp = Utc::now();
        let mut metadata = EventMetadata::new();
        metadata.insert("playerId".to_string(), json!(player_id.to_string()));
        metadata.insert("playerName".to_string(), json!(player_name));
        if let Some(target) = &target_node_id {
            metadata.insert("targetServerId".to_string(), json!(target.as_str()));
        }
        Self {
            source_node_id: source,
            timestamp,
            player_id,
            player_name,
            kind,
            target_node_id,
            metadata,
        }
    }

    /// Adds a metadata entry, chainable at construction sites.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_join(&self) -> bool {
        self.kind == PlayerEventKind::JoinNetwork
    }

    pub fn is_leave(&self) -> bool {
        self.kind == PlayerEventKind::LeaveNetwork
    }

    pub fn is_server_switch(&self) -> bool {
        self.kind == PlayerEventKind::ServerSwitch
    }
}

impl NetworkEvent for PlayerNetworkEvent {
    const TYPE_NAME: &'static str = "shardlink.events.PlayerNetworkEvent";

    fn source_node(&self) -> &NodeId {
        &self.source_node_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}
