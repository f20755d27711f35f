//! Message envelope model and well-known variants.
//!
//! Every payload that crosses the wire is one of the variants of [`Message`],
//! a tagged sum type whose `@class` discriminator picks the concrete variant
//! at decode time. Variants embed a flattened [`MessageMeta`] carrying the
//! envelope identity: a globally unique message id (doubling as the
//! request/response correlation id), the creation instant, and the id of the
//! node that published this envelope.

use crate::error::LinkError;
use crate::moderation::ModerationActionMessage;
use crate::types::{EventPriority, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope identity shared by every message variant.
///
/// `message_id` and `timestamp` are set once at construction and never
/// mutated. `source_node_id` is always the publisher of *this envelope*,
/// which for republished event wrappers can differ from the originator
/// recorded inside the wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sourceServerId")]
    pub source_node_id: NodeId,
}

impl MessageMeta {
    /// Fresh identity for a new message from `source`.
    pub fn new(source: NodeId) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_node_id: source,
        }
    }

    /// Identity for a response correlated to `request`: the response reuses
    /// the request's message id so the sender's pending waiter matches it.
    pub fn reply_to(request: &MessageMeta, source: NodeId) -> Self {
        Self {
            message_id: request.message_id,
            timestamp: Utc::now(),
            source_node_id: source,
        }
    }
}

/// Plain text message with a free-form category for filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleTextMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    pub content: String,
    pub category: String,
}

impl SimpleTextMessage {
    pub fn new(source: NodeId, content: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            meta: MessageMeta::new(source),
            content: content.into(),
            category: category.into(),
        }
    }
}

/// Request expecting a correlated [`ResponseMessage`] from the target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl RequestMessage {
    pub fn new(source: NodeId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            meta: MessageMeta::new(source),
            action: action.into(),
            payload,
        }
    }
}

/// Response to a [`RequestMessage`]; its message id equals the request's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(default)]
    pub payload: Value,
}

impl ResponseMessage {
    /// Builds the response correlated to `request`.
    pub fn reply_to(request: &RequestMessage, source: NodeId, payload: Value) -> Self {
        Self {
            meta: MessageMeta::reply_to(&request.meta, source),
            payload,
        }
    }
}

/// Wrapper carrying a serialized network event across nodes.
///
/// `original_node_id` identifies the originator of the inner event and is
/// preserved on every hop; `meta.source_node_id` is whoever published this
/// particular envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEventMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(rename = "eventTypeString")]
    pub event_type: String,
    #[serde(rename = "eventDataJson")]
    pub event_payload: String,
    pub priority: EventPriority,
    #[serde(rename = "originalServerId")]
    pub original_node_id: NodeId,
}

impl NetworkEventMessage {
    pub fn new(
        source: NodeId,
        event_type: impl Into<String>,
        event_payload: String,
        priority: EventPriority,
        original_node_id: NodeId,
    ) -> Self {
        Self {
            meta: MessageMeta::new(source),
            event_type: event_type.into(),
            event_payload,
            priority,
            original_node_id,
        }
    }
}

/// Notifies peers that a player's data changed so they can refresh caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerDataUpdateMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(rename = "playerId")]
    pub player_id: Uuid,
    #[serde(rename = "dataType")]
    pub data_type: String,
    #[serde(rename = "serializedData")]
    pub serialized_data: String,
    pub version: u64,
}

impl PlayerDataUpdateMessage {
    pub fn new(
        source: NodeId,
        player_id: Uuid,
        data_type: impl Into<String>,
        serialized_data: impl Into<String>,
        version: u64,
    ) -> Self {
        Self {
            meta: MessageMeta::new(source),
            player_id,
            data_type: data_type.into(),
            serialized_data: serialized_data.into(),
            version,
        }
    }
}

/// The closed set of wire messages.
///
/// The `@class` values are stable wire names; renaming one is a protocol
/// break for every peer still running the old name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@class")]
pub enum Message {
    #[serde(rename = "shardlink.messages.SimpleTextMessage")]
    SimpleText(SimpleTextMessage),
    #[serde(rename = "shardlink.messages.RequestMessage")]
    Request(RequestMessage),
    #[serde(rename = "shardlink.messages.ResponseMessage")]
    Response(ResponseMessage),
    #[serde(rename = "shardlink.events.NetworkEventMessage")]
    NetworkEvent(NetworkEventMessage),
    #[serde(rename = "shardlink.messages.PlayerDataUpdateMessage")]
    PlayerDataUpdate(PlayerDataUpdateMessage),
    #[serde(rename = "shardlink.moderation.ModerationActionMessage")]
    ModerationAction(ModerationActionMessage),
}

/// Discriminant of a [`Message`], used as the handler dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SimpleText,
    Request,
    Response,
    NetworkEvent,
    PlayerDataUpdate,
    ModerationAction,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SimpleText(_) => MessageKind::SimpleText,
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::NetworkEvent(_) => MessageKind::NetworkEvent,
            Message::PlayerDataUpdate(_) => MessageKind::PlayerDataUpdate,
            Message::ModerationAction(_) => MessageKind::ModerationAction,
        }
    }

    /// The stable `@class` discriminator for this variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::SimpleText(_) => SimpleTextMessage::TYPE_TAG,
            Message::Request(_) => RequestMessage::TYPE_TAG,
            Message::Response(_) => ResponseMessage::TYPE_TAG,
            Message::NetworkEvent(_) => NetworkEventMessage::TYPE_TAG,
            Message::PlayerDataUpdate(_) => PlayerDataUpdateMessage::TYPE_TAG,
            Message::ModerationAction(_) => ModerationActionMessage::TYPE_TAG,
        }
    }

    pub fn meta(&self) -> &MessageMeta {
        match self {
            Message::SimpleText(m) => &m.meta,
            Message::Request(m) => &m.meta,
            Message::Response(m) => &m.meta,
            Message::NetworkEvent(m) => &m.meta,
            Message::PlayerDataUpdate(m) => &m.meta,
            Message::ModerationAction(m) => &m.meta,
        }
    }
}

/// Typed bridge between a variant struct and the [`Message`] sum type.
///
/// Typed channels, handler registration, and the request correlator all use
/// this to move between erased dispatch and concrete types without
/// reflection.
pub trait MessageVariant: Sized + Send + Sync + 'static {
    const KIND: MessageKind;
    const TYPE_TAG: &'static str;

    fn into_message(self) -> Message;

    /// Recovers the concrete variant, or `None` if `message` is a different
    /// variant.
    fn from_message(message: Message) -> Option<Self>;

    fn meta(&self) -> &MessageMeta;
}

macro_rules! impl_message_variant {
    ($ty:ty, $kind:ident, $tag:literal) => {
        impl MessageVariant for $ty {
            const KIND: MessageKind = MessageKind::$kind;
            const TYPE_TAG: &'static str = $tag;

            fn into_message(self) -> Message {
                Message::$kind(self)
            }

            fn from_message(message: Message) -> Option<Self> {
                match message {
                    Message::$kind(inner) => Some(inner),
                    _ => None,
                }
            }

            fn meta(&self) -> &MessageMeta {
                &self.meta
            }
        }
    };
}

impl_message_variant!(
    SimpleTextMessage,
    SimpleText,
    "shardlink.messages.SimpleTextMessage"
);
impl_message_variant!(RequestMessage, Request, "shardlink.messages.RequestMessage");
impl_message_variant!(
    ResponseMessage,
    Response,
    "shardlink.messages.ResponseMessage"
);
impl_message_variant!(
    NetworkEventMessage,
    NetworkEvent,
    "shardlink.events.NetworkEventMessage"
);
impl_message_variant!(
    PlayerDataUpdateMessage,
    PlayerDataUpdate,
    "shardlink.messages.PlayerDataUpdateMessage"
);
impl_message_variant!(
    ModerationActionMessage,
    ModerationAction,
    "shardlink.moderation.ModerationActionMessage"
);

impl Message {
    /// Convenience for erased call sites that only need the envelope decoded.
    pub fn decode_from_slice(bytes: &[u8]) -> Result<Self, LinkError> {
        serde_json::from_slice(bytes).map_err(|e| LinkError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn reply_meta_reuses_the_request_id() {
        let request = RequestMessage::new(node("a"), "ping", Value::Null);
        let response = ResponseMessage::reply_to(&request, node("b"), Value::Null);
        assert_eq!(response.meta.message_id, request.meta.message_id);
        assert_eq!(response.meta.source_node_id.as_str(), "b");
    }

    #[test]
    fn wrapper_preserves_originator_separately_from_publisher() {
        let wrapper = NetworkEventMessage::new(
            node("relay"),
            "shardlink.events.ServerStatusEvent",
            "{}".to_string(),
            EventPriority::High,
            node("origin"),
        );
        assert_eq!(wrapper.meta.source_node_id.as_str(), "relay");
        assert_eq!(wrapper.original_node_id.as_str(), "origin");
    }

    #[test]
    fn kind_and_tag_agree() {
        let m = SimpleTextMessage::new(node("a"), "hi", "chat").into_message();
        assert_eq!(m.kind(), MessageKind::SimpleText);
        assert_eq!(m.type_tag(), "shardlink.messages.SimpleTextMessage");
    }

    #[test]
    fn from_message_rejects_other_variants() {
        let m = SimpleTextMessage::new(node("a"), "hi", "chat").into_message();
        assert!(ResponseMessage::from_message(m.clone()).is_none());
        assert!(SimpleTextMessage::from_message(m).is_some());
    }
}
