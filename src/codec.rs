//! Bidirectional codec between [`Message`] values and wire bytes.
//!
//! The wire format is self-describing JSON: an `@class` discriminator plus
//! the variant's fields, with UUIDs in canonical text form and timestamps as
//! ISO-8601 instants. Unknown fields are tolerated on decode so newer peers
//! can add fields without breaking older ones; unknown discriminators are
//! rejected, which restricts decoding to the known message variants.

use crate::error::LinkError;
use crate::messages::Message;
use tracing::error;

/// JSON codec with an embedded type discriminator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encodes a message to wire bytes.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, LinkError> {
        serde_json::to_vec(message).map_err(|e| {
            error!("failed to encode {} message: {e}", message.type_tag());
            LinkError::Serialization(e)
        })
    }

    /// Decodes wire bytes into the most specific known variant.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, LinkError> {
        serde_json::from_slice(bytes).map_err(|e| {
            error!("failed to decode message from {} bytes: {e}", bytes.len());
            LinkError::Deserialization(e.to_string())
        })
    }
}
