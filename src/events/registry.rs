//! Event type registry: name ↔ variant mapping with pluggable decoders.
//!
//! Cross-node events travel as a type-name string plus a serialized payload.
//! The registry maps each name to decoders that can rebuild the concrete
//! event on the receiving side: the primary path is JSON via serde, with an
//! optional custom decoder as a fallback for payloads that are not JSON (or
//! that JSON decoding rejects). Registrations may happen concurrently with
//! encode/decode; the mapping is observable atomically.

use crate::error::LinkError;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Free-form string-keyed metadata carried by every network event.
pub type EventMetadata = HashMap<String, Value>;

/// A domain event that can be observed by every other node in the fleet.
///
/// Implementors are plain serde structs. `TYPE_NAME` is the fully-qualified
/// discriminator that rides on the wire wrapper; it must be stable across
/// versions and unique across the fleet.
pub trait NetworkEvent:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Stable fully-qualified discriminator for this variant.
    const TYPE_NAME: &'static str;

    /// The node that originated this domain event.
    fn source_node(&self) -> &NodeId;

    /// When the event was created.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Free-form metadata attached at creation.
    fn metadata(&self) -> &EventMetadata;
}

/// Object-safe view of a reconstructed event, used by erased listener
/// dispatch. Implemented for every [`NetworkEvent`] automatically.
pub trait AnyNetworkEvent: Any + std::fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn source_node(&self) -> &NodeId;
    fn as_any(&self) -> &dyn Any;
}

impl<E: NetworkEvent> AnyNetworkEvent for E {
    fn type_name(&self) -> &'static str {
        E::TYPE_NAME
    }

    fn source_node(&self) -> &NodeId {
        NetworkEvent::source_node(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type BoxedEvent = Box<dyn AnyNetworkEvent>;
type Decoder = Arc<dyn Fn(&str) -> Result<BoxedEvent, LinkError> + Send + Sync>;

struct RegistryEntry {
    type_id: TypeId,
    json: Decoder,
    custom: Option<Decoder>,
}

/// Thread-safe registry of event types known to this node.
///
/// Built-in variants are registered at construction; hosts add their own
/// through [`EventRegistry::register`] or
/// [`EventRegistry::register_with_decoder`]. Exactly one entry exists per
/// type name; re-registering replaces it.
pub struct EventRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl EventRegistry {
    pub fn new() -> Self {
        let registry = Self {
            entries: DashMap::new(),
        };
        registry.register::<crate::events::ServerStatusEvent>();
        registry.register::<crate::events::PlayerNetworkEvent>();
        info!("registered built-in event types: ServerStatusEvent, PlayerNetworkEvent");
        registry
    }

    /// Registers `E` with the JSON codec as its only decode path.
    pub fn register<E: NetworkEvent>(&self) {
        self.insert::<E>(None);
    }

    /// Registers `E` with a custom decoder used when the payload is not a
    /// JSON object or when JSON decoding fails.
    pub fn register_with_decoder<E, D>(&self, decoder: D)
    where
        E: NetworkEvent,
        D: Fn(&str) -> Result<E, LinkError> + Send + Sync + 'static,
    {
        let custom: Decoder =
            Arc::new(move |payload| decoder(payload).map(|e| Box::new(e) as BoxedEvent));
        self.insert::<E>(Some(custom));
    }

    fn insert<E: NetworkEvent>(&self, custom: Option<Decoder>) {
        let json: Decoder = Arc::new(|payload| {
            serde_json::from_str::<E>(payload)
                .map(|e| Box::new(e) as BoxedEvent)
                .map_err(|e| LinkError::Deserialization(e.to_string()))
        });
        self.entries.insert(
            E::TYPE_NAME.to_string(),
            RegistryEntry {
                type_id: TypeId::of::<E>(),
                json,
                custom,
            },
        );
        debug!("registered event type {}", E::TYPE_NAME);
    }

    /// Encodes an event payload for the wire wrapper.
    ///
    /// The primary path is JSON; if that fails the event's textual rendering
    /// is used so a receiver with a custom decoder can still reconstruct it.
    pub fn encode_event<E: NetworkEvent>(&self, event: &E) -> Result<String, LinkError> {
        match serde_json::to_string(event) {
            Ok(json) => Ok(json),
            Err(json_err) => {
                debug!(
                    "JSON encoding failed for {}, falling back to textual form: {json_err}",
                    E::TYPE_NAME
                );
                let text = format!("{event:?}");
                if text.trim().is_empty() {
                    Err(LinkError::Serialization(json_err))
                } else {
                    Ok(text)
                }
            }
        }
    }

    /// Rebuilds an event from its type name and serialized payload.
    ///
    /// Payloads that look like a JSON object take the JSON path first and
    /// fall back to the custom decoder on failure; anything else goes to the
    /// custom decoder directly.
    pub fn decode_event(&self, type_name: &str, payload: &str) -> Result<BoxedEvent, LinkError> {
        // Clone the decoders out so no registry lock is held while they run.
        let (json, custom) = {
            let entry = self
                .entries
                .get(type_name)
                .ok_or_else(|| LinkError::UnknownEventType(type_name.to_string()))?;
            (Arc::clone(&entry.json), entry.custom.clone())
        };

        let trimmed = payload.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            match json(trimmed) {
                Ok(event) => Ok(event),
                Err(json_err) => match &custom {
                    Some(custom) => {
                        debug!(
                            "JSON decoding failed for {type_name}, trying custom decoder: {json_err}"
                        );
                        custom(payload)
                    }
                    None => Err(json_err),
                },
            }
        } else {
            match &custom {
                Some(custom) => custom(payload),
                None => Err(LinkError::Deserialization(format!(
                    "payload for {type_name} is not JSON and no custom decoder is registered"
                ))),
            }
        }
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// The Rust type registered under `type_name`, if any.
    pub fn event_type_id(&self, type_name: &str) -> Option<TypeId> {
        self.entries.get(type_name).map(|entry| entry.type_id)
    }

    pub fn registered_type_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
