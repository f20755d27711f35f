//! # shardlink
//!
//! Cross-node event and message distribution for fleets of cooperating game
//! servers. Each node hosts one instance of the library, connects to a shared
//! pub/sub + key/value broker through a pluggable [`Transport`], and exchanges
//! typed messages with its peers: direct sends, fleet-wide broadcasts,
//! request/response exchanges with timeouts, and high-level network events
//! observed by every other node.
//!
//! ## Layers
//!
//! - [`Transport`] — the broker contract: publish/subscribe over opaque
//!   channels plus a small key/value surface. [`MemoryBus`] provides an
//!   in-process implementation for tests and single-host setups.
//! - [`MessagingService`] — typed dispatch over the node's direct channel and
//!   the shared broadcast channel, loopback suppression, a request/response
//!   correlator, and typed pub/sub channels.
//! - [`CrossServerEventService`] — typed-event broadcasting with local
//!   listener fan-out, a circuit breaker, bounded exponential retry, loop
//!   prevention on the originator, graceful degradation, and metrics.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardlink::{MemoryBus, NodeId, ServerStatus, ServerStatusEvent, Shardlink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), shardlink::LinkError> {
//!     let bus = MemoryBus::new();
//!     let node = Shardlink::new(NodeId::new("lobby-1")?, Arc::new(bus.endpoint()))?;
//!     node.initialize().await?;
//!
//!     node.events().register_event_listener::<ServerStatusEvent, _>(|event| {
//!         println!("{} is now {:?}", event.source_node_id, event.status);
//!         Ok(())
//!     });
//!
//!     let status = ServerStatusEvent::new(
//!         node.node_id().clone(),
//!         ServerStatus::Online,
//!         "boot complete",
//!     );
//!     node.events().broadcast_event(status).await?;
//!
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Events are plain serde structs implementing [`NetworkEvent`]; custom types
//! are registered on the event service and travel inside a self-describing
//! wrapper that preserves the originator and priority on every hop.

pub mod codec;
pub mod error;
pub mod events;
pub mod messages;
pub mod messaging;
pub mod moderation;
pub mod transport;
pub mod types;

pub use codec::MessageCodec;
pub use error::LinkError;
pub use events::{
    AnyNetworkEvent, CircuitBreaker, CircuitState, CrossServerEventService, EventMetadata,
    EventMetrics, EventRegistry, EventServiceConfig, ListenerId, MetricsSnapshot, NetworkEvent,
    PlayerEventKind, PlayerNetworkEvent, RetryManager, RetryPolicy, ServerStatus,
    ServerStatusEvent,
};
pub use messages::{
    Message, MessageKind, MessageMeta, MessageVariant, NetworkEventMessage,
    PlayerDataUpdateMessage, RequestMessage, ResponseMessage, SimpleTextMessage,
};
pub use messaging::{direct_channel, MessagingService, TypedChannel, BROADCAST_CHANNEL};
pub use moderation::{
    ModerationAction, ModerationActionMessage, ModerationService, NetworkBan, NetworkKick,
    NetworkMute, NetworkWarning,
};
pub use transport::{MemoryBus, MemoryTransport, SubscriptionHandler, Transport};
pub use types::{EventPriority, NodeId};

use std::sync::Arc;

/// Owning facade wiring a node's transport, messaging, and event service.
///
/// Construction wires the services together; [`Shardlink::initialize`]
/// connects the transport and brings the services up in order, and
/// [`Shardlink::shutdown`] tears them down in reverse. Hosts that need finer
/// control can build the services directly.
pub struct Shardlink {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    messaging: Arc<MessagingService>,
    events: Arc<CrossServerEventService>,
}

impl Shardlink {
    /// Builds a node with the default event service configuration.
    pub fn new(node_id: NodeId, transport: Arc<dyn Transport>) -> Result<Self, LinkError> {
        Self::with_config(node_id, transport, EventServiceConfig::default())
    }

    /// Builds a node with a custom event service configuration.
    pub fn with_config(
        node_id: NodeId,
        transport: Arc<dyn Transport>,
        config: EventServiceConfig,
    ) -> Result<Self, LinkError> {
        let messaging = MessagingService::new(node_id.clone(), Arc::clone(&transport));
        let events = CrossServerEventService::new(Arc::clone(&messaging), config)?;
        Ok(Self {
            node_id,
            transport,
            messaging,
            events,
        })
    }

    /// Connects the transport and initializes messaging and events.
    pub async fn initialize(&self) -> Result<(), LinkError> {
        self.transport.connect().await?;
        self.messaging.initialize().await?;
        self.events.initialize().await
    }

    /// Shuts the services down and disconnects the transport.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        self.events.shutdown().await?;
        self.messaging.shutdown().await?;
        self.transport.disconnect().await
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    pub fn events(&self) -> &Arc<CrossServerEventService> {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
