//! Typed cross-node messaging over the transport layer.
//!
//! The messaging service owns a node's two standing subscriptions — its
//! direct channel `direct:<node>` and the shared `broadcast` channel — and
//! provides typed dispatch on top of them: per-variant handler registration,
//! point-to-point sends, fleet-wide broadcasts, and request/response
//! exchanges correlated by message id. Typed pub/sub channels for
//! application-chosen names are created through [`MessagingService::create_channel`].
//!
//! Incoming payloads flow through a fixed pipeline: decode, drop loopback
//! envelopes (our own node id), complete a pending request waiter if the
//! message id matches, otherwise dispatch to the handler registered for the
//! exact variant, falling back to the default handler. Handler failures are
//! logged and never propagate back to the transport.

mod channel;

pub use channel::TypedChannel;

use crate::codec::MessageCodec;
use crate::error::LinkError;
use crate::messages::{Message, MessageKind, MessageVariant};
use crate::transport::{SubscriptionHandler, Transport};
use crate::types::NodeId;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The channel every node subscribes to for fleet-wide messages.
pub const BROADCAST_CHANNEL: &str = "broadcast";

/// The point-to-point channel dedicated to `node`.
pub fn direct_channel(node: &NodeId) -> String {
    format!("direct:{node}")
}

type ErasedHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), LinkError>> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    name: String,
    invoke: ErasedHandler,
}

fn erase_handler<V, F, Fut>(name: String, handler: F) -> HandlerEntry
where
    V: MessageVariant,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    HandlerEntry {
        name,
        invoke: Arc::new(move |message: Message| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                match V::from_message(message) {
                    Some(variant) => handler(variant).await,
                    None => Err(LinkError::Handler(
                        "dispatched message did not match the handler variant".to_string(),
                    )),
                }
            })
        }),
    }
}

/// Cross-node messaging service bound to one node id.
///
/// Shared between collaborators as `Arc<MessagingService>`; the event service
/// uses it without owning it, so shutting down the event service leaves
/// messaging running.
pub struct MessagingService {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    codec: MessageCodec,
    handlers: DashMap<MessageKind, HandlerEntry>,
    default_handler: RwLock<Option<HandlerEntry>>,
    pending: DashMap<Uuid, oneshot::Sender<Message>>,
    channels: DashMap<String, MessageKind>,
    initialized: AtomicBool,
    weak_self: Weak<MessagingService>,
}

impl MessagingService {
    /// Creates a messaging service over `transport` for `node_id`.
    pub fn new(node_id: NodeId, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            node_id,
            transport,
            codec: MessageCodec::new(),
            handlers: DashMap::new(),
            default_handler: RwLock::new(None),
            pending: DashMap::new(),
            channels: DashMap::new(),
            initialized: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Subscribes the direct and broadcast channels. Idempotent.
    pub async fn initialize(&self) -> Result<(), LinkError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            debug!("messaging already initialized for {}", self.node_id);
            return Ok(());
        }

        let direct = direct_channel(&self.node_id);
        self.transport
            .subscribe(&direct, self.incoming_handler(direct.clone()))
            .await?;
        self.transport
            .subscribe(
                BROADCAST_CHANNEL,
                self.incoming_handler(BROADCAST_CHANNEL.to_string()),
            )
            .await?;

        info!("📡 messaging initialized for node {}", self.node_id);
        Ok(())
    }

    /// Drops the standing subscriptions and fails all pending requests with
    /// [`LinkError::Cancelled`]. Idempotent.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.transport
            .unsubscribe(&direct_channel(&self.node_id))
            .await?;
        self.transport.unsubscribe(BROADCAST_CHANNEL).await?;

        // Dropping the senders wakes every waiter with a cancellation.
        self.pending.clear();
        self.channels.clear();

        info!("messaging shut down for node {}", self.node_id);
        Ok(())
    }

    fn incoming_handler(&self, channel: String) -> SubscriptionHandler {
        let weak = self.weak_self.clone();
        Arc::new(move |bytes: Vec<u8>| {
            let Some(service) = weak.upgrade() else {
                return;
            };
            let channel = channel.clone();
            tokio::spawn(async move {
                service.handle_incoming(bytes, &channel).await;
            });
        })
    }

    async fn handle_incoming(&self, bytes: Vec<u8>, channel: &str) {
        let message = match self.codec.decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                error!("dropping undecodable payload on {channel}: {e}");
                return;
            }
        };

        if message.meta().source_node_id == self.node_id {
            debug!("ignoring loopback envelope on {channel}");
            return;
        }

        let message_id = message.meta().message_id;
        if let Some((_, waiter)) = self.pending.remove(&message_id) {
            debug!("correlated response {message_id} delivered");
            let _ = waiter.send(message);
            return;
        }

        let handler = self
            .handlers
            .get(&message.kind())
            .map(|entry| entry.value().clone());
        let handler = match handler {
            Some(entry) => Some(entry),
            None => self.default_handler.read().await.clone(),
        };

        match handler {
            Some(entry) => {
                if let Err(e) = (entry.invoke)(message).await {
                    error!("handler {} failed: {e}", entry.name);
                }
            }
            None => debug!("no handler registered for {} message", message.type_tag()),
        }
    }

    /// Publishes `message` on the target node's direct channel.
    pub async fn send_to_node(&self, target: &NodeId, message: Message) -> Result<(), LinkError> {
        let bytes = self.codec.encode(&message)?;
        self.transport
            .publish(&direct_channel(target), &bytes)
            .await?;
        debug!(
            "sent {} message {} to {target}",
            message.type_tag(),
            message.meta().message_id
        );
        Ok(())
    }

    /// Publishes `message` on the broadcast channel.
    pub async fn broadcast(&self, message: Message) -> Result<(), LinkError> {
        let bytes = self.codec.encode(&message)?;
        self.transport.publish(BROADCAST_CHANNEL, &bytes).await?;
        debug!(
            "broadcast {} message {}",
            message.type_tag(),
            message.meta().message_id
        );
        Ok(())
    }

    /// Sends a request to `target` and waits for the correlated response.
    ///
    /// The response is any message whose id equals the request's id,
    /// recovered as `R`; a different variant fails with
    /// [`LinkError::ProtocolMismatch`]. If nothing arrives within `timeout`
    /// the pending entry is removed and the call fails with
    /// [`LinkError::Timeout`].
    pub async fn send_request<R>(
        &self,
        target: &NodeId,
        request: impl MessageVariant,
        timeout: Duration,
    ) -> Result<R, LinkError>
    where
        R: MessageVariant,
    {
        let message = request.into_message();
        let correlation_id = message.meta().message_id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);

        if let Err(e) = self.send_to_node(target, message).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                let actual = response.type_tag().to_string();
                R::from_message(response).ok_or_else(|| {
                    warn!("response to {correlation_id} had unexpected type {actual}");
                    LinkError::ProtocolMismatch {
                        expected: R::TYPE_TAG,
                        actual,
                    }
                })
            }
            Ok(Err(_)) => Err(LinkError::Cancelled),
            Err(_) => {
                self.pending.remove(&correlation_id);
                warn!(
                    "request {correlation_id} to {target} timed out after {} ms",
                    timeout.as_millis()
                );
                Err(LinkError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Registers `handler` for the exact variant `V`, replacing any previous
    /// handler for that variant.
    pub fn register_handler<V, F, Fut>(&self, handler: F)
    where
        V: MessageVariant,
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        let name = format!("{}@{}", V::TYPE_TAG, self.node_id);
        self.handlers.insert(V::KIND, erase_handler(name, handler));
        debug!("registered handler for {} on {}", V::TYPE_TAG, self.node_id);
    }

    /// Removes the handler for `kind`.
    pub fn unregister_handler(&self, kind: MessageKind) {
        self.handlers.remove(&kind);
    }

    /// Registers the fallback handler invoked for variants with no exact
    /// handler registered.
    pub async fn register_default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let entry = HandlerEntry {
            name: format!("default@{}", self.node_id),
            invoke: Arc::new(move |message: Message| {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(message).await })
            }),
        };
        *self.default_handler.write().await = Some(entry);
    }

    /// Creates a typed pub/sub channel carrying the variant `V` on an
    /// application-chosen channel name.
    pub fn create_channel<V: MessageVariant>(
        &self,
        name: impl Into<String>,
    ) -> Result<TypedChannel<V>, LinkError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LinkError::InvalidConfiguration(
                "channel name cannot be empty".to_string(),
            ));
        }
        self.channels.insert(name.clone(), V::KIND);
        Ok(TypedChannel::new(
            name,
            self.node_id.clone(),
            Arc::clone(&self.transport),
        ))
    }

    /// Number of request waiters currently outstanding.
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }
}
