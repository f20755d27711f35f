//! Typed pub/sub channels over arbitrary channel names.

use crate::codec::MessageCodec;
use crate::error::LinkError;
use crate::messages::MessageVariant;
use crate::transport::{SubscriptionHandler, Transport};
use crate::types::NodeId;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A pub/sub channel that carries exactly one message variant.
///
/// Publishing serializes the variant through the shared codec; subscribing
/// installs a handler that decodes incoming payloads, drops anything that is
/// not a `V`, and drops messages published by the local node before the
/// callback sees them.
pub struct TypedChannel<V: MessageVariant> {
    name: String,
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    codec: MessageCodec,
    subscribed: AtomicBool,
    _variant: PhantomData<fn(V) -> V>,
}

impl<V: MessageVariant> TypedChannel<V> {
    pub(crate) fn new(name: String, node_id: NodeId, transport: Arc<dyn Transport>) -> Self {
        Self {
            name,
            node_id,
            transport,
            codec: MessageCodec::new(),
            subscribed: AtomicBool::new(false),
            _variant: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `message` on this channel.
    pub async fn publish(&self, message: V) -> Result<(), LinkError> {
        let message = message.into_message();
        let bytes = self.codec.encode(&message)?;
        self.transport.publish(&self.name, &bytes).await?;
        debug!(
            "published {} to channel {}",
            message.meta().message_id,
            self.name
        );
        Ok(())
    }

    /// Subscribes `handler` to this channel. Re-subscribing replaces the
    /// installed callback atomically at the transport.
    pub async fn subscribe<F, Fut>(&self, handler: F) -> Result<(), LinkError>
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let codec = self.codec;
        let node_id = self.node_id.clone();
        let channel = self.name.clone();

        let raw: SubscriptionHandler = Arc::new(move |bytes: Vec<u8>| {
            let message = match codec.decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    error!("undecodable payload on channel {channel}: {e}");
                    return;
                }
            };
            if message.meta().source_node_id == node_id {
                return;
            }
            let Some(variant) = V::from_message(message) else {
                debug!("channel {channel} dropped a message of a different variant");
                return;
            };
            let handler = Arc::clone(&handler);
            let channel = channel.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(variant).await {
                    error!("channel {channel} subscriber failed: {e}");
                }
            });
        });

        self.transport.subscribe(&self.name, raw).await?;
        self.subscribed.store(true, Ordering::Release);
        info!("subscribed to channel {} for {}", self.name, V::TYPE_TAG);
        Ok(())
    }

    /// Removes this channel's subscription.
    pub async fn unsubscribe(&self) -> Result<(), LinkError> {
        self.transport.unsubscribe(&self.name).await?;
        self.subscribed.store(false, Ordering::Release);
        info!("unsubscribed from channel {}", self.name);
        Ok(())
    }

    /// Whether this channel is subscribed and its transport healthy.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire) && self.transport.is_connected()
    }
}
