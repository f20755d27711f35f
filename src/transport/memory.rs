//! In-memory transport backed by a shared bus.
//!
//! Every node in a single process attaches an endpoint to one [`MemoryBus`];
//! publishes fan out synchronously to all subscribed endpoints, including the
//! publisher's own (loopback filtering is the messaging layer's concern, not
//! the transport's). Used by the test suite and by single-host deployments
//! that want the full API without a broker.

use super::{SubscriptionHandler, Transport};
use crate::error::LinkError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared hub connecting every [`MemoryTransport`] endpoint in a process.
pub struct MemoryBus {
    // channel -> (endpoint id -> handler)
    channels: DashMap<String, DashMap<u64, SubscriptionHandler>>,
    store: DashMap<String, StoredValue>,
    next_endpoint: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            store: DashMap::new(),
            next_endpoint: AtomicU64::new(0),
        })
    }

    /// Attaches a new endpoint to this bus.
    pub fn endpoint(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            bus: Arc::clone(self),
            endpoint_id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
            subscriptions: DashMap::new(),
        }
    }

    fn fan_out(&self, channel: &str, payload: &[u8]) {
        let Some(subscribers) = self.channels.get(channel) else {
            debug!("no subscribers on channel {channel}");
            return;
        };
        // Handlers run inline; subscribers hand off to tasks themselves.
        let handlers: Vec<SubscriptionHandler> =
            subscribers.iter().map(|e| Arc::clone(e.value())).collect();
        drop(subscribers);
        for handler in handlers {
            handler(payload.to_vec());
        }
    }
}

/// One node's endpoint on a [`MemoryBus`].
pub struct MemoryTransport {
    bus: Arc<MemoryBus>,
    endpoint_id: u64,
    connected: AtomicBool,
    // Kept locally so subscriptions survive a disconnect/connect cycle.
    subscriptions: DashMap<String, SubscriptionHandler>,
}

impl MemoryTransport {
    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LinkError::TransportUnavailable(
                "memory transport is not connected".to_string(),
            ))
        }
    }

    fn attach(&self, channel: &str, handler: SubscriptionHandler) {
        self.bus
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(self.endpoint_id, handler);
    }

    fn detach(&self, channel: &str) {
        if let Some(subscribers) = self.bus.channels.get(channel) {
            subscribers.remove(&self.endpoint_id);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), LinkError> {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Restore any subscriptions that predate a disconnect.
        for entry in self.subscriptions.iter() {
            self.attach(entry.key(), Arc::clone(entry.value()));
        }
        debug!(endpoint = self.endpoint_id, "memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        for entry in self.subscriptions.iter() {
            self.detach(entry.key());
        }
        debug!(endpoint = self.endpoint_id, "memory transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.bus.fan_out(channel, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.subscriptions
            .insert(channel.to_string(), Arc::clone(&handler));
        self.attach(channel, handler);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), LinkError> {
        self.subscriptions.remove(channel);
        self.detach(channel);
        Ok(())
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.bus.store.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn store_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.bus.store.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, LinkError> {
        self.ensure_connected()?;
        if let Some(entry) = self.bus.store.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.bus.store.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.bus.store.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LinkError> {
        Ok(self.retrieve(key).await?.is_some())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
