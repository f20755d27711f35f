//! Transport abstraction over a pub/sub + key/value broker.
//!
//! The transport hides the concrete broker driver behind an async contract:
//! channel-based publish/subscribe plus a small key/value surface with
//! optional TTL. Channel names and keys are opaque strings; payloads are
//! opaque byte arrays. The crate reserves the channel names `direct:<node>`
//! and `broadcast`; everything else is caller-chosen.
//!
//! Delivery guarantees are the broker's: per-channel, per-subscriber arrival
//! order, no durability, no exactly-once. A backend disconnect must make
//! [`Transport::is_connected`] report `false` and fail outstanding publishes;
//! restoring subscriptions after a reconnect is the transport's own job and
//! is opaque to the layers above.

mod memory;

pub use memory::{MemoryBus, MemoryTransport};

use crate::error::LinkError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with every raw payload delivered on a subscribed channel.
///
/// Handlers are called from within the async runtime; implementations that do
/// non-trivial work should hand off to a task rather than block delivery.
pub type SubscriptionHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Contract every broker driver implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to the backend. Idempotent; fails with
    /// [`LinkError::TransportUnavailable`] if the backend is unreachable.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Disconnects from the backend. Idempotent.
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Reflects current connection health.
    fn is_connected(&self) -> bool;

    /// Delivers `payload` once to the backend's pub/sub on `channel`.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), LinkError>;

    /// Registers `handler` for every future payload on `channel`. Subscribing
    /// to an already-subscribed channel replaces the callback atomically.
    async fn subscribe(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), LinkError>;

    /// Removes the handler for `channel`; later payloads are ignored.
    async fn unsubscribe(&self, channel: &str) -> Result<(), LinkError>;

    /// Stores `value` under `key`.
    async fn store(&self, key: &str, value: &[u8]) -> Result<(), LinkError>;

    /// Stores `value` under `key` with a backend-enforced time to live.
    async fn store_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LinkError>;

    /// Retrieves the value for `key`, or `None` if absent or expired.
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, LinkError>;

    /// Deletes `key`.
    async fn delete(&self, key: &str) -> Result<(), LinkError>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, LinkError>;

    /// Short backend name for logging.
    fn name(&self) -> &str;
}
