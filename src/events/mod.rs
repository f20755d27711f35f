//! Cross-server event broadcasting.
//!
//! The event service layers typed-event fan-out on top of messaging: local
//! listeners run on every broadcast, while a wrapper message carries the
//! serialized event to every other node. A circuit breaker guards the
//! network path, a retry manager absorbs transient transport failures, and
//! metrics record every settled broadcast. Events that originated locally
//! are never re-dispatched when their wrapper echoes back.

mod breaker;
mod config;
mod metrics;
mod registry;
mod retry;
mod service;
mod types;

pub use breaker::{CircuitBreaker, CircuitState};
pub use config::EventServiceConfig;
pub use metrics::{EventMetrics, MetricsSnapshot};
pub use registry::{AnyNetworkEvent, EventMetadata, EventRegistry, NetworkEvent};
pub use retry::{RetryManager, RetryPolicy};
pub use service::{CrossServerEventService, ListenerId};
pub use types::{PlayerEventKind, PlayerNetworkEvent, ServerStatus, ServerStatusEvent};
