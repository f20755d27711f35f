//! Error types for the shardlink crate.

use thiserror::Error;

/// Errors surfaced by transport, messaging, and event operations.
///
/// Every public operation settles with either success or the most specific
/// variant below. Listener and handler failures are isolated at the dispatch
/// site and never propagate through this type to remote peers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The broker connection is down or a publish could not be delivered.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A value could not be encoded to the wire format.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Received bytes could not be decoded, or the type discriminator is not
    /// a known message variant.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A network event wrapper named a type with no registry entry.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The network phase was refused because the circuit breaker is open and
    /// graceful degradation is disabled.
    #[error("circuit breaker is open, cross-node broadcasting refused")]
    CircuitBreakerOpen,

    /// A request/response exchange did not complete in time.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// A response arrived but was not the expected variant.
    #[error("expected response of type {expected}, got {actual}")]
    ProtocolMismatch {
        expected: &'static str,
        actual: String,
    },

    /// The operation or an outstanding retry was cancelled by shutdown or by
    /// the caller dropping the pending future.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation was invoked on a service outside its initialized state.
    #[error("service is not initialized")]
    NotInitialized,

    /// The concurrent-event limit was reached.
    #[error("too many concurrent events in flight (limit {0})")]
    Overloaded(usize),

    /// Configuration validation failed at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A handler or listener reported a failure. Logged at the dispatch site.
    #[error("handler error: {0}")]
    Handler(String),
}

impl LinkError {
    /// Whether a failed broadcast attempt may be retried.
    ///
    /// Transient transport conditions are retryable; codec failures and
    /// terminal states are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::TransportUnavailable(_) | LinkError::Timeout(_)
        )
    }
}
