//! Configuration for the cross-server event service.

use crate::error::LinkError;
use crate::events::retry::RetryPolicy;
use std::time::Duration;

/// Tunables for event broadcasting, resilience, and concurrency.
///
/// Construct with [`Default`] and override fields as needed; the event
/// service validates the result at construction and refuses invalid values.
#[derive(Debug, Clone)]
pub struct EventServiceConfig {
    /// Broadcast events to the rest of the fleet.
    pub enable_cross_node_broadcast: bool,
    /// Invoke local listeners on broadcast.
    pub enable_local_processing: bool,
    /// Treat an open circuit breaker as a successful skip instead of an
    /// error, keeping local processing alive while the network is down.
    pub enable_graceful_degradation: bool,
    /// Consecutive failures before the breaker opens.
    pub circuit_breaker_failure_threshold: u32,
    /// How long the breaker stays open before a half-open probe.
    pub circuit_breaker_timeout_millis: u64,
    /// Attempts per network broadcast (1 = no retries).
    pub max_retry_attempts: u32,
    /// Base delay between retry attempts.
    pub retry_delay_millis: u64,
    /// Exponential backoff multiplier applied per failed attempt.
    pub retry_backoff_multiplier: f64,
    /// Upper bound on waiting for local listeners to settle.
    pub event_processing_timeout_millis: u64,
    /// Upper bound on a single network broadcast attempt.
    pub network_broadcast_timeout_millis: u64,
    /// Broadcasts allowed in flight at once; the next one is refused.
    pub max_concurrent_events: usize,
    /// Channel name reserved for deployments that want event wrappers on a
    /// dedicated channel. The runtime path broadcasts wrappers on the shared
    /// broadcast channel, which is observationally equivalent; the name is
    /// still validated so switching over stays a one-line change.
    pub event_broadcast_channel: String,
}

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            enable_cross_node_broadcast: true,
            enable_local_processing: true,
            enable_graceful_degradation: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_millis: 30_000,
            max_retry_attempts: 3,
            retry_delay_millis: 1_000,
            retry_backoff_multiplier: 2.0,
            event_processing_timeout_millis: 10_000,
            network_broadcast_timeout_millis: 5_000,
            max_concurrent_events: 100,
            event_broadcast_channel: "conexus:events".to_string(),
        }
    }
}

impl EventServiceConfig {
    /// Validates every field; called by the event service at construction.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.circuit_breaker_failure_threshold < 1 {
            return Err(LinkError::InvalidConfiguration(
                "circuit breaker failure threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker_timeout_millis < 1_000 {
            return Err(LinkError::InvalidConfiguration(
                "circuit breaker timeout must be at least 1000 ms".to_string(),
            ));
        }
        if self.event_broadcast_channel.trim().is_empty() {
            return Err(LinkError::InvalidConfiguration(
                "event broadcast channel cannot be empty".to_string(),
            ));
        }
        if self.max_retry_attempts < 1 {
            return Err(LinkError::InvalidConfiguration(
                "max retry attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(LinkError::InvalidConfiguration(
                "retry backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.event_processing_timeout_millis < 1_000 {
            return Err(LinkError::InvalidConfiguration(
                "event processing timeout must be at least 1000 ms".to_string(),
            ));
        }
        if self.network_broadcast_timeout_millis < 1_000 {
            return Err(LinkError::InvalidConfiguration(
                "network broadcast timeout must be at least 1000 ms".to_string(),
            ));
        }
        if self.max_concurrent_events < 1 {
            return Err(LinkError::InvalidConfiguration(
                "max concurrent events must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry schedule derived from the retry fields; the cap is 10× the base
    /// delay.
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay_millis),
            backoff_multiplier: self.retry_backoff_multiplier,
            max_delay: Duration::from_millis(self.retry_delay_millis.saturating_mul(10)),
        }
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_millis)
    }

    pub fn network_broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.network_broadcast_timeout_millis)
    }

    pub fn event_processing_timeout(&self) -> Duration {
        Duration::from_millis(self.event_processing_timeout_millis)
    }
}
