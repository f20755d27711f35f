//! Counters and timing aggregates for the event service.

use crate::events::breaker::CircuitState;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Lock-free aggregates for event broadcasting.
///
/// Counters are additive atomics; min/max use compare-and-set style updates.
/// Concurrent readers may observe transient inconsistencies between
/// counters, but a fresh snapshot never reports `min > max`.
pub struct EventMetrics {
    node_id: NodeId,
    start_time: DateTime<Utc>,
    events_processed: AtomicU64,
    events_broadcast: AtomicU64,
    broadcast_failures: AtomicU64,
    retry_attempts: AtomicU64,
    circuit_breaker_opens: AtomicU64,
    total_processing_nanos: AtomicU64,
    min_processing_nanos: AtomicU64,
    max_processing_nanos: AtomicU64,
    per_type_count: DashMap<String, u64>,
    per_type_failures: DashMap<String, u64>,
    last_breaker_state: Mutex<(CircuitState, DateTime<Utc>)>,
}

impl EventMetrics {
    pub fn new(node_id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            start_time: now,
            events_processed: AtomicU64::new(0),
            events_broadcast: AtomicU64::new(0),
            broadcast_failures: AtomicU64::new(0),
            retry_attempts: AtomicU64::new(0),
            circuit_breaker_opens: AtomicU64::new(0),
            total_processing_nanos: AtomicU64::new(0),
            min_processing_nanos: AtomicU64::new(u64::MAX),
            max_processing_nanos: AtomicU64::new(0),
            per_type_count: DashMap::new(),
            per_type_failures: DashMap::new(),
            last_breaker_state: Mutex::new((CircuitState::Closed, now)),
        }
    }

    /// Records a successfully settled broadcast and its processing time.
    pub fn record_event_broadcast(&self, event_type: &str, elapsed: Duration) {
        self.events_broadcast.fetch_add(1, Ordering::Relaxed);
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.record_timing(elapsed);
        *self.per_type_count.entry(event_type.to_string()).or_insert(0) += 1;
        debug!(
            "recorded broadcast of {event_type} in {} µs",
            elapsed.as_micros()
        );
    }

    /// Records a failed broadcast; failures still carry processing time.
    pub fn record_event_broadcast_failure(&self, event_type: &str, elapsed: Duration) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.record_timing(elapsed);
        *self
            .per_type_failures
            .entry(event_type.to_string())
            .or_insert(0) += 1;
        debug!(
            "recorded failed broadcast of {event_type} after {} µs",
            elapsed.as_micros()
        );
    }

    /// Records a receive-side failure for `event_type` (e.g. an unknown or
    /// undecodable wrapper) without touching the broadcast counters.
    pub fn record_per_type_failure(&self, event_type: &str) {
        *self
            .per_type_failures
            .entry(event_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_retry_attempt(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Tracks circuit breaker state changes; each transition into `Open`
    /// bumps the opens counter.
    pub fn record_circuit_breaker_state(&self, state: CircuitState) {
        let mut last = self
            .last_breaker_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.0 != state {
            if state == CircuitState::Open {
                self.circuit_breaker_opens.fetch_add(1, Ordering::Relaxed);
            }
            info!(
                "circuit breaker state changed from {} to {state} on {}",
                last.0, self.node_id
            );
            *last = (state, Utc::now());
        }
    }

    fn record_timing(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.total_processing_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.min_processing_nanos.fetch_min(nanos, Ordering::Relaxed);
        self.max_processing_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Immutable copy of the current aggregates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.events_processed.load(Ordering::Relaxed);
        let broadcast = self.events_broadcast.load(Ordering::Relaxed);
        let failures = self.broadcast_failures.load(Ordering::Relaxed);
        let total_nanos = self.total_processing_nanos.load(Ordering::Relaxed);
        let min_nanos = self.min_processing_nanos.load(Ordering::Relaxed);
        let max_nanos = self.max_processing_nanos.load(Ordering::Relaxed);

        // processed == broadcast + failures, so this is successes over all
        // settled broadcasts.
        let success_rate_percent = if processed > 0 {
            broadcast as f64 / processed as f64 * 100.0
        } else {
            0.0
        };
        let avg_processing_ms = if processed > 0 {
            total_nanos as f64 / processed as f64 / 1_000_000.0
        } else {
            0.0
        };

        let (breaker_state, breaker_since) = *self
            .last_breaker_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        MetricsSnapshot {
            node_id: self.node_id.clone(),
            start_time: self.start_time,
            snapshot_time: Utc::now(),
            events_processed: processed,
            events_broadcast: broadcast,
            broadcast_failures: failures,
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            circuit_breaker_opens: self.circuit_breaker_opens.load(Ordering::Relaxed),
            success_rate_percent,
            avg_processing_ms,
            min_processing_ms: if min_nanos == u64::MAX {
                0.0
            } else {
                min_nanos as f64 / 1_000_000.0
            },
            max_processing_ms: max_nanos as f64 / 1_000_000.0,
            circuit_breaker_state: breaker_state,
            circuit_breaker_state_since: breaker_since,
            per_type_count: self
                .per_type_count
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            per_type_failures: self
                .per_type_failures
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    /// Emits the current aggregates at info level.
    pub fn log_current(&self) {
        let snapshot = self.snapshot();
        info!(
            "event metrics for {}: {} processed, {:.1}% success rate, {:.2} ms avg processing",
            snapshot.node_id,
            snapshot.events_processed,
            snapshot.success_rate_percent,
            snapshot.avg_processing_ms
        );
        if snapshot.broadcast_failures > 0 {
            info!(
                "failures: {} broadcasts, {} retries, {} circuit breaker opens",
                snapshot.broadcast_failures,
                snapshot.retry_attempts,
                snapshot.circuit_breaker_opens
            );
        }
        if !snapshot.per_type_count.is_empty() {
            debug!("event types processed: {:?}", snapshot.per_type_count);
        }
    }
}

/// Point-in-time copy of the event metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub node_id: NodeId,
    pub start_time: DateTime<Utc>,
    pub snapshot_time: DateTime<Utc>,
    pub events_processed: u64,
    pub events_broadcast: u64,
    pub broadcast_failures: u64,
    pub retry_attempts: u64,
    pub circuit_breaker_opens: u64,
    pub success_rate_percent: f64,
    pub avg_processing_ms: f64,
    pub min_processing_ms: f64,
    pub max_processing_ms: f64,
    pub circuit_breaker_state: CircuitState,
    pub circuit_breaker_state_since: DateTime<Utc>,
    pub per_type_count: HashMap<String, u64>,
    pub per_type_failures: HashMap<String, u64>,
}
