//! The cross-server event service.

use crate::error::LinkError;
use crate::events::breaker::{CircuitBreaker, CircuitState};
use crate::events::config::EventServiceConfig;
use crate::events::metrics::{EventMetrics, MetricsSnapshot};
use crate::events::registry::{AnyNetworkEvent, EventRegistry, NetworkEvent};
use crate::events::retry::RetryManager;
use crate::messages::{MessageKind, MessageVariant, NetworkEventMessage};
use crate::messaging::MessagingService;
use crate::types::{EventPriority, NodeId};
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

const STATE_CREATED: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// Grace period granted to in-flight broadcasts at shutdown before their
/// retry schedules are cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type ErasedListener = Arc<dyn Fn(&dyn AnyNetworkEvent) -> Result<(), LinkError> + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    name: String,
    invoke: ErasedListener,
}

/// Token returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId {
    type_name: &'static str,
    id: u64,
}

/// Tracks spawned network-phase tasks so shutdown can drain then abort them.
struct TaskTracker {
    active: AtomicUsize,
    aborts: DashMap<u64, AbortHandle>,
    seq: AtomicU64,
}

impl TaskTracker {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            aborts: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn begin(&self) -> u64 {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u64, handle: AbortHandle) {
        self.aborts.insert(id, handle);
    }

    fn finish(&self, id: u64) {
        self.aborts.remove(&id);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for entry in self.aborts.iter() {
            entry.value().abort();
            aborted += 1;
        }
        self.aborts.clear();
        aborted
    }
}

struct FinishGuard {
    tracker: Arc<TaskTracker>,
    id: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}

/// Broadcasts typed events across the fleet and fans incoming ones out to
/// local listeners.
///
/// A broadcast runs two phases: the local phase invokes every listener
/// registered for the event's variant (failures isolated per listener), and
/// the network phase wraps the event, gates it through the circuit breaker,
/// and hands it to the retry manager which asks the messaging service to
/// broadcast it. The returned future settles when both phases have; metrics
/// are recorded either way.
///
/// The service exclusively owns its breaker, retry manager, metrics, and
/// registry. The messaging service is a shared collaborator and survives
/// [`CrossServerEventService::shutdown`].
pub struct CrossServerEventService {
    node_id: NodeId,
    messaging: Arc<MessagingService>,
    registry: Arc<EventRegistry>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryManager,
    metrics: Arc<EventMetrics>,
    config: EventServiceConfig,
    listeners: DashMap<String, Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    state: AtomicU8,
    permits: Arc<Semaphore>,
    tasks: Arc<TaskTracker>,
    shutdown_tx: watch::Sender<bool>,
    weak_self: Weak<CrossServerEventService>,
}

impl CrossServerEventService {
    /// Creates the service with default configuration.
    pub fn with_defaults(messaging: Arc<MessagingService>) -> Result<Arc<Self>, LinkError> {
        Self::new(messaging, EventServiceConfig::default())
    }

    /// Creates the service, validating `config`.
    pub fn new(
        messaging: Arc<MessagingService>,
        config: EventServiceConfig,
    ) -> Result<Arc<Self>, LinkError> {
        config.validate()?;

        let node_id = messaging.node_id().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(EventMetrics::new(node_id.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            format!("network-broadcast-{node_id}"),
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_timeout(),
        ));
        let retry = RetryManager::new(config.retry_policy(), shutdown_rx, Arc::clone(&metrics));

        let service = Arc::new_cyclic(|weak| Self {
            node_id: node_id.clone(),
            messaging,
            registry: Arc::new(EventRegistry::new()),
            breaker,
            retry,
            metrics,
            permits: Arc::new(Semaphore::new(config.max_concurrent_events)),
            config,
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            state: AtomicU8::new(STATE_CREATED),
            tasks: Arc::new(TaskTracker::new()),
            shutdown_tx,
            weak_self: weak.clone(),
        });

        info!("cross-server event service created for node {node_id}");
        Ok(service)
    }

    /// Installs the wrapper handler on messaging. Idempotent; fails with
    /// [`LinkError::NotInitialized`] after shutdown.
    pub async fn initialize(&self) -> Result<(), LinkError> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_INITIALIZED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_INITIALIZED) => {
                debug!("event service already initialized for {}", self.node_id);
                return Ok(());
            }
            Err(_) => return Err(LinkError::NotInitialized),
        }

        let weak = self.weak_self.clone();
        self.messaging
            .register_handler::<NetworkEventMessage, _, _>(move |wrapper| {
                let weak = weak.clone();
                async move {
                    if let Some(service) = weak.upgrade() {
                        service.handle_incoming_event(wrapper);
                    }
                    Ok(())
                }
            });

        info!("🔁 cross-server event service initialized for {}", self.node_id);
        Ok(())
    }

    /// Stops the service: removes the wrapper handler, drains in-flight
    /// broadcasts with a bounded grace period, cancels what remains, and
    /// clears listeners. Idempotent; messaging is left running.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        let previous = self.state.swap(STATE_SHUTDOWN, Ordering::AcqRel);
        if previous != STATE_INITIALIZED {
            return Ok(());
        }

        self.messaging.unregister_handler(MessageKind::NetworkEvent);

        if !self.tasks.wait_idle(SHUTDOWN_GRACE).await {
            warn!(
                "{} broadcast task(s) still running after {:?} grace, cancelling",
                self.tasks.active_count(),
                SHUTDOWN_GRACE
            );
        }
        let _ = self.shutdown_tx.send(true);
        if !self.tasks.wait_idle(Duration::from_millis(250)).await {
            let aborted = self.tasks.abort_all();
            warn!("abandoned {aborted} outstanding broadcast task(s)");
        }

        self.listeners.clear();
        info!("cross-server event service shut down for {}", self.node_id);
        Ok(())
    }

    /// Broadcasts `event` at normal priority.
    pub async fn broadcast_event<E: NetworkEvent>(&self, event: E) -> Result<(), LinkError> {
        self.broadcast_event_with_priority(event, EventPriority::Normal)
            .await
    }

    /// Broadcasts `event` locally and across the fleet.
    ///
    /// Settles when both phases have. Local listener failures never fail the
    /// broadcast; network failures do unless graceful degradation masks an
    /// open breaker. Fails fast with [`LinkError::Overloaded`] when
    /// `max_concurrent_events` broadcasts are already in flight.
    pub async fn broadcast_event_with_priority<E: NetworkEvent>(
        &self,
        event: E,
        priority: EventPriority,
    ) -> Result<(), LinkError> {
        if self.state.load(Ordering::Acquire) != STATE_INITIALIZED {
            return Err(LinkError::NotInitialized);
        }
        let _permit = Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            warn!(
                "refusing broadcast of {}: {} events already in flight",
                E::TYPE_NAME,
                self.config.max_concurrent_events
            );
            LinkError::Overloaded(self.config.max_concurrent_events)
        })?;

        let started = Instant::now();
        let event_type = E::TYPE_NAME;
        debug!("broadcasting {event_type} from {} at {priority}", self.node_id);

        let local = if self.config.enable_local_processing {
            let service = self.strong()?;
            let local_event = event.clone();
            Some(tokio::spawn(async move {
                service.notify_local_listeners(E::TYPE_NAME, &local_event);
            }))
        } else {
            None
        };

        let network_result = self.run_network_phase(&event, priority).await;

        if let Some(handle) = local {
            let cap = self.config.event_processing_timeout();
            if tokio::time::timeout(cap, handle).await.is_err() {
                warn!("local listeners for {event_type} still running after {cap:?}");
            }
        }

        let elapsed = started.elapsed();
        match &network_result {
            Ok(()) => self.metrics.record_event_broadcast(event_type, elapsed),
            Err(e) => {
                self.metrics
                    .record_event_broadcast_failure(event_type, elapsed);
                error!("broadcast of {event_type} at {priority} failed: {e}");
            }
        }
        self.metrics.record_circuit_breaker_state(self.breaker.state());

        network_result
    }

    async fn run_network_phase<E: NetworkEvent>(
        &self,
        event: &E,
        priority: EventPriority,
    ) -> Result<(), LinkError> {
        if !self.config.enable_cross_node_broadcast {
            return Ok(());
        }

        if !self.breaker.allow_request() {
            warn!(
                "circuit breaker is open, skipping cross-node broadcast of {} from {}",
                E::TYPE_NAME,
                self.node_id
            );
            return if self.config.enable_graceful_degradation {
                Ok(())
            } else {
                Err(LinkError::CircuitBreakerOpen)
            };
        }

        // Encode once, outside the retry loop: codec failures are terminal.
        let payload = self.registry.encode_event(event)?;
        let original = NetworkEvent::source_node(event).clone();
        let type_name = E::TYPE_NAME;
        let attempt_timeout = self.config.network_broadcast_timeout();
        let operation_name = format!("broadcast-{type_name}");

        let service = self.strong()?;
        let (tx, rx) = oneshot::channel();
        let task_id = self.tasks.begin();
        let tracker = Arc::clone(&self.tasks);

        let handle = tokio::spawn(async move {
            let _guard = FinishGuard {
                tracker,
                id: task_id,
            };
            let result = service
                .retry
                .execute_with_retry(&operation_name, || {
                    let wrapper = NetworkEventMessage::new(
                        service.node_id.clone(),
                        type_name,
                        payload.clone(),
                        priority,
                        original.clone(),
                    );
                    let messaging = Arc::clone(&service.messaging);
                    async move {
                        match tokio::time::timeout(
                            attempt_timeout,
                            messaging.broadcast(wrapper.into_message()),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                Err(LinkError::Timeout(attempt_timeout.as_millis() as u64))
                            }
                        }
                    }
                })
                .await;

            match &result {
                Ok(()) => service.breaker.record_success(),
                Err(LinkError::Cancelled) => {}
                Err(e) => {
                    service.breaker.record_failure();
                    error!("cross-node broadcast of {type_name} failed after retries: {e}");
                }
            }
            let _ = tx.send(result);
        });
        self.tasks.register(task_id, handle.abort_handle());
        if handle.is_finished() {
            // The task beat us to completion; drop its stale abort handle.
            self.tasks.aborts.remove(&task_id);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Cancelled),
        }
    }

    fn handle_incoming_event(&self, wrapper: NetworkEventMessage) {
        // Domain-level loop prevention: the originator never re-dispatches
        // its own event, regardless of which node republished the envelope.
        if wrapper.original_node_id == self.node_id {
            debug!("ignoring loopback event wrapper from {}", wrapper.original_node_id);
            return;
        }

        debug!(
            "received {} event from {} (published by {}) at {}",
            wrapper.event_type,
            wrapper.original_node_id,
            wrapper.meta.source_node_id,
            wrapper.priority
        );

        match self
            .registry
            .decode_event(&wrapper.event_type, &wrapper.event_payload)
        {
            Ok(event) => self.notify_local_listeners(event.type_name(), event.as_ref()),
            Err(e) => {
                error!(
                    "failed to reconstruct {} event from {}: {e}",
                    wrapper.event_type, wrapper.meta.source_node_id
                );
                self.metrics.record_per_type_failure(&wrapper.event_type);
            }
        }
    }

    fn notify_local_listeners(&self, type_name: &str, event: &dyn AnyNetworkEvent) {
        let entries: Vec<ListenerEntry> = match self.listeners.get(type_name) {
            Some(entries) => entries.value().clone(),
            None => {
                debug!("no local listeners for {type_name}");
                return;
            }
        };

        debug!("notifying {} listener(s) for {type_name}", entries.len());
        for entry in entries {
            match catch_unwind(AssertUnwindSafe(|| (entry.invoke)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("listener {} failed: {e}", entry.name),
                Err(_) => error!("listener {} panicked", entry.name),
            }
        }
    }

    /// Registers a listener for the exact variant `E`; returns a token for
    /// [`CrossServerEventService::unregister_event_listener`].
    pub fn register_event_listener<E, F>(&self, listener: F) -> ListenerId
    where
        E: NetworkEvent,
        F: Fn(&E) -> Result<(), LinkError> + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry {
            id,
            name: format!("{}#{id}", E::TYPE_NAME),
            invoke: Arc::new(move |event: &dyn AnyNetworkEvent| {
                match event.as_any().downcast_ref::<E>() {
                    Some(event) => listener(event),
                    None => Err(LinkError::Handler(
                        "dispatched event did not match the listener variant".to_string(),
                    )),
                }
            }),
        };
        self.listeners
            .entry(E::TYPE_NAME.to_string())
            .or_default()
            .push(entry);
        debug!("registered listener for {} on {}", E::TYPE_NAME, self.node_id);
        ListenerId {
            type_name: E::TYPE_NAME,
            id,
        }
    }

    /// Removes a previously registered listener.
    pub fn unregister_event_listener(&self, listener: ListenerId) {
        if let Some(mut entries) = self.listeners.get_mut(listener.type_name) {
            entries.retain(|entry| entry.id != listener.id);
            let empty = entries.is_empty();
            drop(entries);
            if empty {
                self.listeners
                    .remove_if(listener.type_name, |_, entries| entries.is_empty());
            }
            debug!(
                "unregistered listener for {} on {}",
                listener.type_name, self.node_id
            );
        }
    }

    /// Registers a custom event type with its fallback decoder.
    pub fn register_event_type<E, D>(&self, decoder: D)
    where
        E: NetworkEvent,
        D: Fn(&str) -> Result<E, LinkError> + Send + Sync + 'static,
    {
        self.registry.register_with_decoder::<E, D>(decoder);
        info!(
            "registered custom event type {} for cross-node broadcasting on {}",
            E::TYPE_NAME,
            self.node_id
        );
    }

    fn strong(&self) -> Result<Arc<Self>, LinkError> {
        self.weak_self.upgrade().ok_or(LinkError::Cancelled)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &EventServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<EventMetrics> {
        &self.metrics
    }

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Emits current metrics at info level.
    pub fn log_metrics(&self) {
        self.metrics.log_current();
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn circuit_breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Listeners registered for the variant `E`.
    pub fn listener_count<E: NetworkEvent>(&self) -> usize {
        self.listeners
            .get(E::TYPE_NAME)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Listeners registered across all variants.
    pub fn total_listener_count(&self) -> usize {
        self.listeners.iter().map(|entries| entries.len()).sum()
    }
}
