//! End-to-end tests: multiple nodes wired over a shared in-memory bus.

use shardlink::{
    direct_channel, CircuitState, CrossServerEventService, EventPriority, EventServiceConfig,
    LinkError, MemoryBus, MemoryTransport, Message, MessageCodec, MessageMeta, MessageVariant,
    MessagingService, ModerationAction, NetworkBan, NodeId, PlayerDataUpdateMessage,
    RequestMessage, ResponseMessage, ServerStatus, ServerStatusEvent, SimpleTextMessage,
    SubscriptionHandler, Transport, BROADCAST_CHANNEL,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

fn node_id(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

struct TestNode {
    messaging: Arc<MessagingService>,
    events: Arc<CrossServerEventService>,
}

async fn spawn_node(bus: &Arc<MemoryBus>, id: &str) -> TestNode {
    spawn_node_with_config(bus, id, EventServiceConfig::default()).await
}

async fn spawn_node_with_config(
    bus: &Arc<MemoryBus>,
    id: &str,
    config: EventServiceConfig,
) -> TestNode {
    let transport = Arc::new(bus.endpoint());
    transport.connect().await.unwrap();
    spawn_node_on_transport(transport, id, config).await
}

async fn spawn_node_on_transport(
    transport: Arc<dyn Transport>,
    id: &str,
    config: EventServiceConfig,
) -> TestNode {
    let messaging = MessagingService::new(node_id(id), transport);
    messaging.initialize().await.unwrap();
    let events = CrossServerEventService::new(Arc::clone(&messaging), config).unwrap();
    events.initialize().await.unwrap();
    TestNode { messaging, events }
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Transport wrapper that fails the next N publishes and can slow the rest,
/// for driving the breaker and retry paths.
struct FaultInjectingTransport {
    inner: MemoryTransport,
    fail_remaining: AtomicU32,
    publish_delay: Option<Duration>,
}

impl FaultInjectingTransport {
    fn new(inner: MemoryTransport, failures: u32) -> Self {
        Self {
            inner,
            fail_remaining: AtomicU32::new(failures),
            publish_delay: None,
        }
    }

    fn slow(inner: MemoryTransport, delay: Duration) -> Self {
        Self {
            inner,
            fail_remaining: AtomicU32::new(0),
            publish_delay: Some(delay),
        }
    }
}

#[async_trait]
impl Transport for FaultInjectingTransport {
    async fn connect(&self) -> Result<(), LinkError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), LinkError> {
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LinkError::TransportUnavailable(
                "injected publish failure".to_string(),
            ));
        }
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), LinkError> {
        self.inner.subscribe(channel, handler).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), LinkError> {
        self.inner.unsubscribe(channel).await
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<(), LinkError> {
        self.inner.store(key, value).await
    }

    async fn store_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LinkError> {
        self.inner.store_with_ttl(key, value, ttl).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, LinkError> {
        self.inner.retrieve(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), LinkError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, LinkError> {
        self.inner.exists(key).await
    }

    fn name(&self) -> &str {
        "fault-injecting"
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn status_event_reaches_the_other_node_exactly_once() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    let b_received = Arc::new(Mutex::new(Vec::<ServerStatusEvent>::new()));
    {
        let b_received = Arc::clone(&b_received);
        b.events
            .register_event_listener::<ServerStatusEvent, _>(move |event| {
                b_received.lock().unwrap().push(event.clone());
                Ok(())
            });
    }
    let a_invocations = Arc::new(AtomicUsize::new(0));
    {
        let a_invocations = Arc::clone(&a_invocations);
        a.events
            .register_event_listener::<ServerStatusEvent, _>(move |_| {
                a_invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
    }

    let original = ServerStatusEvent::new(node_id("server-a"), ServerStatus::Online, "up");
    a.events.broadcast_event(original.clone()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !b_received.lock().unwrap().is_empty()).await,
        "server-b never saw the event"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = b_received.lock().unwrap();
    assert_eq!(received.len(), 1, "expected exactly one delivery");
    assert_eq!(received[0], original);

    // A's own listener fires once through the local phase and never again
    // through the network path.
    assert_eq!(a_invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_observe_priority_and_originator() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;
    let c = spawn_node(&bus, "server-c").await;

    let b_count = Arc::new(AtomicUsize::new(0));
    let c_count = Arc::new(AtomicUsize::new(0));
    for (node, counter) in [(&b, &b_count), (&c, &c_count)] {
        let counter = Arc::clone(counter);
        node.events
            .register_event_listener::<ServerStatusEvent, _>(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
    }

    // A raw observer on the broadcast channel checks what actually crossed
    // the wire.
    let observer = bus.endpoint();
    observer.connect().await.unwrap();
    let wrappers = Arc::new(Mutex::new(Vec::<(EventPriority, String)>::new()));
    {
        let wrappers = Arc::clone(&wrappers);
        observer
            .subscribe(
                BROADCAST_CHANNEL,
                Arc::new(move |bytes| {
                    if let Ok(Message::NetworkEvent(wrapper)) = MessageCodec::new().decode(&bytes)
                    {
                        wrappers
                            .lock()
                            .unwrap()
                            .push((wrapper.priority, wrapper.original_node_id.to_string()));
                    }
                }),
            )
            .await
            .unwrap();
    }

    let event = ServerStatusEvent::new(node_id("server-a"), ServerStatus::Maintenance, "m1");
    a.events
        .broadcast_event_with_priority(event, EventPriority::High)
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            b_count.load(Ordering::SeqCst) == 1 && c_count.load(Ordering::SeqCst) == 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b_count.load(Ordering::SeqCst), 1);
    assert_eq!(c_count.load(Ordering::SeqCst), 1);

    let wrappers = wrappers.lock().unwrap();
    assert_eq!(wrappers.len(), 1);
    assert_eq!(wrappers[0].0, EventPriority::High);
    assert_eq!(wrappers[0].1, "server-a");
}

#[tokio::test(flavor = "multi_thread")]
async fn own_broadcast_envelopes_are_dropped_on_the_receive_path() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;

    let handled = Arc::new(AtomicUsize::new(0));
    {
        let handled = Arc::clone(&handled);
        a.messaging
            .register_handler::<SimpleTextMessage, _, _>(move |_message| {
                let handled = Arc::clone(&handled);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
    }

    let before = a.events.snapshot_metrics().events_processed;
    let text = SimpleTextMessage::new(node_id("server-a"), "hello fleet", "chat");
    a.messaging.broadcast(text.into_message()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0, "loopback must be dropped");
    assert_eq!(a.events.snapshot_metrics().events_processed, before);
}

#[tokio::test(flavor = "multi_thread")]
async fn open_breaker_degrades_gracefully_then_recovers_through_half_open() {
    let bus = MemoryBus::new();
    let _receiver = spawn_node(&bus, "server-b").await;

    let flaky = Arc::new(FaultInjectingTransport::new(bus.endpoint(), 2));
    flaky.connect().await.unwrap();
    let config = EventServiceConfig {
        circuit_breaker_failure_threshold: 2,
        circuit_breaker_timeout_millis: 1_000,
        max_retry_attempts: 1,
        retry_delay_millis: 50,
        enable_graceful_degradation: true,
        ..Default::default()
    };
    let a = spawn_node_on_transport(flaky, "server-a", config).await;

    let event = || ServerStatusEvent::new(node_id("server-a"), ServerStatus::Online, "probe");

    // Two consecutive transport failures open the breaker.
    assert!(matches!(
        a.events.broadcast_event(event()).await,
        Err(LinkError::TransportUnavailable(_))
    ));
    assert!(matches!(
        a.events.broadcast_event(event()).await,
        Err(LinkError::TransportUnavailable(_))
    ));
    assert_eq!(a.events.circuit_breaker_state(), CircuitState::Open);

    // Open breaker + graceful degradation: success-as-skip.
    a.events.broadcast_event(event()).await.unwrap();
    assert_eq!(a.events.circuit_breaker_state(), CircuitState::Open);

    // After the open timeout the next call probes half-open and, with the
    // transport healthy again, closes the breaker.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    a.events.broadcast_event(event()).await.unwrap();
    assert_eq!(a.events.circuit_breaker_state(), CircuitState::Closed);

    let snapshot = a.events.snapshot_metrics();
    assert!(snapshot.circuit_breaker_opens >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn open_breaker_without_degradation_surfaces_the_refusal() {
    let bus = MemoryBus::new();
    let flaky = Arc::new(FaultInjectingTransport::new(bus.endpoint(), 1));
    flaky.connect().await.unwrap();
    let config = EventServiceConfig {
        circuit_breaker_failure_threshold: 1,
        circuit_breaker_timeout_millis: 60_000,
        max_retry_attempts: 1,
        enable_graceful_degradation: false,
        ..Default::default()
    };
    let a = spawn_node_on_transport(flaky, "server-a", config).await;

    let event = || ServerStatusEvent::new(node_id("server-a"), ServerStatus::Online, "probe");
    assert!(a.events.broadcast_event(event()).await.is_err());
    assert!(matches!(
        a.events.broadcast_event(event()).await,
        Err(LinkError::CircuitBreakerOpen)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried_with_backoff() {
    let bus = MemoryBus::new();
    let b = spawn_node(&bus, "server-b").await;

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = Arc::clone(&received);
        b.events
            .register_event_listener::<ServerStatusEvent, _>(move |_| {
                received.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
    }

    let flaky = Arc::new(FaultInjectingTransport::new(bus.endpoint(), 2));
    flaky.connect().await.unwrap();
    let config = EventServiceConfig {
        max_retry_attempts: 3,
        retry_delay_millis: 50,
        retry_backoff_multiplier: 2.0,
        ..Default::default()
    };
    let a = spawn_node_on_transport(flaky, "server-a", config).await;

    let started = Instant::now();
    a.events
        .broadcast_event(ServerStatusEvent::new(
            node_id("server-a"),
            ServerStatus::Online,
            "after retries",
        ))
        .await
        .unwrap();

    // Two failed attempts back off 50 ms + 100 ms before the third succeeds.
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(a.events.snapshot_metrics().retry_attempts, 2);
    assert!(wait_until(Duration::from_secs(5), || received.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_response_round_trip_and_timeout() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    {
        let messaging = Arc::clone(&b.messaging);
        b.messaging
            .register_handler::<RequestMessage, _, _>(move |request| {
                let messaging = Arc::clone(&messaging);
                async move {
                    let response = ResponseMessage::reply_to(
                        &request,
                        messaging.node_id().clone(),
                        json!({"players": 17}),
                    );
                    messaging
                        .send_to_node(&request.meta.source_node_id, response.into_message())
                        .await
                }
            });
    }

    let request = RequestMessage::new(node_id("server-a"), "player-count", json!({}));
    let request_id = request.meta.message_id;
    let response: ResponseMessage = a
        .messaging
        .send_request(&node_id("server-b"), request, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(response.meta.message_id, request_id);
    assert_eq!(response.payload, json!({"players": 17}));
    assert_eq!(a.messaging.pending_request_count(), 0);

    // Nobody answers on a node with no handler: the waiter times out and the
    // pending table is left clean.
    let silent = RequestMessage::new(node_id("server-a"), "player-count", json!({}));
    let result: Result<ResponseMessage, _> = a
        .messaging
        .send_request(&node_id("server-c"), silent, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(LinkError::Timeout(50))));
    assert_eq!(a.messaging.pending_request_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_response_type_is_a_protocol_error() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    {
        let messaging = Arc::clone(&b.messaging);
        b.messaging
            .register_handler::<RequestMessage, _, _>(move |request| {
                let messaging = Arc::clone(&messaging);
                async move {
                    // Reply with a text message reusing the correlation id.
                    let reply = SimpleTextMessage {
                        meta: MessageMeta::reply_to(&request.meta, messaging.node_id().clone()),
                        content: "not what you asked for".to_string(),
                        category: "oops".to_string(),
                    };
                    messaging
                        .send_to_node(&request.meta.source_node_id, reply.into_message())
                        .await
                }
            });
    }

    let request = RequestMessage::new(node_id("server-a"), "player-count", json!({}));
    let result: Result<ResponseMessage, _> = a
        .messaging
        .send_request(&node_id("server-b"), request, Duration::from_millis(500))
        .await;
    assert!(matches!(result, Err(LinkError::ProtocolMismatch { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_broadcasts_beyond_the_limit_are_refused() {
    let bus = MemoryBus::new();
    let slow = Arc::new(FaultInjectingTransport::slow(
        bus.endpoint(),
        Duration::from_millis(400),
    ));
    slow.connect().await.unwrap();
    let config = EventServiceConfig {
        max_concurrent_events: 2,
        ..Default::default()
    };
    let a = spawn_node_on_transport(slow, "server-a", config).await;

    let events = Arc::clone(&a.events);
    let mut in_flight = Vec::new();
    for _ in 0..2 {
        let events = Arc::clone(&events);
        in_flight.push(tokio::spawn(async move {
            events
                .broadcast_event(ServerStatusEvent::new(
                    node_id("server-a"),
                    ServerStatus::Online,
                    "slow",
                ))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = a
        .events
        .broadcast_event(ServerStatusEvent::new(
            node_id("server-a"),
            ServerStatus::Online,
            "one too many",
        ))
        .await;
    assert!(matches!(result, Err(LinkError::Overloaded(2))));

    for task in in_flight {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_failures_are_isolated() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    let invoked = Arc::new(AtomicUsize::new(0));
    for i in 0..3 {
        let invoked = Arc::clone(&invoked);
        b.events
            .register_event_listener::<ServerStatusEvent, _>(move |_| {
                invoked.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    Err(LinkError::Handler("listener blew up".to_string()))
                } else {
                    Ok(())
                }
            });
    }
    assert_eq!(b.events.listener_count::<ServerStatusEvent>(), 3);
    assert_eq!(b.events.total_listener_count(), 3);

    a.events
        .broadcast_event(ServerStatusEvent::new(
            node_id("server-a"),
            ServerStatus::Online,
            "isolation",
        ))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || invoked.load(Ordering::SeqCst) == 3).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_and_shutdown_are_idempotent() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;

    a.events.initialize().await.unwrap();
    a.events.initialize().await.unwrap();

    a.events.shutdown().await.unwrap();
    a.events.shutdown().await.unwrap();

    let result = a
        .events
        .broadcast_event(ServerStatusEvent::new(
            node_id("server-a"),
            ServerStatus::Online,
            "too late",
        ))
        .await;
    assert!(matches!(result, Err(LinkError::NotInitialized)));

    // Messaging is a shared collaborator and stays usable.
    let text = SimpleTextMessage::new(node_id("server-a"), "still here", "chat");
    a.messaging.broadcast(text.into_message()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn typed_channels_filter_variant_and_suppress_loopback() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    let a_channel = a
        .messaging
        .create_channel::<SimpleTextMessage>("game:chat")
        .unwrap();
    let b_channel = b
        .messaging
        .create_channel::<SimpleTextMessage>("game:chat")
        .unwrap();

    let a_seen = Arc::new(AtomicUsize::new(0));
    let b_seen = Arc::new(AtomicUsize::new(0));
    for (channel, seen) in [(&a_channel, &a_seen), (&b_channel, &b_seen)] {
        let seen = Arc::clone(seen);
        channel
            .subscribe(move |_message: SimpleTextMessage| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
    }
    assert!(a_channel.is_subscribed());

    a_channel
        .publish(SimpleTextMessage::new(node_id("server-a"), "gg", "chat"))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || b_seen.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a_seen.load(Ordering::SeqCst), 0, "publisher must not loop back");

    a_channel.unsubscribe().await.unwrap();
    assert!(!a_channel.is_subscribed());
}

#[tokio::test(flavor = "multi_thread")]
async fn unhandled_variants_reach_the_default_handler() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    let fallback = Arc::new(AtomicUsize::new(0));
    {
        let fallback = Arc::clone(&fallback);
        b.messaging
            .register_default_handler(move |_message: Message| {
                let fallback = Arc::clone(&fallback);
                async move {
                    fallback.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
    }

    let update = PlayerDataUpdateMessage::new(
        node_id("server-a"),
        Uuid::new_v4(),
        "inventory",
        "{}",
        1,
    );
    a.messaging
        .send_to_node(&node_id("server-b"), update.into_message())
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || fallback.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_channel_only_reaches_its_target() {
    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;
    let c = spawn_node(&bus, "server-c").await;

    let b_seen = Arc::new(AtomicUsize::new(0));
    let c_seen = Arc::new(AtomicUsize::new(0));
    for (node, seen) in [(&b, &b_seen), (&c, &c_seen)] {
        let seen = Arc::clone(seen);
        node.messaging
            .register_handler::<SimpleTextMessage, _, _>(move |_message| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
    }

    let text = SimpleTextMessage::new(node_id("server-a"), "psst", "whisper");
    a.messaging
        .send_to_node(&node_id("server-b"), text.into_message())
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || b_seen.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c_seen.load(Ordering::SeqCst), 0);
    assert_eq!(direct_channel(&node_id("server-b")), "direct:server-b");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_outstanding_retries_after_the_grace_period() {
    let bus = MemoryBus::new();
    // Every publish fails, so the broadcast keeps retrying with long delays.
    let flaky = Arc::new(FaultInjectingTransport::new(bus.endpoint(), u32::MAX));
    flaky.connect().await.unwrap();
    let config = EventServiceConfig {
        max_retry_attempts: 10,
        retry_delay_millis: 3_000,
        ..Default::default()
    };
    let a = spawn_node_on_transport(flaky, "server-a", config).await;

    let events = Arc::clone(&a.events);
    let pending = tokio::spawn(async move {
        events
            .broadcast_event(ServerStatusEvent::new(
                node_id("server-a"),
                ServerStatus::Online,
                "never sent",
            ))
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    a.events.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("broadcast should settle promptly after shutdown")
        .unwrap();
    assert!(matches!(result, Err(LinkError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread")]
async fn moderation_actions_fan_out_and_store_records() {
    use shardlink::ModerationService;

    let bus = MemoryBus::new();
    let a = spawn_node(&bus, "server-a").await;
    let b = spawn_node(&bus, "server-b").await;

    let moderation_a = ModerationService::new(Arc::clone(&a.messaging));
    let moderation_b = ModerationService::new(Arc::clone(&b.messaging));
    moderation_a.initialize().await.unwrap();
    moderation_b.initialize().await.unwrap();

    let b_actions = Arc::new(Mutex::new(Vec::<ModerationAction>::new()));
    {
        let b_actions = Arc::clone(&b_actions);
        moderation_b.register_moderation_listener(move |action| {
            b_actions.lock().unwrap().push(action.clone());
        });
    }

    let player = Uuid::new_v4();
    let moderator = Uuid::new_v4();
    moderation_a
        .execute_ban(NetworkBan::permanent(player, "duping", moderator))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || !b_actions.lock().unwrap().is_empty()).await
    );
    {
        let actions = b_actions.lock().unwrap();
        assert!(matches!(&actions[0], ModerationAction::Ban(ban) if ban.player_id == player));
    }

    // The record is visible fleet-wide through the shared key/value store.
    let ban = moderation_b.active_ban(player).await.unwrap();
    assert_eq!(ban.unwrap().reason, "duping");

    moderation_a
        .execute_unban(player, moderator, "appeal accepted")
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            b_actions.lock().unwrap().len() == 2
        })
        .await
    );
    assert!(moderation_b.active_ban(player).await.unwrap().is_none());
}
