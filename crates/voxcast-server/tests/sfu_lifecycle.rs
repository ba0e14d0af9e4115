//! Manager-level lifecycle tests against the in-process engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use voxcast_protocol::{
    ChannelKey, DataProducerId, MediaKind, PeerId, ProducerId, RouterId, TransportDirection,
    TransportOptions, WorkerId,
};
use voxcast_server::directory::UuidDirectory;
use voxcast_server::engine::inproc::InProcEngine;
use voxcast_server::engine::{
    EngineResult, MediaEngine, MediaRouter, MediaTransport, MediaWorker, TransportCreateOptions,
    WorkerSettings,
};
use voxcast_server::error::SfuError;
use voxcast_server::state::{AppState, Config};

async fn state_with_engine(engine: Arc<dyn MediaEngine>, num_workers: usize) -> AppState {
    let config = Config {
        num_workers,
        ..Config::default()
    };
    AppState::new(config, engine, Arc::new(UuidDirectory))
        .await
        .expect("state should start")
}

async fn test_state(num_workers: usize) -> (AppState, Arc<InProcEngine>) {
    let engine = Arc::new(InProcEngine::new());
    let state = state_with_engine(Arc::clone(&engine) as Arc<dyn MediaEngine>, num_workers).await;
    (state, engine)
}

fn rtp_capabilities() -> serde_json::Value {
    json!({ "codecs": [{ "mimeType": "audio/opus" }] })
}

async fn transport_for(
    state: &AppState,
    peer: PeerId,
    direction: TransportDirection,
    channel: &ChannelKey,
) -> TransportOptions {
    state
        .transports
        .create_transport(peer, direction, channel.clone(), json!({}))
        .await
        .expect("transport should be created")
}

/// Registers a fake signaling connection so server events can be observed.
async fn attach_events(
    state: &AppState,
    peer: PeerId,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    state.connections.add_connection(Uuid::new_v4(), peer, tx).await;
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event should arrive")
        .expect("connection should stay open");
    serde_json::from_str(&text).expect("events are valid json")
}

#[tokio::test]
async fn transport_slot_is_replaced_not_accumulated() {
    let (state, engine) = test_state(1).await;
    let peer = PeerId::new();
    let channel = ChannelKey::Instance;

    let first = transport_for(&state, peer, TransportDirection::Send, &channel).await;
    let second = transport_for(&state, peer, TransportDirection::Send, &channel).await;
    assert_ne!(first.id, second.id);

    // The replaced transport is closed and deregistered.
    assert!(engine.find_transport(first.id).await.is_none());
    assert!(engine.find_transport(second.id).await.is_some());
    assert_eq!(state.registry.transports_of_peer(peer).await, vec![second.id]);
}

/// Engine wrapper whose transport creation takes long enough for another
/// request on the same slot to arrive in the meantime.
struct SlowCreateEngine {
    inner: Arc<InProcEngine>,
    delay: Duration,
}

#[async_trait]
impl MediaEngine for SlowCreateEngine {
    async fn spawn_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        let inner = self.inner.spawn_worker(settings).await?;
        Ok(Arc::new(SlowCreateWorker {
            inner,
            delay: self.delay,
        }))
    }
}

struct SlowCreateWorker {
    inner: Arc<dyn MediaWorker>,
    delay: Duration,
}

#[async_trait]
impl MediaWorker for SlowCreateWorker {
    fn id(&self) -> WorkerId {
        self.inner.id()
    }

    async fn create_router(&self) -> EngineResult<Arc<dyn MediaRouter>> {
        let inner = self.inner.create_router().await?;
        Ok(Arc::new(SlowCreateRouter {
            inner,
            delay: self.delay,
        }))
    }

    async fn died(&self) -> String {
        self.inner.died().await
    }
}

struct SlowCreateRouter {
    inner: Arc<dyn MediaRouter>,
    delay: Duration,
}

#[async_trait]
impl MediaRouter for SlowCreateRouter {
    fn id(&self) -> RouterId {
        self.inner.id()
    }

    fn worker_id(&self) -> WorkerId {
        self.inner.worker_id()
    }

    async fn create_transport(
        &self,
        options: TransportCreateOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_transport(options).await
    }

    async fn pipe_producer_to(
        &self,
        producer_id: ProducerId,
        target: RouterId,
    ) -> EngineResult<()> {
        self.inner.pipe_producer_to(producer_id, target).await
    }

    async fn pipe_data_producer_to(
        &self,
        data_producer_id: DataProducerId,
        target: RouterId,
    ) -> EngineResult<()> {
        self.inner
            .pipe_data_producer_to(data_producer_id, target)
            .await
    }

    async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
    ) -> EngineResult<bool> {
        self.inner.can_consume(producer_id, rtp_capabilities).await
    }

    async fn live_transport_count(&self) -> EngineResult<usize> {
        self.inner.live_transport_count().await
    }
}

#[tokio::test]
async fn concurrent_creates_for_one_slot_leave_a_single_transport() {
    let inner = Arc::new(InProcEngine::new());
    let engine = Arc::new(SlowCreateEngine {
        inner: Arc::clone(&inner),
        delay: Duration::from_millis(50),
    });
    let state = state_with_engine(engine, 1).await;
    let peer = PeerId::new();
    let channel = ChannelKey::Instance;

    // Two connections of the same peer racing to create the same slot.
    let (first, second) = tokio::join!(
        state.transports.create_transport(
            peer,
            TransportDirection::Send,
            channel.clone(),
            json!({}),
        ),
        state.transports.create_transport(
            peer,
            TransportDirection::Send,
            channel.clone(),
            json!({}),
        ),
    );
    let first = first.expect("first create should succeed");
    let second = second.expect("second create should succeed");
    assert_ne!(first.id, second.id);

    let live = state.registry.transports_of_peer(peer).await;
    assert_eq!(live.len(), 1, "the slot holds exactly one live transport");
    let slot = state
        .registry
        .transport_for_slot(peer, &channel, TransportDirection::Send)
        .await;
    assert_eq!(slot, Some(live[0]));
    // The loser of the race was closed, not leaked.
    let survivor = live[0];
    let loser = if survivor == first.id { second.id } else { first.id };
    assert!(inner.find_transport(loser).await.is_none());
    assert!(inner.find_transport(survivor).await.is_some());
}

#[tokio::test]
async fn producers_on_one_worker_are_consumable_from_another() {
    // Two workers: the producer's send transport and the consumer's recv
    // transport land on different routers, so consuming only works if the
    // producer was piped across.
    let (state, _engine) = test_state(2).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    let recv = transport_for(&state, bob, TransportDirection::Recv, &channel).await;

    let send_router = state.registry.transport(send.id).await.unwrap().handle.router_id();
    let recv_router = state.registry.transport(recv.id).await.unwrap().handle.router_id();
    assert_ne!(send_router, recv_router, "least-loaded selection should spread load");

    state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .expect("produce should succeed");

    let descriptor = state
        .consumers
        .consume(bob, alice, "mic".into(), rtp_capabilities(), channel)
        .await
        .expect("piped producer should be consumable");
    assert!(!descriptor.producer_paused);
    assert_eq!(descriptor.kind, MediaKind::Audio);
}

#[tokio::test]
async fn new_producer_is_announced_to_other_peers_only() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::from_parts("party", Some("42"));

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;

    let mut alice_events = attach_events(&state, alice).await;
    let mut bob_events = attach_events(&state, bob).await;

    state
        .producers
        .produce(alice, send.id, MediaKind::Video, json!({}), "camera".into(), false)
        .await
        .unwrap();

    let event = next_event(&mut bob_events).await;
    assert_eq!(event["event"], "new-producer");
    assert_eq!(event["mediaTag"], "camera");
    assert_eq!(event["channelType"], "party");
    assert_eq!(event["channelId"], "42");
    assert!(alice_events.try_recv().is_err(), "producers are not announced to their owner");
}

#[tokio::test]
async fn closing_a_send_transport_cascades_to_producers_and_consumers() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;

    let producer_id = state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .unwrap();
    let descriptor = state
        .consumers
        .consume(bob, alice, "mic".into(), rtp_capabilities(), channel.clone())
        .await
        .unwrap();

    state.transports.close_transport(send.id).await.unwrap();

    assert!(state.registry.producer(producer_id).await.is_none());
    assert!(state.registry.consumer(descriptor.id).await.is_none());
    let err = state
        .consumers
        .consume(bob, alice, "mic".into(), rtp_capabilities(), channel)
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::CannotConsume { .. }));
}

#[tokio::test]
async fn dtls_teardown_closes_the_transport_server_side() {
    let (state, engine) = test_state(1).await;
    let peer = PeerId::new();
    let channel = ChannelKey::Instance;

    let options = transport_for(&state, peer, TransportDirection::Send, &channel).await;
    let transport = engine.find_transport(options.id).await.unwrap();
    transport.simulate_dtls_close();

    // The watcher task runs the close asynchronously.
    tokio::time::timeout(Duration::from_secs(1), async {
        while state.registry.transport(options.id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transport should be cleaned up after dtls close");
}

#[tokio::test]
async fn producer_pause_then_resume_ends_resumed() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;
    let producer_id = state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .unwrap();
    let descriptor = state
        .consumers
        .consume(bob, alice, "mic".into(), rtp_capabilities(), channel)
        .await
        .unwrap();

    state.producers.pause_producer(producer_id, false).await.unwrap();
    state.producers.resume_producer(producer_id).await.unwrap();
    state.queue.flush().await;

    let producer = state.registry.producer(producer_id).await.unwrap();
    assert!(!producer.handle.paused());
    assert!(!producer.paused);
    let consumer = state.registry.consumer(descriptor.id).await.unwrap();
    assert!(!consumer.handle.paused());
}

#[tokio::test]
async fn global_mute_pause_notifies_the_producing_peer() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    let producer_id = state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .unwrap();

    let mut alice_events = attach_events(&state, alice).await;
    state.producers.pause_producer(producer_id, true).await.unwrap();
    state.queue.flush().await;

    let event = next_event(&mut alice_events).await;
    assert_eq!(event["event"], "producer-paused");
    assert_eq!(event["globalMute"], true);

    let record = state.registry.producer(producer_id).await.unwrap();
    assert!(record.paused);
    assert!(record.global_mute);
}

#[tokio::test]
async fn consumers_start_paused_and_track_selected_layers() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;
    state
        .producers
        .produce(alice, send.id, MediaKind::Video, json!({}), "camera".into(), false)
        .await
        .unwrap();
    let descriptor = state
        .consumers
        .consume(bob, alice, "camera".into(), rtp_capabilities(), channel)
        .await
        .unwrap();

    let record = state.registry.consumer(descriptor.id).await.unwrap();
    assert!(record.handle.paused(), "consumers are created paused");
    assert_eq!(record.handle.consumer_type(), "simulcast");

    // Setting the same layer twice converges to the same state.
    state.consumers.set_preferred_layer(descriptor.id, 1).await.unwrap();
    state.consumers.set_preferred_layer(descriptor.id, 1).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let layers = state.registry.consumer_layers(bob, descriptor.id).await;
            if layers.is_some_and(|l| l.current_layer == Some(1)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("layer watcher should record the delivered layer");

    let layers = state.registry.consumer_layers(bob, descriptor.id).await.unwrap();
    assert_eq!(layers.client_selected_layer, Some(1));
}

#[tokio::test]
async fn data_producers_fan_out_to_peers_with_recv_transports() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;
    let mut bob_events = attach_events(&state, bob).await;

    let data_producer_id = state
        .producers
        .produce_data(
            alice,
            send.id,
            "chat".into(),
            "raw".into(),
            json!({ "streamId": 0, "ordered": true }),
        )
        .await
        .unwrap();

    let event = next_event(&mut bob_events).await;
    assert_eq!(event["event"], "new-data-producer");
    assert_eq!(event["label"], "chat");
    let event = next_event(&mut bob_events).await;
    assert_eq!(event["event"], "consume-data");
    assert_eq!(event["label"], "chat");

    assert_eq!(state.registry.data_consumers_of(data_producer_id).await.len(), 1);
}

#[tokio::test]
async fn late_recv_transports_get_existing_data_producers() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    let data_producer_id = state
        .producers
        .produce_data(
            alice,
            send.id,
            "chat".into(),
            "raw".into(),
            json!({ "streamId": 0 }),
        )
        .await
        .unwrap();

    // Bob joins after the data producer exists.
    let mut bob_events = attach_events(&state, bob).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;

    let event = next_event(&mut bob_events).await;
    assert_eq!(event["event"], "consume-data");
    assert_eq!(
        event["dataProducerId"],
        serde_json::to_value(data_producer_id).unwrap()
    );
}

#[tokio::test]
async fn data_producers_require_a_label() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    let err = state
        .producers
        .produce_data(alice, send.id, "".into(), "raw".into(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::InvalidRequest(_)));
}

#[tokio::test]
async fn operations_on_unknown_entities_report_not_found() {
    let (state, _engine) = test_state(1).await;

    let err = state
        .transports
        .connect_transport(voxcast_protocol::TransportId::new(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::TransportNotFound(_)));

    let err = state
        .producers
        .resume_producer(voxcast_protocol::ProducerId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ProducerNotFound(_)));

    let err = state
        .consumers
        .pause_consumer(voxcast_protocol::ConsumerId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ConsumerNotFound(_)));
}

#[tokio::test]
async fn producing_on_an_unknown_transport_is_rejected() {
    let (state, _engine) = test_state(1).await;
    let err = state
        .producers
        .produce(
            PeerId::new(),
            voxcast_protocol::TransportId::new(),
            MediaKind::Audio,
            json!({}),
            "mic".into(),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::TransportNotFound(_)));
}

#[tokio::test]
async fn consuming_with_incompatible_capabilities_is_rejected() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    transport_for(&state, bob, TransportDirection::Recv, &channel).await;
    state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .unwrap();

    let err = state
        .consumers
        .consume(bob, alice, "mic".into(), json!({ "codecs": [] }), channel)
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::CannotConsume { .. }));
}

#[tokio::test]
async fn consuming_without_a_recv_transport_is_rejected() {
    let (state, _engine) = test_state(1).await;
    let alice = PeerId::new();
    let bob = PeerId::new();
    let channel = ChannelKey::Instance;

    let send = transport_for(&state, alice, TransportDirection::Send, &channel).await;
    state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .unwrap();

    let err = state
        .consumers
        .consume(bob, alice, "mic".into(), rtp_capabilities(), channel)
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::RecvTransportNotFound { .. }));
}

#[tokio::test]
async fn peer_cleanup_closes_every_transport_and_the_session() {
    let (state, engine) = test_state(1).await;
    let alice = PeerId::new();
    let instance = ChannelKey::Instance;
    let party = ChannelKey::from_parts("party", Some("9"));

    let send = transport_for(&state, alice, TransportDirection::Send, &instance).await;
    let recv = transport_for(&state, alice, TransportDirection::Recv, &party).await;
    state
        .producers
        .produce(alice, send.id, MediaKind::Audio, json!({}), "mic".into(), false)
        .await
        .unwrap();

    state.transports.close_peer(alice).await;

    assert!(state.registry.session(alice).await.is_none());
    assert!(state.registry.transports_of_peer(alice).await.is_empty());
    assert!(engine.find_transport(send.id).await.is_none());
    assert!(engine.find_transport(recv.id).await.is_none());
}
