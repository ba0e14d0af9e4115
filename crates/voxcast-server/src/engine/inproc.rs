//! In-process media engine
//!
//! Implements the engine traits without spawning native worker processes:
//! each worker is an independent routing context inside this process. Used
//! by the development binary and the test suite. Routers track per-router
//! producer reachability, so consuming a producer that was never piped to
//! the consumer's router fails exactly like it would on the native engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, watch};
use uuid::Uuid;

use voxcast_protocol::{
    ConsumerId, DataConsumerId, DataProducerId, MediaKind, ProducerId, RouterId, TransportId,
    WorkerId,
};

use super::{
    DataProducerOptions, EngineError, EngineResult, MediaConsumer, MediaDataConsumer,
    MediaDataProducer, MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
    TransportConnectionInfo, TransportCreateOptions, WorkerSettings,
};

#[derive(Default)]
struct Shared {
    routers: RwLock<HashMap<RouterId, Arc<InProcRouter>>>,
    producers: RwLock<HashMap<ProducerId, Arc<InProcProducer>>>,
    data_producers: RwLock<HashMap<DataProducerId, Arc<InProcDataProducer>>>,
}

pub struct InProcEngine {
    shared: Arc<Shared>,
}

impl InProcEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Test helper: look up a live transport anywhere in the engine.
    pub async fn find_transport(&self, id: TransportId) -> Option<Arc<InProcTransport>> {
        let routers = self.shared.routers.read().await;
        for router in routers.values() {
            if let Some(transport) = router.transports.read().await.get(&id) {
                return Some(Arc::clone(transport));
            }
        }
        None
    }
}

impl Default for InProcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for InProcEngine {
    async fn spawn_worker(&self, _settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        let (died_tx, died_rx) = watch::channel(None);
        Ok(Arc::new(InProcWorker {
            id: WorkerId::new(),
            shared: Arc::clone(&self.shared),
            died_tx,
            died_rx,
        }))
    }
}

pub struct InProcWorker {
    id: WorkerId,
    shared: Arc<Shared>,
    died_tx: watch::Sender<Option<String>>,
    died_rx: watch::Receiver<Option<String>>,
}

impl InProcWorker {
    /// Test helper: report this worker as dead.
    pub fn kill(&self, reason: &str) {
        let _ = self.died_tx.send(Some(reason.to_owned()));
    }
}

#[async_trait]
impl MediaWorker for InProcWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(&self) -> EngineResult<Arc<dyn MediaRouter>> {
        let router = Arc::new(InProcRouter {
            id: RouterId::new(),
            worker_id: self.id,
            shared: Arc::clone(&self.shared),
            reachable: RwLock::new(HashSet::new()),
            data_reachable: RwLock::new(HashSet::new()),
            transports: RwLock::new(HashMap::new()),
        });
        self.shared
            .routers
            .write()
            .await
            .insert(router.id, Arc::clone(&router));
        Ok(router)
    }

    async fn died(&self) -> String {
        let mut rx = self.died_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "worker dropped".to_owned();
            }
        }
    }
}

pub struct InProcRouter {
    id: RouterId,
    worker_id: WorkerId,
    shared: Arc<Shared>,
    reachable: RwLock<HashSet<ProducerId>>,
    data_reachable: RwLock<HashSet<DataProducerId>>,
    transports: RwLock<HashMap<TransportId, Arc<InProcTransport>>>,
}

#[async_trait]
impl MediaRouter for InProcRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    async fn create_transport(
        &self,
        options: TransportCreateOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        let listen_ip = options
            .listen_ips
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_owned());
        let num_streams = options
            .sctp_capabilities
            .get("numStreams")
            .cloned()
            .unwrap_or_else(|| json!({ "OS": 1024, "MIS": 1024 }));
        let info = TransportConnectionInfo {
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "inproc",
                "priority": 1,
                "ip": listen_ip,
                "port": 40000,
                "protocol": "udp",
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string(),
                }],
            }),
            sctp_parameters: json!({
                "port": 5000,
                "OS": num_streams.get("OS").cloned().unwrap_or(json!(1024)),
                "MIS": num_streams.get("MIS").cloned().unwrap_or(json!(1024)),
                "maxMessageSize": 262144,
            }),
        };
        let (dtls_tx, _) = watch::channel(false);
        let transport = Arc::new(InProcTransport {
            id: TransportId::new(),
            router_id: self.id,
            shared: Arc::clone(&self.shared),
            info,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dtls_tx,
            producers: Mutex::new(Vec::new()),
            data_producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            data_consumers: Mutex::new(Vec::new()),
        });
        self.transports
            .write()
            .await
            .insert(transport.id, Arc::clone(&transport));
        Ok(transport)
    }

    async fn pipe_producer_to(
        &self,
        producer_id: ProducerId,
        target: RouterId,
    ) -> EngineResult<()> {
        let producer = self
            .shared
            .producers
            .read()
            .await
            .get(&producer_id)
            .cloned()
            .ok_or(EngineError::Closed("producer"))?;
        if producer.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("producer"));
        }
        let target_router = self
            .shared
            .routers
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(EngineError::UnknownRouter(target))?;
        target_router.reachable.write().await.insert(producer_id);
        Ok(())
    }

    async fn pipe_data_producer_to(
        &self,
        data_producer_id: DataProducerId,
        target: RouterId,
    ) -> EngineResult<()> {
        let exists = self
            .shared
            .data_producers
            .read()
            .await
            .contains_key(&data_producer_id);
        if !exists {
            return Err(EngineError::Closed("data producer"));
        }
        let target_router = self
            .shared
            .routers
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(EngineError::UnknownRouter(target))?;
        target_router
            .data_reachable
            .write()
            .await
            .insert(data_producer_id);
        Ok(())
    }

    async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
    ) -> EngineResult<bool> {
        let reachable = self.reachable.read().await.contains(&producer_id);
        let has_codecs = rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| !codecs.is_empty());
        Ok(reachable && has_codecs)
    }

    async fn live_transport_count(&self) -> EngineResult<usize> {
        let transports = self.transports.read().await;
        Ok(transports.values().filter(|t| !t.closed()).count())
    }
}

pub struct InProcTransport {
    id: TransportId,
    router_id: RouterId,
    shared: Arc<Shared>,
    info: TransportConnectionInfo,
    connected: AtomicBool,
    closed: AtomicBool,
    dtls_tx: watch::Sender<bool>,
    producers: Mutex<Vec<Arc<InProcProducer>>>,
    data_producers: Mutex<Vec<Arc<InProcDataProducer>>>,
    consumers: Mutex<Vec<Arc<InProcConsumer>>>,
    data_consumers: Mutex<Vec<Arc<InProcDataConsumer>>>,
}

impl InProcTransport {
    /// Test helper: pretend the remote end hung up at the DTLS level.
    pub fn simulate_dtls_close(&self) {
        let _ = self.dtls_tx.send(true);
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed() {
            Err(EngineError::Closed("transport"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for InProcTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn router_id(&self) -> RouterId {
        self.router_id
    }

    fn connection_info(&self) -> TransportConnectionInfo {
        self.info.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self, _dtls_parameters: Value) -> EngineResult<()> {
        self.ensure_open()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> EngineResult<()> {
        self.ensure_open()
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        self.ensure_open()?;
        let producer = Arc::new(InProcProducer {
            id: ProducerId::new(),
            kind,
            shared: Arc::clone(&self.shared),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        self.shared
            .producers
            .write()
            .await
            .insert(producer.id, Arc::clone(&producer));
        if let Some(router) = self.shared.routers.read().await.get(&self.router_id) {
            router.reachable.write().await.insert(producer.id);
        }
        self.producers.lock().await.push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn produce_data(
        &self,
        options: DataProducerOptions,
    ) -> EngineResult<Arc<dyn MediaDataProducer>> {
        self.ensure_open()?;
        let data_producer = Arc::new(InProcDataProducer {
            id: DataProducerId::new(),
            label: options.label,
            protocol: options.protocol,
            sctp_stream_parameters: options.sctp_stream_parameters,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        });
        self.shared
            .data_producers
            .write()
            .await
            .insert(data_producer.id, Arc::clone(&data_producer));
        if let Some(router) = self.shared.routers.read().await.get(&self.router_id) {
            router.data_reachable.write().await.insert(data_producer.id);
        }
        self.data_producers
            .lock()
            .await
            .push(Arc::clone(&data_producer));
        Ok(data_producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        let producer = self
            .shared
            .producers
            .read()
            .await
            .get(&producer_id)
            .cloned()
            .ok_or(EngineError::NotRouted(producer_id))?;
        if producer.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("producer"));
        }
        let reachable = match self.shared.routers.read().await.get(&self.router_id) {
            Some(router) => router.reachable.read().await.contains(&producer_id),
            None => false,
        };
        if !reachable {
            return Err(EngineError::NotRouted(producer_id));
        }
        let (layers_tx, _) = watch::channel(None);
        let consumer = Arc::new(InProcConsumer {
            id: ConsumerId::new(),
            kind: producer.kind,
            producer,
            rtp_parameters: json!({
                "codecs": rtp_capabilities.get("codecs").cloned().unwrap_or(json!([])),
            }),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            layers_tx,
        });
        self.consumers.lock().await.push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn consume_data(
        &self,
        data_producer_id: DataProducerId,
    ) -> EngineResult<Arc<dyn MediaDataConsumer>> {
        self.ensure_open()?;
        let data_producer = self
            .shared
            .data_producers
            .read()
            .await
            .get(&data_producer_id)
            .cloned()
            .ok_or(EngineError::DataNotRouted(data_producer_id))?;
        let reachable = match self.shared.routers.read().await.get(&self.router_id) {
            Some(router) => {
                router
                    .data_reachable
                    .read()
                    .await
                    .contains(&data_producer_id)
            }
            None => false,
        };
        if !reachable {
            return Err(EngineError::DataNotRouted(data_producer_id));
        }
        let data_consumer = Arc::new(InProcDataConsumer {
            id: DataConsumerId::new(),
            data_producer_id,
            label: data_producer.label.clone(),
            protocol: data_producer.protocol.clone(),
            sctp_stream_parameters: data_producer.sctp_stream_parameters.clone(),
            closed: AtomicBool::new(false),
        });
        self.data_consumers
            .lock()
            .await
            .push(Arc::clone(&data_consumer));
        Ok(data_consumer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.dtls_tx.send(true);
        let producers: Vec<_> = self.producers.lock().await.drain(..).collect();
        for producer in producers {
            producer.close().await;
        }
        let data_producers: Vec<_> = self.data_producers.lock().await.drain(..).collect();
        for data_producer in data_producers {
            data_producer.close().await;
        }
        let consumers: Vec<_> = self.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            consumer.close().await;
        }
        let data_consumers: Vec<_> = self.data_consumers.lock().await.drain(..).collect();
        for data_consumer in data_consumers {
            data_consumer.close().await;
        }
        if let Some(router) = self.shared.routers.read().await.get(&self.router_id) {
            router.transports.write().await.remove(&self.id);
        }
    }

    async fn dtls_closed(&self) {
        let mut rx = self.dtls_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct InProcProducer {
    id: ProducerId,
    kind: MediaKind,
    shared: Arc<Shared>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for InProcProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("producer"));
        }
        // Model the cross-process round trip.
        tokio::task::yield_now().await;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("producer"));
        }
        tokio::task::yield_now().await;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.producers.write().await.remove(&self.id);
        // The piped copies die with the origin.
        for router in self.shared.routers.read().await.values() {
            router.reachable.write().await.remove(&self.id);
        }
    }
}

pub struct InProcConsumer {
    id: ConsumerId,
    kind: MediaKind,
    producer: Arc<InProcProducer>,
    rtp_parameters: Value,
    paused: AtomicBool,
    closed: AtomicBool,
    layers_tx: watch::Sender<Option<u8>>,
}

#[async_trait]
impl MediaConsumer for InProcConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        match self.kind {
            MediaKind::Video => "simulcast".to_owned(),
            MediaKind::Audio => "simple".to_owned(),
        }
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer.paused()
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("consumer"));
        }
        tokio::task::yield_now().await;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("consumer"));
        }
        tokio::task::yield_now().await;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, spatial_layer: u8) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("consumer"));
        }
        // The development engine switches layers instantly.
        let _ = self.layers_tx.send(Some(spatial_layer));
        Ok(())
    }

    fn layers(&self) -> watch::Receiver<Option<u8>> {
        self.layers_tx.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct InProcDataProducer {
    id: DataProducerId,
    label: String,
    protocol: String,
    sctp_stream_parameters: Value,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaDataProducer for InProcDataProducer {
    fn id(&self) -> DataProducerId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    fn sctp_stream_parameters(&self) -> Value {
        self.sctp_stream_parameters.clone()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.data_producers.write().await.remove(&self.id);
        for router in self.shared.routers.read().await.values() {
            router.data_reachable.write().await.remove(&self.id);
        }
    }
}

pub struct InProcDataConsumer {
    id: DataConsumerId,
    data_producer_id: DataProducerId,
    label: String,
    protocol: String,
    sctp_stream_parameters: Value,
    closed: AtomicBool,
}

#[async_trait]
impl MediaDataConsumer for InProcDataConsumer {
    fn id(&self) -> DataConsumerId {
        self.id
    }

    fn data_producer_id(&self) -> DataProducerId {
        self.data_producer_id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    fn sctp_stream_parameters(&self) -> Value {
        self.sctp_stream_parameters.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
