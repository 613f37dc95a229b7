//! Deterministic in-process engine.
//!
//! [`LocalEngine`] implements the full engine surface without touching the
//! network: transports hand out synthetic ICE/DTLS parameters, RTC ports
//! come from a per-worker counter, and produce/consume do nothing beyond
//! the bookkeeping the broker observes. Tests and demos get real lifecycle
//! behavior (cascading closes, capability checks, worker death via
//! [`LocalEngine::kill_worker`]) with no media stack attached.

use crate::errors::EngineError;
use crate::traits::{
    EngineConsumer, EngineProducer, EngineRouter, EngineTransport, EngineWorker, MediaEngine,
    TransportOptions, WorkerSettings,
};
use signal_protocol::{
    CodecCapability, ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaCapabilities, MediaKind, MediaParams, ProducerId, TransportDescriptor,
    TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// In-process engine. Cheap to create, one per broker.
pub struct LocalEngine {
    /// Workers in creation order; index is the pool's worker index.
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of workers created so far.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Simulate a worker crash: cancels its death watch and makes it
    /// refuse further routers. Returns false for an unknown index.
    pub async fn kill_worker(&self, index: usize) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(index) {
            Some(worker) => {
                worker.kill();
                true
            }
            None => false,
        }
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError> {
        let mut workers = self.workers.lock().await;
        let worker = Arc::new(LocalWorker {
            index: workers.len(),
            ports: Arc::new(PortAllocator::new(settings)),
            dead: AtomicBool::new(false),
            death: CancellationToken::new(),
        });
        workers.push(Arc::clone(&worker));
        debug!(target: "engine.local", worker = worker.index, "worker created");
        Ok(worker)
    }
}

/// Hands out RTC ports round-robin over the worker's configured range.
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortAllocator {
    fn new(settings: &WorkerSettings) -> Self {
        // A degenerate range collapses to the minimum port.
        let span = u32::from(settings.rtc_max_port.saturating_sub(settings.rtc_min_port)) + 1;
        Self {
            min: settings.rtc_min_port,
            span,
            next: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> u16 {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        self.min + (n % self.span) as u16
    }
}

struct LocalWorker {
    index: usize,
    ports: Arc<PortAllocator>,
    dead: AtomicBool,
    death: CancellationToken,
}

impl LocalWorker {
    fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.death.cancel();
        debug!(target: "engine.local", worker = self.index, "worker killed");
    }
}

#[async_trait::async_trait]
impl EngineWorker for LocalWorker {
    async fn create_router(
        &self,
        codecs: &[CodecCapability],
    ) -> Result<Arc<dyn EngineRouter>, EngineError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerDead);
        }
        let router = Arc::new(LocalRouter {
            id: Uuid::new_v4(),
            capabilities: MediaCapabilities {
                codecs: codecs.to_vec(),
            },
            ports: Arc::clone(&self.ports),
            producers: Arc::new(RwLock::new(HashMap::new())),
            transports: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        debug!(
            target: "engine.local",
            worker = self.index,
            router = %router.id,
            codecs = codecs.len(),
            "router created"
        );
        Ok(router)
    }

    fn death_watch(&self) -> CancellationToken {
        self.death.clone()
    }
}

/// What a live producer looks like to the rest of its router.
#[derive(Debug, Clone)]
struct ProducerRecord {
    kind: MediaKind,
    media_params: MediaParams,
}

#[derive(Debug)]
struct LocalRouter {
    id: Uuid,
    capabilities: MediaCapabilities,
    ports: Arc<PortAllocator>,
    /// Shared with every transport so consume can resolve any producer
    /// in the room.
    producers: Arc<RwLock<HashMap<ProducerId, ProducerRecord>>>,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl EngineRouter for LocalRouter {
    fn capabilities(&self) -> MediaCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: &TransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::RouterClosed);
        }
        let id = TransportId::new();
        let port = self.ports.allocate();
        let descriptor = TransportDescriptor {
            id,
            direction,
            ice_parameters: IceParameters {
                username_fragment: ice_username_fragment(),
                password: Uuid::new_v4().simple().to_string(),
            },
            ice_candidates: vec![IceCandidate {
                ip: options.announced_ip.clone(),
                port,
                protocol: "udp".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![dtls_fingerprint()],
            },
        };
        let transport = Arc::new(LocalTransport {
            id,
            direction,
            descriptor,
            router_producers: Arc::clone(&self.producers),
            own_producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            phase: Mutex::new(Phase::New),
        });
        self.transports.lock().await.push(Arc::clone(&transport));
        debug!(
            target: "engine.local",
            router = %self.id,
            transport = %id,
            direction = %direction,
            listen_ip = %options.listen_ip,
            port,
            initial_bitrate = options.initial_bitrate,
            max_incoming_bitrate = options.max_incoming_bitrate,
            "transport created"
        );
        Ok(transport)
    }

    async fn can_consume(
        &self,
        producer_id: ProducerId,
        capabilities: &MediaCapabilities,
    ) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let producers = self.producers.read().await;
        match producers.get(&producer_id) {
            Some(record) => capabilities.supports(record.kind, &record.media_params.mime_type),
            None => false,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = self.transports.lock().await.drain(..).collect();
        for transport in transports {
            transport.close().await;
        }
        self.producers.write().await.clear();
        debug!(target: "engine.local", router = %self.id, "router closed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug)]
struct LocalTransport {
    id: TransportId,
    direction: TransportDirection,
    descriptor: TransportDescriptor,
    router_producers: Arc<RwLock<HashMap<ProducerId, ProducerRecord>>>,
    own_producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    phase: Mutex<Phase>,
}

impl LocalTransport {
    async fn ensure_open(&self) -> Result<(), EngineError> {
        match *self.phase.lock().await {
            Phase::Closed | Phase::Failed => Err(EngineError::TransportClosed(self.id)),
            Phase::New | Phase::Connected => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn descriptor(&self) -> TransportDescriptor {
        self.descriptor.clone()
    }

    async fn connect(&self, dtls_parameters: &DtlsParameters) -> Result<(), EngineError> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Closed | Phase::Failed => Err(EngineError::TransportClosed(self.id)),
            Phase::Connected => Err(EngineError::ConnectRejected(
                self.id,
                "already connected".to_string(),
            )),
            Phase::New => {
                if dtls_parameters.fingerprints.is_empty() {
                    *phase = Phase::Failed;
                    return Err(EngineError::ConnectRejected(
                        self.id,
                        "no fingerprints offered".to_string(),
                    ));
                }
                *phase = Phase::Connected;
                debug!(target: "engine.local", transport = %self.id, "transport connected");
                Ok(())
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        media_params: MediaParams,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.ensure_open().await?;
        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind,
            registry: Arc::clone(&self.router_producers),
            closed: AtomicBool::new(false),
        });
        self.router_producers
            .write()
            .await
            .insert(producer.id, ProducerRecord { kind, media_params });
        self.own_producers.lock().await.push(Arc::clone(&producer));
        debug!(
            target: "engine.local",
            transport = %self.id,
            producer = %producer.id,
            kind = %kind,
            "producer created"
        );
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &MediaCapabilities,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.ensure_open().await?;
        let record = {
            let producers = self.router_producers.read().await;
            producers.get(&producer_id).cloned()
        }
        .ok_or(EngineError::ProducerMissing(producer_id))?;
        if !capabilities.supports(record.kind, &record.media_params.mime_type) {
            return Err(EngineError::ConsumeRejected(producer_id));
        }
        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: record.kind,
            media_params: record.media_params,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().await.push(Arc::clone(&consumer));
        debug!(
            target: "engine.local",
            transport = %self.id,
            consumer = %consumer.id,
            producer = %producer_id,
            "consumer created"
        );
        Ok(consumer)
    }

    async fn close(&self) {
        {
            let mut phase = self.phase.lock().await;
            if *phase == Phase::Closed {
                return;
            }
            *phase = Phase::Closed;
        }
        let producers: Vec<_> = self.own_producers.lock().await.drain(..).collect();
        for producer in producers {
            producer.close().await;
        }
        let consumers: Vec<_> = self.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            consumer.close().await;
        }
        debug!(target: "engine.local", transport = %self.id, "transport closed");
    }
}

#[derive(Debug)]
struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    registry: Arc<RwLock<HashMap<ProducerId, ProducerRecord>>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl EngineProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.write().await.remove(&self.id);
    }
}

#[derive(Debug)]
struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    media_params: MediaParams,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn media_params(&self) -> MediaParams {
        self.media_params.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ConsumerClosed(self.id));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn ice_username_fragment() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

fn dtls_fingerprint() -> DtlsFingerprint {
    let head = Uuid::new_v4();
    let tail = Uuid::new_v4();
    let value = head
        .as_bytes()
        .iter()
        .chain(tail.as_bytes().iter())
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use signal_protocol::EncodingParams;
    use std::collections::BTreeMap;

    fn test_codecs() -> Vec<CodecCapability> {
        vec![
            CodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: BTreeMap::new(),
            },
            CodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
            },
        ]
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 40_000,
            rtc_max_port: 40_002,
        }
    }

    fn options() -> TransportOptions {
        TransportOptions {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            initial_bitrate: 1_000_000,
            max_incoming_bitrate: 1_500_000,
        }
    }

    fn dtls_answer() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn video_params() -> MediaParams {
        MediaParams {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            encodings: vec![EncodingParams {
                max_bitrate: Some(900_000),
            }],
        }
    }

    async fn router() -> Arc<dyn EngineRouter> {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        worker.create_router(&test_codecs()).await.unwrap()
    }

    #[tokio::test]
    async fn test_produce_then_consume_round_trip() {
        let router = router().await;
        let send = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();
        send.connect(&dtls_answer()).await.unwrap();
        let producer = send.produce(MediaKind::Video, video_params()).await.unwrap();

        let caps = router.capabilities();
        assert!(router.can_consume(producer.id(), &caps).await);

        // Consume before the recv transport connects: clients finish the
        // recv handshake lazily, on their first consume.
        let recv = router
            .create_transport(TransportDirection::Recv, &options())
            .await
            .unwrap();
        let consumer = recv.consume(producer.id(), &caps).await.unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.producer_id(), producer.id());
        assert_eq!(consumer.kind(), MediaKind::Video);
        assert_eq!(consumer.media_params().mime_type, "video/VP8");

        consumer.resume().await.unwrap();
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_fails() {
        let router = router().await;
        let recv = router
            .create_transport(TransportDirection::Recv, &options())
            .await
            .unwrap();

        let unknown = ProducerId::new();
        assert!(!router.can_consume(unknown, &router.capabilities()).await);
        let err = recv
            .consume(unknown, &router.capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProducerMissing(id) if id == unknown));
    }

    #[tokio::test]
    async fn test_consume_incompatible_capabilities_rejected() {
        let router = router().await;
        let send = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();
        send.connect(&dtls_answer()).await.unwrap();
        let producer = send.produce(MediaKind::Video, video_params()).await.unwrap();

        let audio_only = MediaCapabilities {
            codecs: vec![CodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: BTreeMap::new(),
            }],
        };
        assert!(!router.can_consume(producer.id(), &audio_only).await);

        let recv = router
            .create_transport(TransportDirection::Recv, &options())
            .await
            .unwrap();
        let err = recv.consume(producer.id(), &audio_only).await.unwrap_err();
        assert!(matches!(err, EngineError::ConsumeRejected(_)));
    }

    #[tokio::test]
    async fn test_transport_close_cascades_producers() {
        let router = router().await;
        let send = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();
        send.connect(&dtls_answer()).await.unwrap();
        let producer = send.produce(MediaKind::Video, video_params()).await.unwrap();
        let producer_id = producer.id();

        send.close().await;

        let caps = router.capabilities();
        assert!(!router.can_consume(producer_id, &caps).await);

        let recv = router
            .create_transport(TransportDirection::Recv, &options())
            .await
            .unwrap();
        let err = recv.consume(producer_id, &caps).await.unwrap_err();
        assert!(matches!(err, EngineError::ProducerMissing(_)));

        let err = send
            .produce(MediaKind::Audio, video_params())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransportClosed(_)));
    }

    #[tokio::test]
    async fn test_transport_close_cascades_consumers() {
        let router = router().await;
        let send = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();
        send.connect(&dtls_answer()).await.unwrap();
        let producer = send.produce(MediaKind::Video, video_params()).await.unwrap();

        let recv = router
            .create_transport(TransportDirection::Recv, &options())
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), &router.capabilities())
            .await
            .unwrap();

        recv.close().await;
        let err = consumer.resume().await.unwrap_err();
        assert!(matches!(err, EngineError::ConsumerClosed(_)));
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let router = router().await;
        let transport = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();
        transport.connect(&dtls_answer()).await.unwrap();
        let err = transport.connect(&dtls_answer()).await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectRejected(..)));
    }

    #[tokio::test]
    async fn test_connect_without_fingerprints_fails_transport() {
        let router = router().await;
        let transport = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();

        let bare = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![],
        };
        let err = transport.connect(&bare).await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectRejected(..)));

        // Handshake failure is terminal for the transport.
        let err = transport
            .produce(MediaKind::Video, video_params())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransportClosed(_)));
    }

    #[tokio::test]
    async fn test_killed_worker_refuses_routers() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let watch = worker.death_watch();
        assert!(!watch.is_cancelled());

        assert!(engine.kill_worker(0).await);
        assert!(watch.is_cancelled());

        let err = worker.create_router(&test_codecs()).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerDead));

        assert!(!engine.kill_worker(5).await);
    }

    #[tokio::test]
    async fn test_port_allocation_wraps_range() {
        let router = router().await;
        let mut ports = Vec::new();
        for _ in 0..4 {
            let transport = router
                .create_transport(TransportDirection::Send, &options())
                .await
                .unwrap();
            let descriptor = transport.descriptor();
            ports.push(descriptor.ice_candidates.first().unwrap().port);
        }
        assert_eq!(ports, vec![40_000, 40_001, 40_002, 40_000]);
    }

    #[tokio::test]
    async fn test_router_close_cascades_everything() {
        let router = router().await;
        let send = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap();
        send.connect(&dtls_answer()).await.unwrap();
        let producer = send.produce(MediaKind::Video, video_params()).await.unwrap();
        let recv = router
            .create_transport(TransportDirection::Recv, &options())
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), &router.capabilities())
            .await
            .unwrap();

        router.close().await;
        router.close().await;

        assert!(!router.can_consume(producer.id(), &router.capabilities()).await);
        assert!(matches!(
            consumer.resume().await.unwrap_err(),
            EngineError::ConsumerClosed(_)
        ));
        let err = router
            .create_transport(TransportDirection::Send, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RouterClosed));
    }

    #[test]
    fn test_fingerprint_shape() {
        let fingerprint = dtls_fingerprint();
        assert_eq!(fingerprint.algorithm, "sha-256");
        assert_eq!(fingerprint.value.split(':').count(), 32);
    }
}
