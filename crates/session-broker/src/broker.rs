//! `SessionBroker` - the embedder-facing facade.
//!
//! Bootstraps the worker pool and the registry actor, hands out
//! [`PeerConnection`]s, and exposes shutdown and failure signals. One
//! broker per process; everything else hangs off its cancellation tree.

use crate::actors::connection::ConnectionActor;
use crate::actors::messages::BrokerStatus;
use crate::actors::registry::{RegistryActor, RegistryActorHandle};
use crate::config::BrokerConfig;
use crate::connection::PeerConnection;
use crate::errors::BrokerError;
use crate::events::EventSink;
use crate::metrics::BrokerMetrics;
use crate::pool::WorkerPool;

use media_engine::MediaEngine;
use signal_protocol::PeerId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// An in-process session broker.
pub struct SessionBroker {
    registry: RegistryActorHandle,
    root: CancellationToken,
    failure: CancellationToken,
    metrics: Arc<BrokerMetrics>,
}

impl SessionBroker {
    /// Start the broker: build the worker pool, arm the death watchers,
    /// spawn the registry.
    pub async fn start(
        config: &BrokerConfig,
        engine: &dyn MediaEngine,
    ) -> Result<Self, BrokerError> {
        config
            .validate()
            .map_err(|e| BrokerError::Internal(e.to_string()))?;

        let pool = WorkerPool::build(engine, config.worker_count, &config.worker_settings()).await?;

        let root = CancellationToken::new();
        let failure = CancellationToken::new();
        pool.spawn_death_watchers(&root, &failure);

        let metrics = BrokerMetrics::new();
        let (registry, _registry_task) = RegistryActor::spawn(
            pool,
            config.codecs.clone(),
            config.transport_options(),
            root.clone(),
            Arc::clone(&metrics),
        );

        info!(
            target: "broker",
            workers = config.worker_count,
            "Session broker started"
        );

        Ok(Self {
            registry,
            root,
            failure,
            metrics,
        })
    }

    /// Accept a new peer connection.
    ///
    /// The peer gets a fresh identity; a reconnecting client is a new
    /// peer as far as the broker is concerned.
    pub fn connect(&self) -> Result<PeerConnection, BrokerError> {
        if self.root.is_cancelled() {
            return Err(BrokerError::ShuttingDown);
        }

        let peer_id = PeerId::new();
        let sink = EventSink::new(peer_id, Arc::clone(&self.metrics));
        let (connection, _task) = ConnectionActor::spawn(
            peer_id,
            self.registry.clone(),
            sink,
            self.root.child_token(),
            Arc::clone(&self.metrics),
        );

        Ok(connection)
    }

    /// Snapshot of live rooms and pool size.
    pub async fn status(&self) -> Result<BrokerStatus, BrokerError> {
        self.registry.get_status().await
    }

    /// Token cancelled when an engine worker dies.
    ///
    /// The broker tears itself down shortly after (the observability
    /// flush delay); the embedder decides whether that is fatal to the
    /// process.
    #[must_use]
    pub fn failure_watch(&self) -> CancellationToken {
        self.failure.clone()
    }

    /// Shared metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Whether the broker has been shut down or failed.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Graceful shutdown: stop accepting rooms, cancel the actor tree.
    pub async fn shutdown(&self) {
        let _ = self.registry.shutdown().await;
        info!(target: "broker", "Session broker shut down");
    }
}
