//! `RegistryActor` - singleton supervisor for room actors.
//!
//! The registry is the top-level actor in the broker hierarchy:
//!
//! - Owns the engine worker pool and assigns rooms to workers round-robin
//! - Serializes room creation, so concurrent first-joins of one id cannot
//!   create two rooms
//! - Removes room entries on `RoomEmptied` notices, matched by epoch
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # The empty-room race
//!
//! A join can reach a room in the moment after its last peer left: the
//! room answers `RoomClosed`, and the caller retries here quoting the
//! epoch it saw. If the entry still carries that epoch the registry
//! evicts it synchronously before creating the replacement, so the retry
//! cannot land on the same dying actor twice.

use crate::errors::BrokerError;
use crate::metrics::{ActorType, BrokerMetrics, MailboxMonitor};
use crate::pool::WorkerPool;

use super::messages::{BrokerStatus, RegistryMessage, RoomInfo};
use super::room::{RoomActor, RoomActorHandle};

use media_engine::TransportOptions;
use signal_protocol::{CodecCapability, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `RegistryActor`.
///
/// Channel failures surface as [`BrokerError::ShuttingDown`]: the
/// registry outlives every other broker actor, so if it is gone the
/// broker is going down.
#[derive(Clone)]
pub struct RegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryActorHandle {
    /// Look up the room for `room_id`, creating it if absent.
    ///
    /// `stale_epoch` names a room the caller just saw refuse with
    /// `RoomClosed`; an entry still carrying that epoch is evicted first.
    pub async fn get_or_create_room(
        &self,
        room_id: RoomId,
        stale_epoch: Option<u64>,
    ) -> Result<RoomActorHandle, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                stale_epoch,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::ShuttingDown)?;

        rx.await.map_err(|_| BrokerError::ShuttingDown)?
    }

    /// Get the current broker status.
    pub async fn get_status(&self) -> Result<BrokerStatus, BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|_| BrokerError::ShuttingDown)?;

        rx.await.map_err(|_| BrokerError::ShuttingDown)
    }

    /// Initiate graceful shutdown. The ack arrives once the shutdown has
    /// been initiated, not once it has completed.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|_| BrokerError::ShuttingDown)?;

        rx.await.map_err(|_| BrokerError::ShuttingDown)
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for spawning dependent actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    /// Handle to the room actor.
    handle: RoomActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
    /// Epoch assigned at creation.
    epoch: u64,
    /// Pool index of the worker hosting the room's router.
    worker_index: usize,
    /// Room creation timestamp.
    created_at: i64,
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    /// Message receiver.
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Clone of the mailbox sender, handed to rooms for emptied notices.
    self_sender: mpsc::Sender<RegistryMessage>,
    /// Cancellation token (root of the broker tree).
    cancel_token: CancellationToken,
    /// Engine workers, assigned round-robin.
    pool: WorkerPool,
    /// Receive codec set for every room router.
    codecs: Vec<CodecCapability>,
    /// Options for every transport in every room.
    transport_options: TransportOptions,
    /// Managed rooms by ID.
    rooms: HashMap<RoomId, ManagedRoom>,
    /// Next epoch to assign; never reused within a broker lifetime.
    next_epoch: u64,
    /// Whether the registry is accepting requests.
    accepting_new: bool,
    /// Shared metrics.
    metrics: Arc<BrokerMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl RegistryActor {
    /// Spawn the registry actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        pool: WorkerPool,
        codecs: Vec<CodecCapability>,
        transport_options: TransportOptions,
        cancel_token: CancellationToken,
        metrics: Arc<BrokerMetrics>,
    ) -> (RegistryActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            pool,
            codecs,
            transport_options,
            rooms: HashMap::new(),
            next_epoch: 1,
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryActorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "broker.registry")]
    async fn run(mut self) {
        info!(
            target: "broker.registry",
            workers = self.pool.len(),
            "RegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "broker.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "broker.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "broker.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                stale_epoch,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id, stale_epoch).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::RoomEmptied { room_id, epoch } => {
                self.handle_room_emptied(&room_id, epoch);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let status = self.get_status();
                let _ = respond_to.send(status);
            }

            RegistryMessage::Shutdown { respond_to } => {
                self.initiate_shutdown();
                let _ = respond_to.send(());
            }
        }
    }

    /// Look up or create a room actor.
    async fn get_or_create_room(
        &mut self,
        room_id: RoomId,
        stale_epoch: Option<u64>,
    ) -> Result<RoomActorHandle, BrokerError> {
        if !self.accepting_new {
            return Err(BrokerError::ShuttingDown);
        }

        if let Some(stale) = stale_epoch {
            if self
                .rooms
                .get(&room_id)
                .is_some_and(|managed| managed.epoch == stale)
            {
                debug!(
                    target: "broker.registry",
                    room_id = %room_id,
                    epoch = stale,
                    "Evicting stale room entry before re-create"
                );
                self.remove_room(&room_id);
            }
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            return Ok(managed.handle.clone());
        }

        let (worker_index, worker) = self.pool.assign()?;
        let router = worker.create_router(&self.codecs).await?;

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let room_token = self.cancel_token.child_token();
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            epoch,
            router,
            self.transport_options.clone(),
            self.self_sender.clone(),
            room_token,
            Arc::clone(&self.metrics),
        );

        let created_at = chrono::Utc::now().timestamp();

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                epoch,
                worker_index,
                created_at,
            },
        );

        self.metrics.room_created();

        info!(
            target: "broker.registry",
            room_id = %room_id,
            epoch = epoch,
            worker_index = worker_index,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Handle a room's emptied notice.
    fn handle_room_emptied(&mut self, room_id: &RoomId, epoch: u64) {
        match self.rooms.get(room_id) {
            Some(managed) if managed.epoch == epoch => {
                self.remove_room(room_id);
                info!(
                    target: "broker.registry",
                    room_id = %room_id,
                    epoch = epoch,
                    total_rooms = self.rooms.len(),
                    "Room removed after emptying"
                );
            }
            _ => {
                // A fresh room with this id already replaced the sender.
                debug!(
                    target: "broker.registry",
                    room_id = %room_id,
                    epoch = epoch,
                    "Stale emptied notice ignored"
                );
            }
        }
    }

    /// Remove a room entry, cancelling its actor.
    ///
    /// Cleanup is spawned as a background task to avoid blocking the
    /// message loop.
    fn remove_room(&mut self, room_id: &RoomId) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };

        managed.handle.cancel();

        let room_id_owned = room_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "broker.registry",
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "broker.registry",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "broker.registry",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics.room_removed();
    }

    /// Get current broker status.
    fn get_status(&self) -> BrokerStatus {
        BrokerStatus {
            accepting_new: self.accepting_new,
            workers: self.pool.len(),
            rooms: self
                .rooms
                .iter()
                .map(|(room_id, managed)| RoomInfo {
                    room_id: room_id.clone(),
                    epoch: managed.epoch,
                    worker_index: managed.worker_index,
                    created_at: managed.created_at,
                })
                .collect(),
        }
    }

    /// Initiate graceful shutdown.
    fn initiate_shutdown(&mut self) {
        info!(
            target: "broker.registry",
            room_count = self.rooms.len(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.cancel_token.cancel();
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "broker.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        // Cancel all room actors (already done via parent token, but be explicit)
        for (room_id, managed) in &self.rooms {
            debug!(
                target: "broker.registry",
                room_id = %room_id,
                "Cancelling room actor"
            );
            managed.handle.cancel();
        }

        // Wait for all room tasks to complete
        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(Duration::from_secs(30), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "broker.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "broker.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "broker.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
        }

        info!(
            target: "broker.registry",
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let mut failed_rooms = Vec::new();

        for (room_id, managed) in &self.rooms {
            if managed.task_handle.is_finished() {
                warn!(
                    target: "broker.registry",
                    room_id = %room_id,
                    "Room actor task finished unexpectedly"
                );
                failed_rooms.push(room_id.clone());
            }
        }

        for room_id in failed_rooms {
            if let Some(managed) = self.rooms.remove(&room_id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "broker.registry",
                            room_id = %room_id,
                            "Room actor exited cleanly"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "broker.registry",
                                room_id = %room_id,
                                error = ?join_error,
                                "Room actor panicked"
                            );
                            self.metrics.record_panic(ActorType::Room);
                        }
                    }
                }

                self.metrics.room_removed();
            }
        }
    }
}
