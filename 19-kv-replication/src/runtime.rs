//! Coordinator event loops and the handles clients use to reach them.
//!
//! Each coordinator is one Tokio task that owns its state machine and drains
//! a single ordered inbox. Client requests, persistence confirmations,
//! replication acknowledgments, timeouts and membership changes all arrive
//! through that inbox, so the state machine never needs a lock. The only
//! other wakeup is the retry tick, which re-sends unconfirmed persists.
//!
//! Collaborators (persistence gateway, replicators, timers) are separate
//! tasks owned by the coordinator. They hold a clone of the inbox sender and
//! post their results back into it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::KvError;
use crate::operation::{
    ClientId, ClientReply, NodeId, Operation, Persisted, Replicated, SnapshotAck, Timeout,
};
use crate::persistence::{Persistence, PersistenceGateway};
use crate::primary::{self, Primary};
use crate::replicator::{ReplicaConnector, Replicator, SnapshotDelivery, SnapshotLink};
use crate::secondary::{self, Secondary};
use crate::timer::TimerRegistry;

/// Where a primary sends `Ack`, `Failed` and `GetResult` replies.
pub type ReplySender = UnboundedSender<ClientReply>;

/// Point-in-time view of a primary, returned by [`PrimaryHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryStatus {
    pub node_id: NodeId,
    pub store: BTreeMap<String, String>,
    pub replicas: Vec<NodeId>,
    pub pending_persist: usize,
    pub pending_replication: usize,
    pub live_timers: usize,
}

/// Point-in-time view of a secondary, returned by [`SecondaryHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryStatus {
    pub node_id: NodeId,
    pub store: BTreeMap<String, String>,
    pub next_expected_seq: u64,
}

pub enum PrimaryEvent {
    Client {
        client: ClientId,
        operation: Operation,
        reply_to: ReplySender,
    },
    Persisted(Persisted),
    Replicated(Replicated),
    Timeout(Timeout),
    ReplicaSetChanged(BTreeSet<NodeId>),
    Status {
        respond_to: oneshot::Sender<PrimaryStatus>,
    },
    Shutdown,
}

impl From<Persisted> for PrimaryEvent {
    fn from(persisted: Persisted) -> Self {
        PrimaryEvent::Persisted(persisted)
    }
}

impl From<Replicated> for PrimaryEvent {
    fn from(replicated: Replicated) -> Self {
        PrimaryEvent::Replicated(replicated)
    }
}

impl From<Timeout> for PrimaryEvent {
    fn from(timeout: Timeout) -> Self {
        PrimaryEvent::Timeout(timeout)
    }
}

/// Handle for talking to a running primary as one client.
///
/// Operation ids only need to be unique per client. Clones act as the same
/// client; [`PrimaryHandle::new_client`] returns a handle for a separate one.
/// Operations submitted through [`PrimaryHandle::submit`] carry caller-chosen
/// ids, while the async helpers draw ids from a counter shared by clones.
/// Don't mix both id sources on one client.
#[derive(Clone)]
pub struct PrimaryHandle {
    node_id: NodeId,
    client: ClientId,
    inbox: UnboundedSender<PrimaryEvent>,
    clients: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

impl PrimaryHandle {
    fn first(node_id: NodeId, inbox: UnboundedSender<PrimaryEvent>) -> Self {
        Self::with_client(node_id, inbox, Arc::new(AtomicU64::new(0)))
    }

    fn with_client(
        node_id: NodeId,
        inbox: UnboundedSender<PrimaryEvent>,
        clients: Arc<AtomicU64>,
    ) -> Self {
        let client = clients.fetch_add(1, Ordering::Relaxed);
        Self {
            node_id,
            client,
            inbox,
            clients,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns a handle to the same primary acting as a new client, whose
    /// operation ids never collide with this one's.
    pub fn new_client(&self) -> Self {
        Self::with_client(self.node_id, self.inbox.clone(), Arc::clone(&self.clients))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Submits an operation; the reply arrives on `reply_to`.
    pub fn submit(&self, operation: Operation, reply_to: ReplySender) -> Result<(), KvError> {
        self.send(PrimaryEvent::Client {
            client: self.client,
            operation,
            reply_to,
        })
    }

    /// Inserts `key = value`, resolving once the write is acknowledged or
    /// has failed.
    pub async fn insert(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<ClientReply, KvError> {
        let operation = Operation::Insert {
            key: key.into(),
            value: value.into(),
            id: self.next_id(),
        };
        self.request(operation).await
    }

    pub async fn remove(&self, key: impl Into<String>) -> Result<ClientReply, KvError> {
        let operation = Operation::Remove {
            key: key.into(),
            id: self.next_id(),
        };
        self.request(operation).await
    }

    /// Reads the primary's store directly; never waits on replication.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, KvError> {
        let operation = Operation::Get {
            key: key.into(),
            id: self.next_id(),
        };
        get_result(self.node_id, self.request(operation).await?)
    }

    /// Delivers the complete, authoritative set of secondaries.
    pub fn replica_set_changed(
        &self,
        members: impl IntoIterator<Item = NodeId>,
    ) -> Result<(), KvError> {
        self.send(PrimaryEvent::ReplicaSetChanged(members.into_iter().collect()))
    }

    pub async fn status(&self) -> Result<PrimaryStatus, KvError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PrimaryEvent::Status { respond_to })?;
        response
            .await
            .map_err(|_| KvError::CoordinatorStopped(self.node_id))
    }

    pub fn shutdown(&self) -> Result<(), KvError> {
        self.send(PrimaryEvent::Shutdown)
    }

    async fn request(&self, operation: Operation) -> Result<ClientReply, KvError> {
        let (reply_to, mut replies) = unbounded_channel();
        self.submit(operation, reply_to)?;
        replies
            .recv()
            .await
            .ok_or(KvError::CoordinatorStopped(self.node_id))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, event: PrimaryEvent) -> Result<(), KvError> {
        self.inbox
            .send(event)
            .map_err(|_| KvError::CoordinatorStopped(self.node_id))
    }
}

/// Spawns a primary coordinator on the current Tokio runtime.
///
/// `persistence` builds the backend for the persistence gateway; it is
/// called again whenever the gateway restarts after a failed write.
/// `connector` is how replicators reach secondaries. The primary starts with
/// no secondaries until the first [`PrimaryHandle::replica_set_changed`].
pub fn spawn_primary<B, F>(
    node_id: NodeId,
    config: CoordinatorConfig,
    persistence: F,
    connector: Arc<dyn ReplicaConnector>,
) -> Result<PrimaryHandle, KvError>
where
    B: Persistence,
    F: FnMut() -> B + Send + 'static,
{
    config.validate()?;
    let (inbox_tx, inbox_rx) = unbounded_channel();

    let worker = PrimaryWorker {
        core: Primary::new(node_id),
        config,
        gateway: PersistenceGateway::spawn(node_id, persistence, inbox_tx.clone()),
        replicators: BTreeMap::new(),
        timers: TimerRegistry::new(config.operation_timeout, inbox_tx.clone()),
        connector,
        inbox_tx: inbox_tx.clone(),
        inbox: inbox_rx,
    };
    tokio::spawn(worker.run());

    Ok(PrimaryHandle::first(node_id, inbox_tx))
}

struct PrimaryWorker {
    core: Primary<ReplySender>,
    config: CoordinatorConfig,
    gateway: PersistenceGateway,
    replicators: BTreeMap<NodeId, Replicator>,
    timers: TimerRegistry<PrimaryEvent>,
    connector: Arc<dyn ReplicaConnector>,
    inbox_tx: UnboundedSender<PrimaryEvent>,
    inbox: UnboundedReceiver<PrimaryEvent>,
}

impl PrimaryWorker {
    async fn run(mut self) {
        let node = self.core.id();
        info!(node, config = ?self.config, "primary started");

        let tick = self.config.retry_tick;
        let mut retry = interval_at(Instant::now() + tick, tick);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                event = self.inbox.recv() => match event {
                    Some(PrimaryEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = retry.tick() => {
                    let effects = self.core.on_retry_tick();
                    if !effects.is_empty() {
                        debug!(node, resend = effects.len(), "re-sending unconfirmed persists");
                    }
                    self.apply(effects);
                }
            }
        }

        info!(node, "primary stopped");
    }

    fn handle_event(&mut self, event: PrimaryEvent) {
        let effects = match event {
            PrimaryEvent::Client {
                client,
                operation,
                reply_to,
            } => self.core.handle_operation(client, operation, reply_to),
            PrimaryEvent::Persisted(persisted) => self.core.on_persisted(persisted),
            PrimaryEvent::Replicated(replicated) => self.core.on_replicated(replicated),
            PrimaryEvent::Timeout(timeout) => self.core.on_timeout(timeout),
            PrimaryEvent::ReplicaSetChanged(members) => self.core.on_replica_set_changed(members),
            PrimaryEvent::Status { respond_to } => {
                let _ = respond_to.send(self.status());
                Vec::new()
            }
            PrimaryEvent::Shutdown => Vec::new(),
        };
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<primary::Effect<ReplySender>>) {
        for effect in effects {
            match effect {
                primary::Effect::Persist(request) => self.gateway.persist(request),
                primary::Effect::Replicate { replica, request } => {
                    match self.replicators.get(&replica) {
                        Some(replicator) => replicator.replicate(request),
                        None => warn!(replica, id = %request.id, "no replicator for replica"),
                    }
                }
                primary::Effect::Reply { to, reply } => {
                    if to.send(reply).is_err() {
                        debug!(node = self.core.id(), "originator went away before reply");
                    }
                }
                primary::Effect::ArmTimer(id) => self.timers.arm(id),
                primary::Effect::CancelTimer(id) => self.timers.cancel(&id),
                primary::Effect::SpawnReplica(replica) => {
                    let replicator = Replicator::spawn(
                        replica,
                        Arc::clone(&self.connector),
                        self.config.retry_tick,
                        self.inbox_tx.clone(),
                    );
                    self.replicators.insert(replica, replicator);
                }
                primary::Effect::StopReplica(replica) => {
                    self.replicators.remove(&replica);
                }
            }
        }
    }

    fn status(&self) -> PrimaryStatus {
        PrimaryStatus {
            node_id: self.core.id(),
            store: self.core.store().snapshot(),
            replicas: self.core.replicas().collect(),
            pending_persist: self.core.pending_persist_count(),
            pending_replication: self.core.pending_replication_count(),
            live_timers: self.timers.len(),
        }
    }
}

pub enum SecondaryEvent {
    Snapshot(SnapshotDelivery),
    Persisted(Persisted),
    Get {
        key: String,
        id: u64,
        respond_to: oneshot::Sender<ClientReply>,
    },
    Status {
        respond_to: oneshot::Sender<SecondaryStatus>,
    },
    Shutdown,
}

impl From<SnapshotDelivery> for SecondaryEvent {
    fn from(delivery: SnapshotDelivery) -> Self {
        SecondaryEvent::Snapshot(delivery)
    }
}

impl From<Persisted> for SecondaryEvent {
    fn from(persisted: Persisted) -> Self {
        SecondaryEvent::Persisted(persisted)
    }
}

/// Handle for talking to a running secondary.
#[derive(Clone)]
pub struct SecondaryHandle {
    node_id: NodeId,
    inbox: UnboundedSender<SecondaryEvent>,
    next_id: Arc<AtomicU64>,
}

impl SecondaryHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Link a replicator uses to deliver snapshots to this secondary.
    pub fn link(&self) -> SnapshotLink {
        SnapshotLink::new(self.inbox.clone())
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, KvError> {
        let (respond_to, response) = oneshot::channel();
        self.send(SecondaryEvent::Get {
            key: key.into(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            respond_to,
        })?;
        let reply = response
            .await
            .map_err(|_| KvError::CoordinatorStopped(self.node_id))?;
        get_result(self.node_id, reply)
    }

    pub async fn status(&self) -> Result<SecondaryStatus, KvError> {
        let (respond_to, response) = oneshot::channel();
        self.send(SecondaryEvent::Status { respond_to })?;
        response
            .await
            .map_err(|_| KvError::CoordinatorStopped(self.node_id))
    }

    pub fn shutdown(&self) -> Result<(), KvError> {
        self.send(SecondaryEvent::Shutdown)
    }

    fn send(&self, event: SecondaryEvent) -> Result<(), KvError> {
        self.inbox
            .send(event)
            .map_err(|_| KvError::CoordinatorStopped(self.node_id))
    }
}

/// Spawns a secondary coordinator on the current Tokio runtime.
///
/// A secondary's expected sequence starts at zero and belongs to the first
/// replicator that delivers to it. Snapshots from any later replicator are
/// refused, so a secondary that leaves the cluster must be replaced by a
/// fresh one before it rejoins.
pub fn spawn_secondary<B, F>(
    node_id: NodeId,
    config: CoordinatorConfig,
    persistence: F,
) -> Result<SecondaryHandle, KvError>
where
    B: Persistence,
    F: FnMut() -> B + Send + 'static,
{
    config.validate()?;
    let (inbox_tx, inbox_rx) = unbounded_channel();

    let worker = SecondaryWorker {
        core: Secondary::new(node_id),
        config,
        gateway: PersistenceGateway::spawn(node_id, persistence, inbox_tx.clone()),
        upstream: None,
        inbox: inbox_rx,
    };
    tokio::spawn(worker.run());

    Ok(SecondaryHandle {
        node_id,
        inbox: inbox_tx,
        next_id: Arc::new(AtomicU64::new(1)),
    })
}

struct SecondaryWorker {
    core: Secondary<UnboundedSender<SnapshotAck>>,
    config: CoordinatorConfig,
    gateway: PersistenceGateway,
    /// Ack channel of the replicator this secondary follows.
    upstream: Option<UnboundedSender<SnapshotAck>>,
    inbox: UnboundedReceiver<SecondaryEvent>,
}

impl SecondaryWorker {
    async fn run(mut self) {
        let node = self.core.id();
        info!(node, config = ?self.config, "secondary started");

        let tick = self.config.retry_tick;
        let mut retry = interval_at(Instant::now() + tick, tick);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                event = self.inbox.recv() => match event {
                    Some(SecondaryEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = retry.tick() => {
                    let effects = self.core.on_retry_tick();
                    self.apply(effects);
                }
            }
        }

        info!(node, "secondary stopped");
    }

    fn handle_event(&mut self, event: SecondaryEvent) {
        let effects = match event {
            SecondaryEvent::Snapshot(SnapshotDelivery { snapshot, reply_to }) => {
                if self.follows(&reply_to) {
                    self.core.on_snapshot(snapshot, reply_to)
                } else {
                    warn!(
                        node = self.core.id(),
                        seq = snapshot.seq,
                        "refusing snapshot from a second replicator, restart this secondary to rejoin"
                    );
                    Vec::new()
                }
            }
            SecondaryEvent::Persisted(persisted) => self.core.on_persisted(persisted),
            SecondaryEvent::Get {
                key,
                id,
                respond_to,
            } => {
                let _ = respond_to.send(self.core.get(&key, id));
                Vec::new()
            }
            SecondaryEvent::Status { respond_to } => {
                let _ = respond_to.send(SecondaryStatus {
                    node_id: self.core.id(),
                    store: self.core.store().snapshot(),
                    next_expected_seq: self.core.next_expected_seq(),
                });
                Vec::new()
            }
            SecondaryEvent::Shutdown => Vec::new(),
        };
        self.apply(effects);
    }

    /// Binds to the first replicator seen. Its sequence numbers are the only
    /// ones `next_expected_seq` can be compared against.
    fn follows(&mut self, reply_to: &UnboundedSender<SnapshotAck>) -> bool {
        match &self.upstream {
            Some(upstream) => upstream.same_channel(reply_to),
            None => {
                self.upstream = Some(reply_to.clone());
                true
            }
        }
    }

    fn apply(&mut self, effects: Vec<secondary::Effect<UnboundedSender<SnapshotAck>>>) {
        for effect in effects {
            match effect {
                secondary::Effect::Persist(request) => self.gateway.persist(request),
                secondary::Effect::Ack { to, ack } => {
                    if to.send(ack).is_err() {
                        debug!(node = self.core.id(), "replicator went away before snapshot ack");
                    }
                }
            }
        }
    }
}

fn get_result(node: NodeId, reply: ClientReply) -> Result<Option<String>, KvError> {
    match reply {
        ClientReply::GetResult { value, .. } => Ok(value),
        reply => Err(KvError::UnexpectedReply { node, reply }),
    }
}
