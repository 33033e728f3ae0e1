//! Per-secondary replication workers and how they reach their secondary.
//!
//! A [`Replicator`] turns the primary's replicate requests into a dense,
//! ordered stream of sequence-numbered snapshots for one secondary. It keeps
//! every unacknowledged snapshot and re-sends all of them on each retry tick,
//! so the secondary (which only applies the next expected sequence) always
//! receives what it needs to make progress. The primary never retries
//! replication itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::operation::{NodeId, ReplicateRequest, Replicated, Snapshot, SnapshotAck};

/// A snapshot plus the channel its acknowledgment should go back on.
#[derive(Debug, Clone)]
pub struct SnapshotDelivery {
    pub snapshot: Snapshot,
    pub reply_to: UnboundedSender<SnapshotAck>,
}

/// Sending side of a secondary's snapshot inbox.
#[derive(Clone)]
pub struct SnapshotLink {
    deliver: Arc<dyn Fn(SnapshotDelivery) -> bool + Send + Sync>,
}

impl SnapshotLink {
    pub fn new<E>(inbox: UnboundedSender<E>) -> Self
    where
        E: From<SnapshotDelivery> + Send + 'static,
    {
        Self {
            deliver: Arc::new(move |delivery| inbox.send(E::from(delivery)).is_ok()),
        }
    }

    /// Returns `false` if the secondary is gone.
    pub fn deliver(&self, delivery: SnapshotDelivery) -> bool {
        (self.deliver)(delivery)
    }
}

/// Resolves a secondary's identity to a link. This is the transport seam:
/// the in-process [`LocalCluster`] is one implementation.
pub trait ReplicaConnector: Send + Sync + 'static {
    fn connect(&self, replica: NodeId) -> Option<SnapshotLink>;
}

/// Registry of secondaries running in this process.
#[derive(Clone, Default)]
pub struct LocalCluster {
    links: Arc<RwLock<HashMap<NodeId, SnapshotLink>>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica: NodeId, link: SnapshotLink) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(replica, link);
    }

    pub fn unregister(&self, replica: NodeId) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&replica);
    }
}

impl ReplicaConnector for LocalCluster {
    fn connect(&self, replica: NodeId) -> Option<SnapshotLink> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&replica)
            .cloned()
    }
}

/// Handle to a replication worker task. Dropping it stops the worker.
pub struct Replicator {
    replica: NodeId,
    requests: UnboundedSender<ReplicateRequest>,
    task: JoinHandle<()>,
}

impl Replicator {
    /// Starts streaming to `replica` from sequence number 0.
    ///
    /// The secondary must be a fresh instance: a running secondary only
    /// follows the first replicator that reached it and refuses the rest.
    pub fn spawn<E>(
        replica: NodeId,
        connector: Arc<dyn ReplicaConnector>,
        retry_tick: Duration,
        inbox: UnboundedSender<E>,
    ) -> Self
    where
        E: From<Replicated> + Send + 'static,
    {
        let (requests, requests_rx) = unbounded_channel();
        let (acks, acks_rx) = unbounded_channel();
        let worker = ReplicatorWorker {
            replica,
            connector,
            link: None,
            next_seq: 0,
            pending: BTreeMap::new(),
            acks,
            inbox,
        };
        let task = tokio::spawn(worker.run(requests_rx, acks_rx, retry_tick));
        info!(replica, "replicator started");
        Self {
            replica,
            requests,
            task,
        }
    }

    pub fn replica(&self) -> NodeId {
        self.replica
    }

    pub fn replicate(&self, request: ReplicateRequest) {
        if self.requests.send(request).is_err() {
            warn!(replica = self.replica, "replicator is gone");
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.task.abort();
        info!(replica = self.replica, "replicator stopped");
    }
}

struct ReplicatorWorker<E> {
    replica: NodeId,
    connector: Arc<dyn ReplicaConnector>,
    link: Option<SnapshotLink>,
    next_seq: u64,
    pending: BTreeMap<u64, ReplicateRequest>,
    acks: UnboundedSender<SnapshotAck>,
    inbox: UnboundedSender<E>,
}

impl<E: From<Replicated>> ReplicatorWorker<E> {
    async fn run(
        mut self,
        mut requests: UnboundedReceiver<ReplicateRequest>,
        mut acks: UnboundedReceiver<SnapshotAck>,
        retry_tick: Duration,
    ) {
        let mut retry = interval_at(Instant::now() + retry_tick, retry_tick);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                Some(ack) = acks.recv() => {
                    if !self.on_ack(ack) {
                        break;
                    }
                }
                _ = retry.tick() => self.resend_pending(),
            }
        }
    }

    fn on_request(&mut self, request: ReplicateRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, request);
        self.send(seq);
    }

    /// Returns `false` once the coordinator is gone.
    fn on_ack(&mut self, ack: SnapshotAck) -> bool {
        let Some(request) = self.pending.remove(&ack.seq) else {
            return true;
        };
        debug!(replica = self.replica, seq = ack.seq, id = %request.id, "snapshot acknowledged");
        let replicated = Replicated {
            replica: self.replica,
            key: request.key,
            id: request.id,
        };
        self.inbox.send(E::from(replicated)).is_ok()
    }

    fn resend_pending(&mut self) {
        let seqs: Vec<u64> = self.pending.keys().copied().collect();
        for seq in seqs {
            self.send(seq);
        }
    }

    fn send(&mut self, seq: u64) {
        let Some(request) = self.pending.get(&seq) else {
            return;
        };
        if self.link.is_none() {
            self.link = self.connector.connect(self.replica);
        }
        let Some(link) = &self.link else {
            debug!(replica = self.replica, seq, "no link to secondary yet");
            return;
        };

        let delivery = SnapshotDelivery {
            snapshot: Snapshot {
                key: request.key.clone(),
                value: request.value.clone(),
                seq,
            },
            reply_to: self.acks.clone(),
        };
        if !link.deliver(delivery) {
            debug!(replica = self.replica, seq, "secondary unreachable, will reconnect");
            self.link = None;
        }
    }
}
