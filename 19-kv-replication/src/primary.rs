//! Primary-role coordination state machine.
//!
//! [`Primary`] owns the store and all outstanding-operation bookkeeping. It
//! performs no I/O: every method returns the [`Effect`]s the runtime has to
//! carry out (send a persist, hand a request to a replicator, reply to a
//! client, arm or cancel a timer, spawn or stop a replicator).
//!
//! # Completion rule
//!
//! A client write is acknowledged once two independent halves are done:
//!
//! 1. the persistence gateway confirmed the write (`pending_persist` entry
//!    removed), and
//! 2. every replicator the operation waited on acknowledged it or was
//!    removed from the cluster (its [`AckCollector`] is done).
//!
//! Whichever half finishes last triggers the reply. If the operation timer
//! fires first, the client gets `Failed` and every trace of the operation is
//! dropped, so late acknowledgments fall through as lookup misses.
//!
//! # Operation identity
//!
//! Clients pick their own operation ids, unique per client while in flight.
//! Internally every accepted write is keyed by `(client, id, generation)`.
//! The generation is fresh for each attempt, so a confirmation or timeout
//! left over from an earlier use of the same id never matches the current
//! one.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::ack::AckCollector;
use crate::operation::{
    ClientId, ClientReply, Generation, NodeId, Operation, OperationId, PersistRequest, Persisted,
    ReplicateRequest, Replicated, Timeout,
};
use crate::store::KvStore;

/// Work the runtime must perform on behalf of the primary.
///
/// `O` is the originator handle: whatever the runtime needs to deliver a
/// reply (a channel sender in production, a plain label in tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect<O> {
    Persist(PersistRequest),
    Replicate {
        replica: NodeId,
        request: ReplicateRequest,
    },
    Reply {
        to: O,
        reply: ClientReply,
    },
    ArmTimer(OperationId),
    /// Drops the timer for an operation that reached a terminal state.
    CancelTimer(OperationId),
    SpawnReplica(NodeId),
    StopReplica(NodeId),
}

struct PendingPersist {
    key: String,
    value: Option<String>,
}

/// Replication half of an operation. Created for every accepted write (with
/// an empty collector when there are no secondaries) so the originator is
/// always reachable from here.
struct PendingReplication<O> {
    originator: Option<O>,
    acks: AckCollector,
}

pub struct Primary<O> {
    id: NodeId,
    store: KvStore,
    replicas: BTreeSet<NodeId>,
    pending_persist: BTreeMap<OperationId, PendingPersist>,
    pending_replication: BTreeMap<OperationId, PendingReplication<O>>,
    /// Client writes awaiting a reply, as `(client, id)`.
    in_flight: BTreeSet<(ClientId, u64)>,
    timers: BTreeSet<OperationId>,
    next_generation: Generation,
}

impl<O: Clone> Primary<O> {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            store: KvStore::new(),
            replicas: BTreeSet::new(),
            pending_persist: BTreeMap::new(),
            pending_replication: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            timers: BTreeSet::new(),
            next_generation: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn replicas(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicas.iter().copied()
    }

    pub fn pending_persist_count(&self) -> usize {
        self.pending_persist.len()
    }

    pub fn pending_replication_count(&self) -> usize {
        self.pending_replication.len()
    }

    /// Whether `client` has an operation with this id still awaiting a reply.
    pub fn is_in_flight(&self, client: ClientId, id: u64) -> bool {
        self.in_flight.contains(&(client, id))
    }

    pub fn get(&self, key: &str, id: u64) -> ClientReply {
        ClientReply::GetResult {
            key: key.to_string(),
            value: self.store.get(key),
            id,
        }
    }

    /// Accepts an operation from `client`.
    ///
    /// Reads are answered immediately. Writes are applied to the store right
    /// away and fanned out to persistence and every current replica; the
    /// reply comes later through [`Primary::on_persisted`],
    /// [`Primary::on_replicated`] or [`Primary::on_timeout`].
    pub fn handle_operation(
        &mut self,
        client: ClientId,
        operation: Operation,
        originator: O,
    ) -> Vec<Effect<O>> {
        match operation {
            Operation::Insert { key, value, id } => {
                self.write(client, key, Some(value), id, originator)
            }
            Operation::Remove { key, id } => self.write(client, key, None, id, originator),
            Operation::Get { key, id } => vec![Effect::Reply {
                to: originator,
                reply: self.get(&key, id),
            }],
        }
    }

    fn write(
        &mut self,
        client: ClientId,
        key: String,
        value: Option<String>,
        id: u64,
        originator: O,
    ) -> Vec<Effect<O>> {
        if !self.in_flight.insert((client, id)) {
            warn!(node = self.id, client, id, "operation id already in flight for client, failing duplicate");
            return vec![Effect::Reply {
                to: originator,
                reply: ClientReply::Failed { id },
            }];
        }

        let op_id = OperationId::client(client, id, self.bump_generation());
        self.store.apply(&key, value.as_deref());

        let mut effects = Vec::with_capacity(self.replicas.len() + 2);
        effects.push(Effect::Persist(PersistRequest {
            key: key.clone(),
            value: value.clone(),
            id: op_id.clone(),
        }));
        for &replica in &self.replicas {
            effects.push(Effect::Replicate {
                replica,
                request: ReplicateRequest {
                    key: key.clone(),
                    value: value.clone(),
                    id: op_id.clone(),
                },
            });
        }

        self.pending_persist
            .insert(op_id.clone(), PendingPersist { key, value });
        self.pending_replication.insert(
            op_id.clone(),
            PendingReplication {
                originator: Some(originator),
                acks: AckCollector::new(self.replicas.iter().copied()),
            },
        );

        self.timers.insert(op_id.clone());
        effects.push(Effect::ArmTimer(op_id));

        effects
    }

    pub fn on_persisted(&mut self, persisted: Persisted) -> Vec<Effect<O>> {
        if self.pending_persist.remove(&persisted.id).is_none() {
            debug!(node = self.id, id = %persisted.id, "ignoring persistence ack for untracked operation");
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.try_complete(&persisted.id, &mut effects);
        effects
    }

    pub fn on_replicated(&mut self, replicated: Replicated) -> Vec<Effect<O>> {
        let Some(pending) = self.pending_replication.get_mut(&replicated.id) else {
            debug!(
                node = self.id,
                replica = replicated.replica,
                id = %replicated.id,
                "ignoring replication ack for untracked operation"
            );
            return Vec::new();
        };
        if !pending.acks.acknowledge(replicated.replica) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.try_complete(&replicated.id, &mut effects);
        effects
    }

    pub fn on_timeout(&mut self, timeout: Timeout) -> Vec<Effect<O>> {
        if !self.timers.remove(&timeout.id) {
            debug!(node = self.id, id = %timeout.id, "ignoring stale timeout");
            return Vec::new();
        }
        let persisted = self.pending_persist.remove(&timeout.id).is_none();
        let pending = self.pending_replication.remove(&timeout.id);
        self.release(&timeout.id);
        warn!(
            node = self.id,
            id = %timeout.id,
            persisted,
            outstanding = ?pending.as_ref().map(|p| p.acks.outstanding().collect::<Vec<_>>()),
            "operation timed out"
        );

        let mut effects = vec![Effect::CancelTimer(timeout.id.clone())];
        if let (OperationId::Client { id, .. }, Some(to)) =
            (timeout.id, pending.and_then(|p| p.originator))
        {
            effects.push(Effect::Reply {
                to,
                reply: ClientReply::Failed { id },
            });
        }
        effects
    }

    /// Re-sends every write the gateway has not yet confirmed.
    pub fn on_retry_tick(&self) -> Vec<Effect<O>> {
        self.pending_persist
            .iter()
            .map(|(id, pending)| {
                Effect::Persist(PersistRequest {
                    key: pending.key.clone(),
                    value: pending.value.clone(),
                    id: id.clone(),
                })
            })
            .collect()
    }

    /// Reconciles the replica set against an authoritative membership view.
    ///
    /// Departed replicas are stopped and forgiven by every operation still
    /// waiting on them, which may complete those operations. New replicas
    /// are spawned and sent one catch-up request per key in the store.
    /// Repeating the same view is a no-op.
    pub fn on_replica_set_changed(
        &mut self,
        members: impl IntoIterator<Item = NodeId>,
    ) -> Vec<Effect<O>> {
        let members: BTreeSet<NodeId> = members
            .into_iter()
            .filter(|member| *member != self.id)
            .collect();
        let removed: Vec<NodeId> = self.replicas.difference(&members).copied().collect();
        let added: Vec<NodeId> = members.difference(&self.replicas).copied().collect();
        if removed.is_empty() && added.is_empty() {
            debug!(node = self.id, "replica set unchanged");
            return Vec::new();
        }
        info!(node = self.id, ?added, ?removed, "replica set changed");

        let mut effects = Vec::new();
        for replica in removed {
            self.replicas.remove(&replica);
            effects.push(Effect::StopReplica(replica));

            let forgiven: Vec<OperationId> = self
                .pending_replication
                .iter_mut()
                .filter_map(|(id, pending)| pending.acks.worker_removed(replica).then(|| id.clone()))
                .collect();
            for id in forgiven {
                self.try_complete(&id, &mut effects);
            }
        }

        for replica in added {
            self.replicas.insert(replica);
            effects.push(Effect::SpawnReplica(replica));

            let generation = self.bump_generation();
            for (key, value) in self.store.iter() {
                let id = OperationId::Catchup {
                    replica,
                    key: key.clone(),
                    generation,
                };
                self.pending_replication.insert(
                    id.clone(),
                    PendingReplication {
                        originator: None,
                        acks: AckCollector::new([replica]),
                    },
                );
                effects.push(Effect::Replicate {
                    replica,
                    request: ReplicateRequest {
                        key: key.clone(),
                        value: Some(value.clone()),
                        id,
                    },
                });
            }
        }

        effects
    }

    fn try_complete(&mut self, id: &OperationId, effects: &mut Vec<Effect<O>>) {
        if self.pending_persist.contains_key(id) {
            return;
        }
        match self.pending_replication.get(id) {
            Some(pending) if pending.acks.is_done() => {}
            _ => return,
        }
        let Some(pending) = self.pending_replication.remove(id) else {
            return;
        };
        if self.timers.remove(id) {
            effects.push(Effect::CancelTimer(id.clone()));
        }
        self.release(id);

        match (id, pending.originator) {
            (OperationId::Client { id: client_id, .. }, Some(to)) => {
                debug!(node = self.id, %id, "operation acknowledged");
                effects.push(Effect::Reply {
                    to,
                    reply: ClientReply::Ack { id: *client_id },
                });
            }
            _ => debug!(node = self.id, %id, "catch-up replication complete"),
        }
    }

    /// Frees the client's id for reuse once its operation is terminal.
    fn release(&mut self, id: &OperationId) {
        if let OperationId::Client { client, id, .. } = id {
            self.in_flight.remove(&(*client, *id));
        }
    }

    fn bump_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}
