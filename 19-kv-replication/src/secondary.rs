//! Secondary-role state machine: ordered, durable snapshot application.
//!
//! A snapshot is applied only when its sequence number is the next one
//! expected. The expected sequence advances, and the sender is acknowledged,
//! only after the write is durable. Acknowledging earlier would let the
//! primary count an update as replicated that a crash here could still lose.

use std::collections::BTreeMap;

use tracing::debug;

use crate::operation::{
    ClientReply, NodeId, OperationId, PersistRequest, Persisted, Snapshot, SnapshotAck,
};
use crate::store::KvStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect<O> {
    Persist(PersistRequest),
    Ack { to: O, ack: SnapshotAck },
}

struct PendingSnapshot<O> {
    originator: O,
    key: String,
    value: Option<String>,
}

pub struct Secondary<O> {
    id: NodeId,
    store: KvStore,
    next_expected_seq: u64,
    pending: BTreeMap<u64, PendingSnapshot<O>>,
}

impl<O: Clone> Secondary<O> {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            store: KvStore::new(),
            next_expected_seq: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn next_expected_seq(&self) -> u64 {
        self.next_expected_seq
    }

    pub fn get(&self, key: &str, id: u64) -> ClientReply {
        ClientReply::GetResult {
            key: key.to_string(),
            value: self.store.get(key),
            id,
        }
    }

    pub fn on_snapshot(&mut self, snapshot: Snapshot, from: O) -> Vec<Effect<O>> {
        let Snapshot { key, value, seq } = snapshot;

        if seq < self.next_expected_seq {
            return vec![Effect::Ack {
                to: from,
                ack: SnapshotAck { key, seq },
            }];
        }
        if seq > self.next_expected_seq {
            debug!(
                node = self.id,
                seq,
                expected = self.next_expected_seq,
                "ignoring out-of-order snapshot"
            );
            return Vec::new();
        }

        // A resend of the snapshot currently being persisted: the retry tick
        // already covers the persist, only the reply target may have changed.
        if let Some(pending) = self.pending.get_mut(&seq) {
            pending.originator = from;
            return Vec::new();
        }

        self.store.apply(&key, value.as_deref());
        self.pending.insert(
            seq,
            PendingSnapshot {
                originator: from,
                key: key.clone(),
                value: value.clone(),
            },
        );
        vec![Effect::Persist(PersistRequest {
            key,
            value,
            id: OperationId::Snapshot(seq),
        })]
    }

    pub fn on_persisted(&mut self, persisted: Persisted) -> Vec<Effect<O>> {
        let OperationId::Snapshot(seq) = persisted.id else {
            debug!(node = self.id, id = %persisted.id, "ignoring non-snapshot persistence ack");
            return Vec::new();
        };
        let Some(pending) = self.pending.remove(&seq) else {
            debug!(node = self.id, seq, "ignoring persistence ack for untracked snapshot");
            return Vec::new();
        };

        self.next_expected_seq += 1;
        debug!(node = self.id, seq, key = %pending.key, "snapshot durable");
        vec![Effect::Ack {
            to: pending.originator,
            ack: SnapshotAck {
                key: pending.key,
                seq,
            },
        }]
    }

    pub fn on_retry_tick(&self) -> Vec<Effect<O>> {
        self.pending
            .iter()
            .map(|(seq, pending)| {
                Effect::Persist(PersistRequest {
                    key: pending.key.clone(),
                    value: pending.value.clone(),
                    id: OperationId::Snapshot(*seq),
                })
            })
            .collect()
    }
}
