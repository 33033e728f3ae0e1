//! Replication acknowledgment aggregation.

use std::collections::BTreeSet;

use crate::operation::NodeId;

/// Tracks which replicators still owe an acknowledgment for one operation.
///
/// The set is fixed at creation and only ever shrinks. A replicator that is
/// removed from the cluster can never acknowledge, so its removal counts as
/// an acknowledgment; otherwise an operation could wait forever on a
/// secondary that no longer exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckCollector {
    outstanding: BTreeSet<NodeId>,
}

impl AckCollector {
    pub fn new(workers: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            outstanding: workers.into_iter().collect(),
        }
    }

    /// Marks `worker` as done. Returns `false` if it was not outstanding
    /// (duplicate ack, or a worker this operation never waited on).
    pub fn acknowledge(&mut self, worker: NodeId) -> bool {
        self.outstanding.remove(&worker)
    }

    /// Forgives a worker that left the cluster. Same effect as an ack.
    pub fn worker_removed(&mut self, worker: NodeId) -> bool {
        self.outstanding.remove(&worker)
    }

    pub fn is_waiting_on(&self, worker: NodeId) -> bool {
        self.outstanding.contains(&worker)
    }

    pub fn is_done(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.outstanding.iter().copied()
    }
}
