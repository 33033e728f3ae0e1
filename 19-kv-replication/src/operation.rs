//! Operation identities and the messages exchanged between components.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a node in the cluster (primary or secondary).
pub type NodeId = u64;

/// Identity of a client talking to a primary. Client-chosen operation ids
/// are only unique per client.
pub type ClientId = u64;

/// Per-primary counter stamped on every accepted write and catch-up.
///
/// A client may reuse an operation id once it has a reply, so the id alone
/// cannot tell a confirmation for the current attempt from a late one for an
/// earlier attempt. The generation can.
pub type Generation = u64;

/// Join key across persistence, replication and timer bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationId {
    /// A client write; the originator is owed exactly one reply.
    Client {
        client: ClientId,
        id: u64,
        generation: Generation,
    },
    /// Catch-up replication of one key to a newly joined secondary. No reply
    /// is owed to anyone.
    Catchup {
        replica: NodeId,
        key: String,
        generation: Generation,
    },
    /// Persistence of a snapshot on a secondary, keyed by its sequence number.
    Snapshot(u64),
}

impl OperationId {
    pub fn client(client: ClientId, id: u64, generation: Generation) -> Self {
        OperationId::Client {
            client,
            id,
            generation,
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationId::Client {
                client,
                id,
                generation,
            } => write!(f, "client:{client}/{id}#{generation}"),
            OperationId::Catchup {
                replica,
                key,
                generation,
            } => write!(f, "catchup:{replica}:{key}#{generation}"),
            OperationId::Snapshot(seq) => write!(f, "snapshot:{seq}"),
        }
    }
}

/// Operations a client can submit to a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Insert { key: String, value: String, id: u64 },
    Remove { key: String, id: u64 },
    Get { key: String, id: u64 },
}

impl Operation {
    pub fn id(&self) -> u64 {
        match self {
            Operation::Insert { id, .. } | Operation::Remove { id, .. } | Operation::Get { id, .. } => {
                *id
            }
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Operation::Insert { key, .. } | Operation::Remove { key, .. } | Operation::Get { key, .. } => {
                key
            }
        }
    }
}

/// Replies delivered to the originator of a client operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientReply {
    Ack { id: u64 },
    Failed { id: u64 },
    GetResult { key: String, value: Option<String>, id: u64 },
}

impl ClientReply {
    pub fn id(&self) -> u64 {
        match self {
            ClientReply::Ack { id } | ClientReply::Failed { id } | ClientReply::GetResult { id, .. } => {
                *id
            }
        }
    }
}

/// Request to durably store one write. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub key: String,
    pub value: Option<String>,
    pub id: OperationId,
}

/// Emitted by the persistence gateway once a request is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    pub key: String,
    pub id: OperationId,
}

/// Request handed to a replicator for delivery to its secondary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateRequest {
    pub key: String,
    pub value: Option<String>,
    pub id: OperationId,
}

/// Emitted by a replicator once its secondary has durably applied a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replicated {
    pub replica: NodeId,
    pub key: String,
    pub id: OperationId,
}

/// Sequence-numbered update sent from a replicator to a secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: String,
    pub value: Option<String>,
    pub seq: u64,
}

/// Secondary's confirmation that `seq` is applied and durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAck {
    pub key: String,
    pub seq: u64,
}

/// Fired by an operation timer when its deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeout {
    pub id: OperationId,
}
