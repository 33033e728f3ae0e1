use thiserror::Error;

use crate::operation::{ClientReply, NodeId};

/// Errors surfaced by the library API.
///
/// Protocol-level failures (a gateway that drops a write, a secondary that
/// never answers) never show up here: they are retried internally and only
/// become visible to clients as `ClientReply::Failed` once the deadline
/// passes.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    ConfigRead(#[from] std::io::Error),
    #[error("coordinator {0} has stopped")]
    CoordinatorStopped(NodeId),
    #[error("coordinator {node} sent an unexpected reply: {reply:?}")]
    UnexpectedReply { node: NodeId, reply: ClientReply },
}

/// A single failed write attempt reported by a persistence backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to persist key {key:?}: {reason}")]
pub struct PersistError {
    pub key: String,
    pub reason: String,
}
