//! Primary/secondary replicated key-value store.
//!
//! A primary node accepts client writes and reads, persists every write
//! through a persistence gateway, replicates it to each secondary through a
//! per-secondary replicator, and only acknowledges the client once both have
//! confirmed. Every operation is bounded by a deadline: if persistence or
//! replication has not completed in time, the client gets `Failed` instead.
//!
//! # Architecture
//!
//! - **Core state machines** ([`primary`], [`secondary`], [`ack`]) are
//!   synchronous and do no I/O. They take events and return the effects the
//!   runtime must carry out, which keeps them deterministic and easy to test.
//! - **Runtime** ([`runtime`]) runs one Tokio task per coordinator that owns
//!   the core state machine and drains a single ordered inbox. Persistence
//!   acks, replication acks, timeouts and membership changes all arrive
//!   through that inbox.
//! - **Collaborators** ([`persistence`], [`replicator`], [`timer`]) are
//!   independent tasks that only talk to the coordinator through channels.
//!
//! # Modules
//!
//! - [`operation`]: operation ids, client operations and wire messages
//! - [`store`]: in-memory key-value map owned by a coordinator
//! - [`ack`]: per-operation replication acknowledgment aggregation
//! - [`primary`]: primary-role state machine and membership reconciliation
//! - [`secondary`]: secondary-role ordered snapshot application
//! - [`persistence`]: persistence backends and the restarting gateway task
//! - [`replicator`]: per-secondary replication worker and replica connectors
//! - [`timer`]: single-shot per-operation timeout timers
//! - [`runtime`]: coordinator event loops and client handles
//! - [`config`]: coordinator timing configuration
//! - [`protocol`]: REPL command parsing for the `kv-node` binary

pub mod ack;
pub mod config;
pub mod error;
pub mod operation;
pub mod persistence;
pub mod primary;
pub mod protocol;
pub mod replicator;
pub mod runtime;
pub mod secondary;
pub mod store;
pub mod timer;

pub use config::CoordinatorConfig;
pub use error::{KvError, PersistError};
pub use operation::{ClientId, ClientReply, NodeId, Operation, OperationId};
