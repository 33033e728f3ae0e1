//! Persistence backends and the gateway task that drives them.
//!
//! The gateway is the boundary between coordinators and durable storage.
//! It has no failure reply: when a backend write fails the gateway drops the
//! request, rebuilds the backend (a restart), and relies on the
//! coordinator's retry tick to send the request again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::operation::{NodeId, PersistRequest, Persisted};

/// Durable storage for single key/value writes. `value: None` deletes.
pub trait Persistence: Send + 'static {
    fn persist(&mut self, key: &str, value: Option<&str>) -> Result<(), PersistError>;
}

/// In-memory backend. Clones share the same map, so a backend rebuilt by a
/// gateway restart still sees everything written before it.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    data: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn contents(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Persistence for MemoryPersistence {
    fn persist(&mut self, key: &str, value: Option<&str>) -> Result<(), PersistError> {
        let mut data = self.lock();
        match value {
            Some(value) => {
                data.insert(key.to_string(), value.to_string());
            }
            None => {
                data.remove(key);
            }
        }
        Ok(())
    }
}

/// Wraps a backend and fails a random fraction of writes before they reach it.
pub struct FlakyPersistence<B> {
    inner: B,
    failure_rate: f64,
    rng: StdRng,
}

impl<B: Persistence> FlakyPersistence<B> {
    pub fn new(inner: B, failure_rate: f64) -> Self {
        Self::with_rng(inner, failure_rate, StdRng::from_entropy())
    }

    pub fn with_seed(inner: B, failure_rate: f64, seed: u64) -> Self {
        Self::with_rng(inner, failure_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: B, failure_rate: f64, rng: StdRng) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng,
        }
    }
}

impl<B: Persistence> Persistence for FlakyPersistence<B> {
    fn persist(&mut self, key: &str, value: Option<&str>) -> Result<(), PersistError> {
        if self.rng.gen_bool(self.failure_rate) {
            return Err(PersistError {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.persist(key, value)
    }
}

/// Handle to a running persistence gateway task.
///
/// Owned by exactly one coordinator. Dropping the handle stops the task.
pub struct PersistenceGateway {
    node: NodeId,
    requests: UnboundedSender<PersistRequest>,
    task: JoinHandle<()>,
}

impl PersistenceGateway {
    /// Spawns the gateway. `factory` builds the backend at start and again
    /// after every failed write. Confirmations go to `inbox`.
    pub fn spawn<B, F, E>(node: NodeId, factory: F, inbox: UnboundedSender<E>) -> Self
    where
        B: Persistence,
        F: FnMut() -> B + Send + 'static,
        E: From<Persisted> + Send + 'static,
    {
        let (requests, requests_rx) = unbounded_channel();
        let task = tokio::spawn(run_gateway(node, factory, requests_rx, inbox));
        Self {
            node,
            requests,
            task,
        }
    }

    pub fn persist(&self, request: PersistRequest) {
        if self.requests.send(request).is_err() {
            warn!(node = self.node, "persistence gateway is gone");
        }
    }
}

impl Drop for PersistenceGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_gateway<B, F, E>(
    node: NodeId,
    mut factory: F,
    mut requests: UnboundedReceiver<PersistRequest>,
    inbox: UnboundedSender<E>,
) where
    B: Persistence,
    F: FnMut() -> B,
    E: From<Persisted>,
{
    let mut backend = factory();
    let mut restarts: u64 = 0;

    while let Some(request) = requests.recv().await {
        match backend.persist(&request.key, request.value.as_deref()) {
            Ok(()) => {
                let persisted = Persisted {
                    key: request.key,
                    id: request.id,
                };
                if inbox.send(E::from(persisted)).is_err() {
                    debug!(node, "coordinator gone, persistence gateway exiting");
                    break;
                }
            }
            Err(err) => {
                restarts += 1;
                warn!(node, id = %request.id, error = %err, restarts, "persist failed, restarting backend");
                backend = factory();
            }
        }
    }
}
