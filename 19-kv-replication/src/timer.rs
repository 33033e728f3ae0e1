//! Single-shot per-operation timeout timers.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::operation::{OperationId, Timeout};

/// Posts a [`Timeout`] into a coordinator inbox once its deadline passes.
///
/// Dropping the timer cancels it. A timer that already fired may have left
/// its event in the inbox; the coordinator recognizes it as stale because
/// the id's generation is no longer live.
pub struct OperationTimer {
    task: JoinHandle<()>,
}

impl OperationTimer {
    pub fn arm<E>(id: OperationId, deadline: Duration, inbox: UnboundedSender<E>) -> Self
    where
        E: From<Timeout> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = inbox.send(E::from(Timeout { id }));
        });
        Self { task }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Live timers of one coordinator, keyed by operation id.
pub struct TimerRegistry<E> {
    deadline: Duration,
    inbox: UnboundedSender<E>,
    timers: HashMap<OperationId, OperationTimer>,
}

impl<E> TimerRegistry<E>
where
    E: From<Timeout> + Send + 'static,
{
    pub fn new(deadline: Duration, inbox: UnboundedSender<E>) -> Self {
        Self {
            deadline,
            inbox,
            timers: HashMap::new(),
        }
    }

    /// Arms a timer for `id`, replacing (and cancelling) any previous one.
    pub fn arm(&mut self, id: OperationId) {
        let timer = OperationTimer::arm(id.clone(), self.deadline, self.inbox.clone());
        self.timers.insert(id, timer);
    }

    pub fn cancel(&mut self, id: &OperationId) {
        self.timers.remove(id);
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
