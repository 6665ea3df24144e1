//! Status stream: push feed of task and chain transitions.
//!
//! Each subscription owns a bounded queue. The publisher waits at most the
//! configured observer timeout on a full queue; after that the subscription
//! is marked stalled and only gets what fits without waiting, until it has
//! drained its queue. A dropped subscription is forgotten.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;
use crate::runtime::chain::ChainStatus;
use crate::runtime::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    Task(TaskStatus),
    Chain(ChainStatus),
}

impl StatusEvent {
    pub fn chain_name(&self) -> &str {
        match self {
            StatusEvent::Task(t) => &t.chain_name,
            StatusEvent::Chain(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Tag(String),
    Chain(String),
}

impl StatusFilter {
    pub fn matches(&self, event: &StatusEvent) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Chain(name) => event.chain_name() == name,
            StatusFilter::Tag(tag) => match event {
                StatusEvent::Task(t) => t.tags.contains(tag),
                StatusEvent::Chain(c) => c.tags.contains(tag),
            },
        }
    }
}

struct Observer {
    filter: StatusFilter,
    tx: mpsc::Sender<StatusEvent>,
    stalled: Arc<AtomicBool>,
}

/// Receiving end handed to an observer. Dropping it unsubscribes.
#[derive(Debug)]
pub struct StatusSubscription {
    id: Uuid,
    rx: mpsc::Receiver<StatusEvent>,
}

impl StatusSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next matching event, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }
}

pub struct StatusStream {
    observers: DashMap<Uuid, Observer>,
    buffer: usize,
    timeout: Duration,
}

impl StatusStream {
    pub fn new(buffer: usize, timeout: Duration) -> Self {
        Self {
            observers: DashMap::new(),
            buffer: buffer.max(1),
            timeout,
        }
    }

    pub fn subscribe(&self, filter: StatusFilter) -> StatusSubscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.observers.insert(
            id,
            Observer {
                filter,
                tx,
                stalled: Arc::new(AtomicBool::new(false)),
            },
        );
        StatusSubscription { id, rx }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub async fn publish(&self, event: &StatusEvent) {
        // Snapshot senders first; no map guard may be held across an await.
        let targets: Vec<(Uuid, mpsc::Sender<StatusEvent>, Arc<AtomicBool>)> = self
            .observers
            .iter()
            .filter(|o| o.filter.matches(event))
            .map(|o| (*o.key(), o.tx.clone(), o.stalled.clone()))
            .collect();

        for (id, tx, stalled) in targets {
            if stalled.load(Ordering::Acquire) {
                if tx.capacity() < tx.max_capacity() {
                    self.offer(id, &tx, event);
                    continue;
                }
                stalled.store(false, Ordering::Release);
                debug!(observer = %id, "Observer caught up");
            }

            match tx.send_timeout(event.clone(), self.timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Closed(_)) => self.forget(id),
                Err(SendTimeoutError::Timeout(_)) => {
                    stalled.store(true, Ordering::Release);
                    warn!(observer = %id, "Observer stalled, skipping events until it drains");
                }
            }
        }
    }

    /// Delivery to a stalled observer: only if there is room right now.
    fn offer(&self, id: Uuid, tx: &mpsc::Sender<StatusEvent>, event: &StatusEvent) {
        match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => self.forget(id),
        }
    }

    fn forget(&self, id: Uuid) {
        self.observers.remove(&id);
        debug!(observer = %id, "Observer went away");
    }

    pub(crate) fn close(&self) {
        self.observers.clear();
    }
}
