//! Per-job subscriber channel — fan-out of progress events to attached listeners.
//!
//! Each listener owns a bounded mailbox. Publishing never awaits: a full
//! mailbox means the listener is stalled and misses that event, a closed one
//! means the listener went away and it is pruned in the same pass. There is no
//! history buffer; a listener only sees events published after it attached.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::event::ProgressEvent;

/// Identifies one attached listener within a channel.
pub type ListenerId = u64;

/// Receiving end handed to a subscriber.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    rx: mpsc::Receiver<ProgressEvent>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next event. `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<ProgressEvent> {
        ReceiverStream::new(self.rx)
    }
}

struct Inner {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, mpsc::Sender<ProgressEvent>)>,
    closed: bool,
}

/// Fan-out mailbox for one job.
pub struct SubscriberChannel {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SubscriberChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberChannel")
            .field("capacity", &self.capacity)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl SubscriberChannel {
    /// Create a channel whose listeners buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                next_id: 0,
                listeners: Vec::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new listener. On a closed channel the listener ends immediately.
    pub fn attach(&self) -> Listener {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.listeners.push((id, tx));
        }
        debug!(listener = id, "Listener attached");
        Listener { id, rx }
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn detach(&self, id: ListenerId) {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        if inner.listeners.len() != before {
            debug!(listener = id, "Listener detached");
        }
    }

    /// Deliver `event` to every attached listener, in attach order.
    ///
    /// Returns how many listeners received it.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;

        inner.listeners.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(listener = *id, "Listener stalled, skipping event");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(listener = *id, "Pruning disconnected listener");
                false
            }
        });

        delivered
    }

    /// Drop every listener so their streams end. Later attaches end immediately.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.listeners.clear();
    }

    /// Number of registered listeners, including ones not yet pruned.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}
