//! Delivery sink: the ordered hand-off from the consumer task to application code.
//!
//! The sink is a bounded FIFO channel with a single sender (the consumer's
//! background task) and any number of cloned receivers. Each delivered item
//! reaches exactly one receiver. When the channel is full, delivery waits,
//! which in turn stops the consumer from reading the transport.
//!
//! The sender is dropped exactly once, when the consumer stops; receivers then
//! observe end-of-stream after draining what was already delivered.

use futures::Stream;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Default sink capacity.
///
/// tokio channels cannot be zero-sized, so one slot is the closest match to a
/// rendezvous hand-off: at most one delivered event waits for a reader.
pub const DEFAULT_SINK_CAPACITY: usize = 1;

/// Create a sink with the given capacity (clamped to at least one).
pub(crate) fn channel<T>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender { tx },
        EventReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Every receiver has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReceiversDropped;

/// Sending half, owned by the consumer.
#[derive(Debug)]
pub(crate) struct EventSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> EventSender<T> {
    /// Hand one item to the sink, waiting for capacity.
    pub(crate) async fn deliver(&self, item: T) -> Result<(), ReceiversDropped> {
        self.tx.send(item).await.map_err(|_| ReceiversDropped)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half handed to application code.
///
/// Cheap to clone; all clones drain the same queue.
#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for EventReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> EventReceiver<T> {
    /// Receive the next item, or `None` once the consumer has stopped and
    /// everything delivered has been drained.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Consume the receiver as a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}
