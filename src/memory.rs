//! In-process log store.
//!
//! [`InMemoryLogStore`] keeps every stream in memory and pushes appends to
//! live subscribers. It also lets callers inject transport faults: dropping
//! all live subscriptions of a stream, and failing the next subscribe or read
//! calls.

use crate::error::StreamError;
use crate::store::{
    AppendResult, LogStore, ProposedEvent, ReadOptions, RecordedEvent, Subscription,
    SubscriptionEvent,
};
use crate::types::{Direction, ReadFrom, StreamName, StreamPosition, SubscribeFrom};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

struct StreamLog {
    events: Vec<RecordedEvent>,
    /// Incremented each time live subscriptions are dropped.
    drops: u64,
    /// Bumped on every append and drop.
    signal: watch::Sender<u64>,
}

impl StreamLog {
    fn new() -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            events: Vec::new(),
            drops: 0,
            signal,
        }
    }

    fn notify(&self) {
        self.signal.send_modify(|version| *version += 1);
    }
}

#[derive(Default)]
struct Faults {
    failing_subscribes: u32,
    failing_reads: u32,
}

struct Shared {
    streams: Mutex<HashMap<StreamName, StreamLog>>,
    faults: Mutex<Faults>,
    subscribe_calls: AtomicU64,
    closed_handles: AtomicU64,
}

/// In-memory implementation of [`LogStore`].
///
/// Each clone is an independent client handle onto the same set of streams:
/// closing one handle does not affect the others.
pub struct InMemoryLogStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLogStore")
            .field("streams", &self.shared.streams.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Clone for InMemoryLogStore {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStore {
    /// An empty store with no streams.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                subscribe_calls: AtomicU64::new(0),
                closed_handles: AtomicU64::new(0),
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of events in `stream`.
    pub fn len(&self, stream: &StreamName) -> usize {
        self.shared
            .streams
            .lock()
            .get(stream)
            .map_or(0, |log| log.events.len())
    }

    /// All events of `stream`, in order.
    pub fn events(&self, stream: &StreamName) -> Vec<RecordedEvent> {
        self.shared
            .streams
            .lock()
            .get(stream)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    /// Total subscribe calls made through any handle, including failed ones.
    pub fn subscribe_calls(&self) -> u64 {
        self.shared.subscribe_calls.load(Ordering::Acquire)
    }

    /// Number of handles onto these streams that have been closed.
    pub fn closed_handles(&self) -> u64 {
        self.shared.closed_handles.load(Ordering::Acquire)
    }

    /// Drop every live subscription on `stream`.
    ///
    /// Each affected subscription yields one
    /// [`SubscriptionDropped`](SubscriptionEvent::SubscriptionDropped) and
    /// nothing after it.
    pub fn drop_subscriptions(&self, stream: &StreamName) {
        let mut streams = self.shared.streams.lock();
        let log = streams.entry(stream.clone()).or_insert_with(StreamLog::new);
        log.drops += 1;
        log.notify();
    }

    /// Fail the next `count` subscribe calls with a retryable error.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.shared.faults.lock().failing_subscribes = count;
    }

    /// Fail the next `count` reads with a retryable error.
    pub fn fail_next_reads(&self, count: u32) {
        self.shared.faults.lock().failing_reads = count;
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl LogStore for InMemoryLogStore {
    type Subscription = InMemorySubscription;

    async fn read_stream(
        &self,
        stream: &StreamName,
        options: ReadOptions,
        count: u64,
    ) -> Result<Vec<RecordedEvent>, StreamError> {
        self.ensure_open()?;
        if Self::take_fault(&mut self.shared.faults.lock().failing_reads) {
            return Err(StreamError::unavailable("injected read failure"));
        }

        let streams = self.shared.streams.lock();
        let events = match streams.get(stream) {
            Some(log) if !log.events.is_empty() => &log.events,
            _ => {
                return Err(StreamError::NotFound {
                    stream: stream.clone(),
                })
            }
        };

        let len = events.len() as u64;
        let count = count.min(len) as usize;

        let batch = match options.direction {
            Direction::Forwards => {
                let start = match options.from {
                    ReadFrom::Start => 0,
                    ReadFrom::End => len,
                    ReadFrom::At(p) => p.value().min(len),
                } as usize;
                events[start..].iter().take(count).cloned().collect()
            }
            Direction::Backwards => {
                let end = match options.from {
                    ReadFrom::Start => 0,
                    ReadFrom::End => len - 1,
                    ReadFrom::At(p) => p.value().min(len - 1),
                } as usize;
                events[..=end].iter().rev().take(count).cloned().collect()
            }
        };

        Ok(batch)
    }

    async fn subscribe(
        &self,
        stream: &StreamName,
        from: SubscribeFrom,
    ) -> Result<InMemorySubscription, StreamError> {
        self.shared.subscribe_calls.fetch_add(1, Ordering::AcqRel);
        self.ensure_open()?;
        if Self::take_fault(&mut self.shared.faults.lock().failing_subscribes) {
            return Err(StreamError::unavailable("injected subscribe failure"));
        }

        let mut streams = self.shared.streams.lock();
        let log = streams.entry(stream.clone()).or_insert_with(StreamLog::new);

        Ok(InMemorySubscription {
            shared: self.shared.clone(),
            closed: self.closed.clone(),
            stream: stream.clone(),
            next: from.first_position().value(),
            drop_epoch: log.drops,
            signal: log.signal.subscribe(),
            dropped: false,
        })
    }

    async fn append(
        &self,
        stream: &StreamName,
        event: ProposedEvent,
    ) -> Result<AppendResult, StreamError> {
        self.ensure_open()?;

        let mut streams = self.shared.streams.lock();
        let log = streams.entry(stream.clone()).or_insert_with(StreamLog::new);
        let position = StreamPosition::new(log.events.len() as u64);

        log.events.push(RecordedEvent {
            event_id: event.event_id,
            stream: stream.clone(),
            position,
            event_type: event.event_type,
            schema_version: event.schema_version,
            content_type: event.content_type,
            data: event.data,
            metadata: event.metadata,
        });
        log.notify();

        Ok(AppendResult { position })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.closed_handles.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Live subscription on an [`InMemoryLogStore`] stream.
pub struct InMemorySubscription {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    stream: StreamName,
    next: u64,
    drop_epoch: u64,
    signal: watch::Receiver<u64>,
    dropped: bool,
}

impl std::fmt::Debug for InMemorySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySubscription")
            .field("stream", &self.stream)
            .field("next", &self.next)
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl InMemorySubscription {
    /// Check the log for the next signal. Marks the watch version as seen
    /// under the same lock appends take, so no wake-up is lost.
    fn poll_log(&mut self) -> Option<SubscriptionEvent> {
        if self.dropped {
            return Some(SubscriptionEvent::SubscriptionDropped { reason: None });
        }
        if self.closed.load(Ordering::Acquire) {
            self.dropped = true;
            return Some(SubscriptionEvent::SubscriptionDropped {
                reason: Some(StreamError::Closed),
            });
        }

        let streams = self.shared.streams.lock();
        self.signal.borrow_and_update();

        let log = streams.get(&self.stream)?;
        if log.drops > self.drop_epoch {
            self.dropped = true;
            return Some(SubscriptionEvent::SubscriptionDropped {
                reason: Some(StreamError::unavailable("subscription dropped by server")),
            });
        }

        let event = log.events.get(self.next as usize)?.clone();
        self.next += 1;
        Some(SubscriptionEvent::EventAppeared(Some(event)))
    }
}

impl Subscription for InMemorySubscription {
    async fn recv(&mut self) -> SubscriptionEvent {
        loop {
            if let Some(event) = self.poll_log() {
                return event;
            }

            if self.signal.changed().await.is_err() {
                self.dropped = true;
                return SubscriptionEvent::SubscriptionDropped { reason: None };
            }
        }
    }
}
