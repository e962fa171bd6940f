//! Replay-then-subscribe consumer.

use crate::error::StreamError;
use crate::event::{EventEnvelope, StreamEvent};
use crate::replay::{replay_through, DEFAULT_REPLAY_PAGE_SIZE};
use crate::resolver::resolve_last;
use crate::retry::RetryConfig;
use crate::sink::{self, EventReceiver, EventSender, DEFAULT_SINK_CAPACITY};
use crate::store::LogStore;
use crate::subscriber::{LiveSubscriber, StopReason};
use crate::types::{StreamName, SubscribeFrom};
use std::marker::PhantomData;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, Instrument, Span};

/// Builder for configuring an [`EventStreamConsumer`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ConsumerBuilder<E, S> {
    store: S,
    sink_capacity: usize,
    replay_page_size: u64,
    retry: RetryConfig,
    span: Option<Span>,
    _event: PhantomData<fn() -> E>,
}

impl<E: StreamEvent, S: LogStore> ConsumerBuilder<E, S> {
    pub(crate) fn new(store: S) -> Self {
        Self {
            store,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            replay_page_size: DEFAULT_REPLAY_PAGE_SIZE,
            retry: RetryConfig::default(),
            span: None,
            _event: PhantomData,
        }
    }

    /// Set how many delivered events may wait for a reader.
    ///
    /// Values below one are raised to one. Once the sink is full the consumer
    /// stops reading from the store until a reader catches up.
    pub fn sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    /// Set how many events each replay read fetches.
    pub fn replay_page_size(mut self, size: u64) -> Self {
        self.replay_page_size = size;
        self
    }

    /// Set the resubscribe backoff policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the span the consumer logs under.
    ///
    /// Defaults to an `info`-level `consumer` span carrying the stream name.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Build the consumer.
    pub fn build(self) -> EventStreamConsumer<E, S> {
        let stream = E::header().stream_name;
        let (sender, receiver) = sink::channel(self.sink_capacity);
        let span = self
            .span
            .unwrap_or_else(|| info_span!("consumer", stream = %stream));

        EventStreamConsumer {
            store: self.store,
            stream,
            sender,
            receiver,
            replay_page_size: self.replay_page_size,
            retry: self.retry,
            span,
        }
    }
}

/// Consumer bound to one stream and one event type.
///
/// Take a receiver with [`events`](Self::events) and start reading from it
/// before calling [`start`](Self::start): replay hands every historical event
/// to the sink before `start` returns, so with no reader `start` waits.
///
/// ```no_run
/// use ordered_streams::moving_average::MovingAverageCrossEvent;
/// use ordered_streams::{EventStreamConsumer, InMemoryLogStore};
/// use tokio_util::sync::CancellationToken;
/// use tokio_util::task::TaskTracker;
///
/// # async fn example() -> Result<(), ordered_streams::StreamError> {
/// let consumer = EventStreamConsumer::<MovingAverageCrossEvent, _>::new(InMemoryLogStore::new());
/// let events = consumer.events();
///
/// let tracker = TaskTracker::new();
/// tracker.spawn(async move {
///     while let Some(envelope) = events.recv().await {
///         println!("{} replay={}", envelope.position, envelope.is_replay);
///     }
/// });
///
/// let cancel = CancellationToken::new();
/// let handle = consumer.start(cancel.clone(), &tracker).await?;
///
/// cancel.cancel();
/// tracker.close();
/// tracker.wait().await;
/// handle.wait().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventStreamConsumer<E, S> {
    store: S,
    stream: StreamName,
    sender: EventSender<EventEnvelope<E>>,
    receiver: EventReceiver<EventEnvelope<E>>,
    replay_page_size: u64,
    retry: RetryConfig,
    span: Span,
}

impl<E: StreamEvent, S: LogStore> EventStreamConsumer<E, S> {
    /// Consumer with default configuration.
    pub fn new(store: S) -> Self {
        Self::builder(store).build()
    }

    /// Builder for a consumer with custom configuration.
    pub fn builder(store: S) -> ConsumerBuilder<E, S> {
        ConsumerBuilder::new(store)
    }

    /// The stream this consumer reads.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// A receiver for delivered events. Clones share one queue.
    pub fn events(&self) -> EventReceiver<EventEnvelope<E>> {
        self.receiver.clone()
    }

    /// Replay history, open the live subscription and spawn the background
    /// task on `tracker`.
    ///
    /// Resolve, replay and initial subscribe failures are returned here; the
    /// client handle is closed and the sink ends. Cancelling `cancel` stops
    /// the consumer at any point, and `tracker.wait()` then returns only after
    /// the client handle is closed and the sink has ended.
    pub async fn start(
        self,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<ConsumerHandle, StreamError> {
        let EventStreamConsumer {
            store,
            stream,
            sender,
            receiver,
            replay_page_size,
            retry,
            span,
        } = self;
        drop(receiver);

        let startup = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            startup = catch_up(&store, &stream, replay_page_size, &sender)
                .instrument(span.clone()) => Some(startup),
        };

        let (subscription, anchor) = match startup {
            Some(Ok(Some(started))) => started,
            Some(Ok(None)) => {
                store.close();
                return Ok(ConsumerHandle::finished(
                    stream,
                    tracker,
                    StopReason::ReceiversDropped,
                ));
            }
            None => {
                store.close();
                span.in_scope(|| info!(%stream, "cancelled during startup"));
                return Ok(ConsumerHandle::finished(
                    stream,
                    tracker,
                    StopReason::Cancelled,
                ));
            }
            Some(Err(e)) => {
                store.close();
                return Err(e);
            }
        };

        let subscriber = LiveSubscriber {
            store,
            stream: stream.clone(),
            retry,
            cancel,
            sink: sender,
        };
        let task = tracker.spawn(subscriber.run(subscription, anchor).instrument(span));

        Ok(ConsumerHandle { stream, task })
    }
}

/// Resolve the boundary, replay through it and open the first live
/// subscription right after it. `None` if every receiver went away during
/// replay.
async fn catch_up<S: LogStore, E: StreamEvent>(
    store: &S,
    stream: &StreamName,
    page_size: u64,
    sink: &EventSender<EventEnvelope<E>>,
) -> Result<Option<(S::Subscription, SubscribeFrom)>, StreamError> {
    let last = resolve_last(store, stream).await?;

    let anchor = match last {
        Some(last) => {
            let summary = replay_through(store, stream, last, page_size, sink).await?;
            if summary.receivers_dropped {
                return Ok(None);
            }
            info!(%stream, replayed = summary.delivered, "replay finished");
            SubscribeFrom::after(summary.last.or(Some(last)))
        }
        None => {
            info!(%stream, "stream is empty, nothing to replay");
            SubscribeFrom::Start
        }
    };

    let subscription = store.subscribe(stream, anchor).await?;
    info!(%stream, from = %anchor, "subscribed");

    Ok(Some((subscription, anchor)))
}

/// Handle to a started consumer.
///
/// The delivered events end when the consumer stops for any reason;
/// [`wait`](Self::wait) tells a cancellation apart from a failure.
#[derive(Debug)]
pub struct ConsumerHandle {
    stream: StreamName,
    task: JoinHandle<Result<StopReason, StreamError>>,
}

impl ConsumerHandle {
    fn finished(stream: StreamName, tracker: &TaskTracker, reason: StopReason) -> Self {
        let task = tracker.spawn(async move { Ok(reason) });
        Self { stream, task }
    }

    /// The stream the consumer reads.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// Whether the background task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consumer to stop.
    pub async fn wait(self) -> Result<StopReason, StreamError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(StreamError::TaskFailed(e.to_string())),
        }
    }
}
