//! Live subscription with transparent resubscription.
//!
//! The subscriber is a three-state machine:
//!
//! | State | Leaves on | To |
//! |-------|-----------|----|
//! | `Subscribed` | transport drops the subscription | `Resubscribing` |
//! | `Subscribed` | decode failure, cancellation, all receivers gone | `Stopped` |
//! | `Resubscribing` | subscribe succeeds | `Subscribed` |
//! | `Resubscribing` | cancellation, non-retryable error, retries exhausted | `Stopped` |
//!
//! The anchor of every resubscription is the last delivered position, so the
//! application sees each position exactly once and in order no matter how
//! often the transport drops.

use crate::error::StreamError;
use crate::event::{EventEnvelope, StreamEvent};
use crate::retry::RetryConfig;
use crate::sink::EventSender;
use crate::store::{LogStore, Subscription, SubscriptionEvent};
use crate::types::{StreamName, SubscribeFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a consumer stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token fired.
    Cancelled,
    /// Every receiver of the delivery sink was dropped.
    ReceiversDropped,
}

enum State<Sub> {
    Subscribed(Sub),
    Resubscribing,
    Stopped(Result<StopReason, StreamError>),
}

/// Failed subscribe attempts since the last live delivery.
///
/// A subscription that drops before delivering anything counts as a failed
/// attempt, so a transport that accepts subscriptions and drops them at once
/// still backs off and eventually gives up.
#[derive(Default)]
struct Attempts {
    failed: u32,
    last_error: Option<StreamError>,
}

impl Attempts {
    fn fail(&mut self, error: StreamError) {
        self.failed += 1;
        self.last_error = Some(error);
    }

    fn reset(&mut self) {
        self.failed = 0;
        self.last_error = None;
    }
}

pub(crate) struct LiveSubscriber<S: LogStore, E> {
    pub(crate) store: S,
    pub(crate) stream: StreamName,
    pub(crate) retry: RetryConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) sink: EventSender<EventEnvelope<E>>,
}

impl<S: LogStore, E: StreamEvent> LiveSubscriber<S, E> {
    /// Drive the subscription until it stops.
    ///
    /// `anchor` is where `subscription` was opened. On return the client
    /// handle has been closed and the sink dropped.
    pub(crate) async fn run(
        self,
        subscription: S::Subscription,
        anchor: SubscribeFrom,
    ) -> Result<StopReason, StreamError> {
        let mut anchor = anchor;
        let mut attempts = Attempts::default();
        let mut state = State::Subscribed(subscription);

        let outcome = loop {
            state = match state {
                State::Subscribed(mut subscription) => {
                    self.pump(&mut subscription, &mut anchor, &mut attempts)
                        .await
                }
                State::Resubscribing => self.resubscribe(anchor, &mut attempts).await,
                State::Stopped(outcome) => break outcome,
            };
        };

        self.stop(&outcome);
        outcome
    }

    /// `Subscribed`: deliver pushed events until the subscription ends.
    async fn pump(
        &self,
        subscription: &mut S::Subscription,
        anchor: &mut SubscribeFrom,
        attempts: &mut Attempts,
    ) -> State<S::Subscription> {
        let mut delivered = false;

        loop {
            let signal = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return State::Stopped(Ok(StopReason::Cancelled)),
                signal = subscription.recv() => signal,
            };

            let record = match signal {
                SubscriptionEvent::EventAppeared(Some(record)) => record,
                SubscriptionEvent::EventAppeared(None) => continue,
                SubscriptionEvent::CheckpointReached(position) => {
                    debug!(stream = %self.stream, %position, "checkpoint reached");
                    continue;
                }
                SubscriptionEvent::SubscriptionDropped { reason } => {
                    match &reason {
                        Some(e) => info!(stream = %self.stream, error = %e, "subscription dropped"),
                        None => info!(stream = %self.stream, "subscription dropped"),
                    }
                    if !delivered {
                        attempts.fail(reason.unwrap_or_else(|| {
                            StreamError::unavailable("subscription dropped before delivering an event")
                        }));
                    }
                    return State::Resubscribing;
                }
            };

            let expected = anchor.first_position();
            if record.position < expected {
                warn!(
                    stream = %self.stream,
                    position = %record.position,
                    %expected,
                    "skipping already delivered event"
                );
                continue;
            }
            if record.position > expected {
                warn!(
                    stream = %self.stream,
                    position = %record.position,
                    %expected,
                    "gap in live subscription"
                );
            }

            let envelope = match EventEnvelope::<E>::decode(&record, false) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "failed to decode live event");
                    return State::Stopped(Err(e));
                }
            };

            *anchor = SubscribeFrom::After(record.position);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return State::Stopped(Ok(StopReason::Cancelled)),
                delivered_ok = self.sink.deliver(envelope) => {
                    if delivered_ok.is_err() {
                        return State::Stopped(Ok(StopReason::ReceiversDropped));
                    }
                }
            }

            delivered = true;
            attempts.reset();
        }
    }

    /// `Resubscribing`: open a new subscription at `anchor`.
    ///
    /// The first attempt after a productive subscription is immediate. Every
    /// attempt after a failure waits `next_backoff`, and once the retry budget
    /// is spent the consumer stops with [`StreamError::ResubscribeExhausted`].
    async fn resubscribe(
        &self,
        anchor: SubscribeFrom,
        attempts: &mut Attempts,
    ) -> State<S::Subscription> {
        loop {
            if self.cancel.is_cancelled() {
                info!(stream = %self.stream, "cancelled before re-subscribing");
                return State::Stopped(Ok(StopReason::Cancelled));
            }
            if self.sink.is_closed() {
                return State::Stopped(Ok(StopReason::ReceiversDropped));
            }

            if attempts.failed > 0 {
                let retries = attempts.failed - 1;

                if !self.retry.should_retry(retries) {
                    let last_error = attempts
                        .last_error
                        .take()
                        .unwrap_or_else(|| StreamError::unavailable("re-subscribe failed"));
                    error!(
                        stream = %self.stream,
                        error = %last_error,
                        attempts = attempts.failed,
                        "giving up re-subscribing"
                    );
                    return State::Stopped(Err(StreamError::ResubscribeExhausted {
                        stream: self.stream.clone(),
                        from: anchor,
                        attempts: attempts.failed,
                        last_error: Box::new(last_error),
                    }));
                }

                let delay = self.retry.next_backoff(retries);
                if let Some(e) = &attempts.last_error {
                    warn!(stream = %self.stream, error = %e, ?delay, "re-subscribe failed, backing off");
                }

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return State::Stopped(Ok(StopReason::Cancelled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            info!(
                stream = %self.stream,
                from = %anchor,
                failed = attempts.failed,
                "re-subscribing"
            );

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return State::Stopped(Ok(StopReason::Cancelled)),
                attempt = self.store.subscribe(&self.stream, anchor) => attempt,
            };

            match attempt {
                Ok(subscription) => {
                    info!(stream = %self.stream, from = %anchor, "re-subscribed");
                    return State::Subscribed(subscription);
                }
                Err(e) if !e.is_retryable() => {
                    error!(stream = %self.stream, error = %e, "re-subscribe failed");
                    return State::Stopped(Err(e));
                }
                Err(e) => attempts.fail(e),
            }
        }
    }

    /// `Stopped`: release the client handle. The sink closes when `self` drops.
    fn stop(&self, outcome: &Result<StopReason, StreamError>) {
        self.store.close();
        match outcome {
            Ok(reason) => info!(stream = %self.stream, ?reason, "consumer stopped"),
            Err(e) => error!(stream = %self.stream, error = %e, "consumer failed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::moving_average::{MovingAverageCrossEvent, MovingAverageState};
    use crate::sink::{self, EventReceiver};
    use crate::store::{AppendResult, ProposedEvent, ReadOptions, RecordedEvent};
    use crate::types::{EventType, StreamPosition};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    /// Scripted response to one subscribe call.
    pub(crate) enum Script {
        /// Succeed; yield these signals, then wait forever.
        Signals(Vec<SubscriptionEvent>),
        Fail(StreamError),
        /// Never complete.
        Hang,
    }

    #[derive(Clone, Default)]
    pub(crate) struct ScriptedStore {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        anchors: Arc<Mutex<Vec<SubscribeFrom>>>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedStore {
        pub(crate) fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Arc::new(Mutex::new(scripts.into())),
                ..Self::default()
            }
        }

        pub(crate) fn anchors(&self) -> Vec<SubscribeFrom> {
            self.anchors.lock().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    pub(crate) struct ScriptedSubscription {
        signals: VecDeque<SubscriptionEvent>,
    }

    impl Subscription for ScriptedSubscription {
        async fn recv(&mut self) -> SubscriptionEvent {
            match self.signals.pop_front() {
                Some(signal) => signal,
                None => std::future::pending().await,
            }
        }
    }

    impl LogStore for ScriptedStore {
        type Subscription = ScriptedSubscription;

        async fn read_stream(
            &self,
            stream: &StreamName,
            _options: ReadOptions,
            _count: u64,
        ) -> Result<Vec<RecordedEvent>, StreamError> {
            Err(StreamError::NotFound {
                stream: stream.clone(),
            })
        }

        async fn subscribe(
            &self,
            _stream: &StreamName,
            from: SubscribeFrom,
        ) -> Result<ScriptedSubscription, StreamError> {
            self.anchors.lock().push(from);
            let script = self.scripts.lock().pop_front();
            match script {
                Some(Script::Signals(signals)) => Ok(ScriptedSubscription {
                    signals: signals.into(),
                }),
                Some(Script::Fail(e)) => Err(e),
                Some(Script::Hang) | None => std::future::pending().await,
            }
        }

        async fn append(
            &self,
            _stream: &StreamName,
            _event: ProposedEvent,
        ) -> Result<AppendResult, StreamError> {
            Err(StreamError::unavailable("scripted store is read-only"))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    pub(crate) fn appeared(position: u64) -> SubscriptionEvent {
        let event = MovingAverageCrossEvent::new(
            "AAPL",
            position as u32,
            MovingAverageState::CrossedAbove,
        );
        SubscriptionEvent::EventAppeared(Some(RecordedEvent {
            event_id: Uuid::new_v4(),
            stream: stream(),
            position: StreamPosition::new(position),
            event_type: EventType::new("MA-cross"),
            schema_version: 1,
            content_type: "application/json".to_string(),
            data: Bytes::from(serde_json::to_vec(&event).unwrap()),
            metadata: None,
        }))
    }

    fn dropped() -> SubscriptionEvent {
        SubscriptionEvent::SubscriptionDropped {
            reason: Some(StreamError::unavailable("connection reset")),
        }
    }

    fn stream() -> StreamName {
        StreamName::new("moving_average")
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new()
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(40))
            .with_max_retries(max_retries)
            .with_jitter(crate::retry::JitterMode::None)
    }

    struct Running {
        cancel: CancellationToken,
        events: EventReceiver<EventEnvelope<MovingAverageCrossEvent>>,
        task: tokio::task::JoinHandle<Result<StopReason, StreamError>>,
    }

    /// Start a subscriber whose first subscription is the first script entry.
    async fn start(store: &ScriptedStore, anchor: SubscribeFrom, retry: RetryConfig) -> Running {
        let cancel = CancellationToken::new();
        let (tx, events) = sink::channel(16);
        let first = store.subscribe(&stream(), anchor).await.unwrap();
        let subscriber = LiveSubscriber::<_, MovingAverageCrossEvent> {
            store: store.clone(),
            stream: stream(),
            retry,
            cancel: cancel.clone(),
            sink: tx,
        };
        let task = tokio::spawn(subscriber.run(first, anchor));
        Running {
            cancel,
            events,
            task,
        }
    }

    async fn next_position(events: &EventReceiver<EventEnvelope<MovingAverageCrossEvent>>) -> u64 {
        let env = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink closed");
        assert!(!env.is_replay);
        env.position.value()
    }

    #[tokio::test]
    async fn resubscribes_after_last_delivered_position() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![appeared(3), appeared(4), dropped()]),
            Script::Signals(vec![appeared(5), appeared(6)]),
        ]);
        let running = start(
            &store,
            SubscribeFrom::After(StreamPosition::new(2)),
            fast_retry(3),
        )
        .await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(next_position(&running.events).await);
        }
        assert_eq!(seen, vec![3, 4, 5, 6]);
        assert_eq!(
            store.anchors(),
            vec![
                SubscribeFrom::After(StreamPosition::new(2)),
                SubscribeFrom::After(StreamPosition::new(4)),
            ]
        );

        running.cancel.cancel();
        assert_eq!(running.task.await.unwrap().unwrap(), StopReason::Cancelled);
        assert!(store.is_closed());
        assert!(running.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_before_any_delivery_keeps_the_original_anchor() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![dropped()]),
            Script::Signals(vec![appeared(0)]),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(3)).await;

        assert_eq!(next_position(&running.events).await, 0);
        assert_eq!(
            store.anchors(),
            vec![SubscribeFrom::Start, SubscribeFrom::Start]
        );
        running.cancel.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drop_at_position_zero_resumes_at_one() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![appeared(0), dropped()]),
            Script::Signals(vec![appeared(1)]),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(3)).await;

        assert_eq!(next_position(&running.events).await, 0);
        assert_eq!(next_position(&running.events).await, 1);
        assert_eq!(
            store.anchors()[1],
            SubscribeFrom::After(StreamPosition::ZERO)
        );
        running.cancel.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn checkpoints_and_empty_events_do_not_move_the_anchor() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![
                appeared(0),
                SubscriptionEvent::CheckpointReached(StreamPosition::new(40)),
                SubscriptionEvent::EventAppeared(None),
                dropped(),
            ]),
            Script::Signals(vec![appeared(1)]),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(3)).await;

        assert_eq!(next_position(&running.events).await, 0);
        assert_eq!(next_position(&running.events).await, 1);
        assert_eq!(
            store.anchors()[1],
            SubscribeFrom::After(StreamPosition::ZERO)
        );
        running.cancel.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn redelivered_positions_are_skipped() {
        let store = ScriptedStore::new(vec![Script::Signals(vec![
            appeared(5),
            appeared(5),
            appeared(4),
            appeared(6),
        ])]);
        let running = start(
            &store,
            SubscribeFrom::After(StreamPosition::new(4)),
            fast_retry(3),
        )
        .await;

        assert_eq!(next_position(&running.events).await, 5);
        assert_eq!(next_position(&running.events).await, 6);
        running.cancel.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![appeared(0), dropped()]),
            Script::Fail(StreamError::unavailable("refused")),
            Script::Fail(StreamError::unavailable("refused")),
            Script::Signals(vec![appeared(1)]),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(5)).await;

        assert_eq!(next_position(&running.events).await, 0);
        assert_eq!(next_position(&running.events).await, 1);
        assert_eq!(
            store.anchors()[1..],
            [SubscribeFrom::After(StreamPosition::ZERO); 3]
        );
        running.cancel.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_fatal_and_close_the_sink() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![appeared(0), dropped()]),
            Script::Fail(StreamError::unavailable("refused")),
            Script::Fail(StreamError::unavailable("refused")),
            Script::Fail(StreamError::unavailable("refused")),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(2)).await;

        assert_eq!(next_position(&running.events).await, 0);
        let err = running.task.await.unwrap().unwrap_err();
        match err {
            StreamError::ResubscribeExhausted { attempts, from, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(from, SubscribeFrom::After(StreamPosition::ZERO));
            }
            other => panic!("Expected exhaustion, got {other:?}"),
        }
        assert_eq!(store.anchors().len(), 4);
        assert!(store.is_closed());
        assert!(running.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn non_retryable_subscribe_error_is_fatal() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![dropped()]),
            Script::Fail(StreamError::Closed),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(5)).await;

        assert!(matches!(
            running.task.await.unwrap(),
            Err(StreamError::Closed)
        ));
        assert_eq!(store.anchors().len(), 2);
    }

    #[tokio::test]
    async fn cancel_while_resubscribe_pending_stops_without_retrying() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![appeared(0), dropped()]),
            Script::Hang,
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(5)).await;

        assert_eq!(next_position(&running.events).await, 0);
        while store.anchors().len() < 2 {
            tokio::task::yield_now().await;
        }

        running.cancel.cancel();
        assert_eq!(running.task.await.unwrap().unwrap(), StopReason::Cancelled);
        assert_eq!(store.anchors().len(), 2);
        assert!(store.is_closed());
        assert!(running.events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_without_retrying() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![appeared(0), dropped()]),
            Script::Fail(StreamError::unavailable("refused")),
        ]);
        let retry = fast_retry(5).with_initial_backoff(Duration::from_secs(3600));
        let running = start(&store, SubscribeFrom::Start, retry).await;

        assert_eq!(next_position(&running.events).await, 0);
        while store.anchors().len() < 2 {
            tokio::task::yield_now().await;
        }
        running.cancel.cancel();

        assert_eq!(running.task.await.unwrap().unwrap(), StopReason::Cancelled);
        assert_eq!(store.anchors().len(), 2);
    }

    #[tokio::test]
    async fn live_decode_failure_is_fatal() {
        let bad = SubscriptionEvent::EventAppeared(Some(RecordedEvent {
            event_id: Uuid::new_v4(),
            stream: stream(),
            position: StreamPosition::new(1),
            event_type: EventType::new("MA-cross"),
            schema_version: 1,
            content_type: "application/json".to_string(),
            data: Bytes::from_static(b"not json"),
            metadata: None,
        }));
        let store = ScriptedStore::new(vec![Script::Signals(vec![appeared(0), bad, appeared(2)])]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(5)).await;

        assert_eq!(next_position(&running.events).await, 0);
        assert!(matches!(
            running.task.await.unwrap(),
            Err(StreamError::Decode { .. })
        ));
        assert!(running.events.recv().await.is_none());
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn stops_when_every_receiver_is_dropped() {
        let store = ScriptedStore::new(vec![Script::Signals(vec![appeared(0)])]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(5)).await;
        drop(running.events);

        assert_eq!(
            running.task.await.unwrap().unwrap(),
            StopReason::ReceiversDropped
        );
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn no_resubscribe_once_receivers_are_gone() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![dropped()]),
            Script::Signals(vec![appeared(0)]),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(5)).await;
        drop(running.events);

        assert_eq!(
            running.task.await.unwrap().unwrap(),
            StopReason::ReceiversDropped
        );
        assert_eq!(store.anchors(), vec![SubscribeFrom::Start]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_that_drop_at_once_back_off_and_give_up() {
        let scripts = (0..200)
            .map(|_| Script::Signals(vec![dropped()]))
            .collect();
        let store = ScriptedStore::new(scripts);
        let started = tokio::time::Instant::now();
        let running = start(&store, SubscribeFrom::Start, fast_retry(2)).await;

        let err = running.task.await.unwrap().unwrap_err();
        match err {
            StreamError::ResubscribeExhausted { attempts, from, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(from, SubscribeFrom::Start);
            }
            other => panic!("Expected exhaustion, got {other:?}"),
        }
        assert_eq!(store.anchors().len(), 3);
        // 10ms before the second subscribe, 20ms before the third.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn a_live_delivery_resets_the_retry_budget() {
        let store = ScriptedStore::new(vec![
            Script::Signals(vec![dropped()]),
            Script::Signals(vec![dropped()]),
            Script::Signals(vec![appeared(0), dropped()]),
            Script::Signals(vec![dropped()]),
            Script::Signals(vec![dropped()]),
            Script::Signals(vec![appeared(1)]),
        ]);
        let running = start(&store, SubscribeFrom::Start, fast_retry(2)).await;

        assert_eq!(next_position(&running.events).await, 0);
        assert_eq!(next_position(&running.events).await, 1);
        assert_eq!(store.anchors().len(), 6);

        running.cancel.cancel();
        assert_eq!(running.task.await.unwrap().unwrap(), StopReason::Cancelled);
    }
}
