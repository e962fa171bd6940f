//! The log-store capability the consumer and producer are written against.
//!
//! A [`LogStore`] exposes exactly three operations: batch reads, live
//! subscriptions and single-event appends. Nothing here inspects transport
//! or connection state.

use crate::error::StreamError;
use crate::types::{Direction, EventType, ReadFrom, StreamName, StreamPosition, SubscribeFrom};
use bytes::Bytes;
use std::future::Future;
use uuid::Uuid;

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";

/// An event as persisted in a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub stream: StreamName,
    pub position: StreamPosition,
    pub event_type: EventType,
    pub schema_version: u32,
    pub content_type: String,
    pub data: Bytes,
    pub metadata: Option<Bytes>,
}

/// An event to append.
#[derive(Clone, Debug)]
pub struct ProposedEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub schema_version: u32,
    pub content_type: String,
    pub data: Bytes,
    pub metadata: Option<Bytes>,
}

impl ProposedEvent {
    /// A JSON event with a fresh event id.
    pub fn json(event_type: EventType, schema_version: u32, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            schema_version,
            content_type: CONTENT_TYPE_JSON.to_string(),
            data: data.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Bytes>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Acknowledgement of a single append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendResult {
    /// Position assigned to the appended event.
    pub position: StreamPosition,
}

/// Options for a batch read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub direction: Direction,
    pub from: ReadFrom,
}

impl ReadOptions {
    /// Forwards from the given start.
    pub fn forwards(from: ReadFrom) -> Self {
        Self {
            direction: Direction::Forwards,
            from,
        }
    }

    /// Backwards from the last event.
    pub fn backwards_from_end() -> Self {
        Self {
            direction: Direction::Backwards,
            from: ReadFrom::End,
        }
    }
}

/// One signal pushed by a live subscription.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// An event was appended. `None` marks a signal with no decodable event.
    EventAppeared(Option<RecordedEvent>),
    /// The server reports progress. Informational only.
    CheckpointReached(StreamPosition),
    /// The transport ended the subscription.
    SubscriptionDropped { reason: Option<StreamError> },
}

/// Ordered, durable log service.
///
/// Reads of a stream that has never been written fail with
/// [`StreamError::NotFound`].
pub trait LogStore: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Read up to `count` events starting at `options.from`, in `options.direction`.
    fn read_stream(
        &self,
        stream: &StreamName,
        options: ReadOptions,
        count: u64,
    ) -> impl Future<Output = Result<Vec<RecordedEvent>, StreamError>> + Send;

    /// Open a live subscription. The anchor itself is never delivered.
    fn subscribe(
        &self,
        stream: &StreamName,
        from: SubscribeFrom,
    ) -> impl Future<Output = Result<Self::Subscription, StreamError>> + Send;

    /// Append one event.
    fn append(
        &self,
        stream: &StreamName,
        event: ProposedEvent,
    ) -> impl Future<Output = Result<AppendResult, StreamError>> + Send;

    /// Release this client handle. Later calls fail with [`StreamError::Closed`].
    fn close(&self);
}

/// Push handle for one live subscription.
pub trait Subscription: Send + 'static {
    /// Wait for the next signal.
    ///
    /// Must be cancel-safe: dropping the returned future before it completes
    /// must not lose a signal.
    fn recv(&mut self) -> impl Future<Output = SubscriptionEvent> + Send;
}
