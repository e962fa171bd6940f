//! Typed event contract and the delivery envelope.

use crate::error::StreamError;
use crate::store::RecordedEvent;
use crate::types::{EventType, StreamName, StreamPosition};
use serde::de::DeserializeOwned;
use std::ops::Deref;
use uuid::Uuid;

/// Static descriptor shared by every instance of one event type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEventHeader {
    /// The stream all events of this type are appended to.
    pub stream_name: StreamName,
    /// Tag stored with each appended event.
    pub event_type: EventType,
    /// Payload schema version, carried per type rather than per message.
    pub schema_version: u32,
}

/// An event type that can be consumed from, and appended to, one stream.
///
/// A consumer is parameterized by exactly one implementor; the header is
/// read once when the consumer is built.
///
/// ```
/// use ordered_streams::{EventType, StreamEvent, StreamEventHeader, StreamName};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct PriceTick {
///     symbol: String,
///     price: f64,
/// }
///
/// impl StreamEvent for PriceTick {
///     fn header() -> StreamEventHeader {
///         StreamEventHeader {
///             stream_name: StreamName::from_static("ticks"),
///             event_type: EventType::from_static("price-tick"),
///             schema_version: 1,
///         }
///     }
/// }
/// ```
pub trait StreamEvent: DeserializeOwned + Send + 'static {
    /// The static descriptor for this type.
    fn header() -> StreamEventHeader;

    /// Decode one persisted payload. Defaults to JSON.
    fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// A decoded event plus the metadata the consumer attaches on delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope<E> {
    pub event: E,
    /// Correlation id of the producing request.
    ///
    /// Always [`Uuid::nil`]: correlation ids are not persisted with the
    /// payload, so neither replayed nor live events can be traced back to
    /// the request that produced them.
    pub request_id: Uuid,
    /// `true` for events delivered while replaying history, `false` for
    /// every live delivery.
    pub is_replay: bool,
    /// Position of the event in its stream.
    pub position: StreamPosition,
}

impl<E: StreamEvent> EventEnvelope<E> {
    /// Decode a recorded event and stamp the delivery metadata.
    pub fn decode(record: &RecordedEvent, is_replay: bool) -> Result<Self, StreamError> {
        let event = E::decode(&record.data).map_err(|e| StreamError::Decode {
            stream: record.stream.clone(),
            position: record.position,
            message: e.to_string(),
        })?;

        Ok(EventEnvelope {
            event,
            request_id: Uuid::nil(),
            is_replay,
            position: record.position,
        })
    }
}

impl<E> EventEnvelope<E> {
    pub fn into_inner(self) -> E {
        self.event
    }
}

impl<E> Deref for EventEnvelope<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.event
    }
}
