//! Single-event producer.

use crate::error::StreamError;
use crate::event::StreamEvent;
use crate::store::{AppendResult, LogStore, ProposedEvent};
use crate::types::{EventType, StreamName};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info_span, Instrument, Span};

/// Builder for configuring an [`EventProducer`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ProducerBuilder<S> {
    store: S,
    metadata: Option<Bytes>,
    span: Option<Span>,
}

impl<S: LogStore> ProducerBuilder<S> {
    pub(crate) fn new(store: S) -> Self {
        Self {
            store,
            metadata: None,
            span: None,
        }
    }

    /// Attach this metadata blob to every event saved with
    /// [`save`](EventProducer::save).
    pub fn metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Set the span appends are logged under.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Build the producer.
    pub fn build(self) -> EventProducer<S> {
        EventProducer {
            store: self.store,
            metadata: self.metadata,
            span: self.span.unwrap_or_else(|| info_span!("producer")),
        }
    }
}

/// Appends one event per call.
///
/// There is no batching and no retry: a failed append is returned to the
/// caller as the store reported it.
pub struct EventProducer<S> {
    store: S,
    metadata: Option<Bytes>,
    span: Span,
}

impl<S: LogStore> EventProducer<S> {
    /// Producer with default configuration.
    pub fn new(store: S) -> Self {
        Self::builder(store).build()
    }

    /// Builder for a producer with custom configuration.
    pub fn builder(store: S) -> ProducerBuilder<S> {
        ProducerBuilder::new(store)
    }

    /// Append a raw JSON payload.
    pub async fn append(
        &self,
        stream: &StreamName,
        event_type: &EventType,
        schema_version: u32,
        payload: impl Into<Bytes>,
        metadata: Option<Bytes>,
    ) -> Result<AppendResult, StreamError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(StreamError::EmptyAppend);
        }

        let event = ProposedEvent::json(event_type.clone(), schema_version, payload)
            .with_metadata(metadata);
        let event_id = event.event_id;

        let result = self
            .store
            .append(stream, event)
            .instrument(self.span.clone())
            .await?;

        self.span.in_scope(|| {
            debug!(
                %stream,
                %event_type,
                %event_id,
                position = %result.position,
                "appended event"
            )
        });

        Ok(result)
    }

    /// Serialize `event` as JSON and append it to the stream its header names.
    pub async fn save<E: StreamEvent + Serialize>(
        &self,
        event: &E,
    ) -> Result<AppendResult, StreamError> {
        let header = E::header();
        let payload = serde_json::to_vec(event)?;

        self.append(
            &header.stream_name,
            &header.event_type,
            header.schema_version,
            payload,
            self.metadata.clone(),
        )
        .await
    }

    /// Release the underlying client handle.
    pub fn close(&self) {
        self.store.close();
    }
}
