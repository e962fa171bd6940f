//! Synchronous replay of a stream's history into the delivery sink.

use crate::error::StreamError;
use crate::event::{EventEnvelope, StreamEvent};
use crate::sink::EventSender;
use crate::store::{LogStore, ReadOptions};
use crate::types::{ReadFrom, StreamName, StreamPosition};
use std::future::Future;
use tracing::debug;

/// Default number of events fetched per read while replaying.
pub const DEFAULT_REPLAY_PAGE_SIZE: u64 = 512;

/// What a replay delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReplaySummary {
    /// Number of events accepted.
    pub delivered: u64,
    /// Position of the last event accepted.
    pub last: Option<StreamPosition>,
    /// The replay stopped early because every receiver was dropped.
    pub receivers_dropped: bool,
}

/// Read and decode the history of `stream` up to `boundary`.
///
/// A zero boundary is a no-op. Every returned envelope is tagged as replayed.
/// Reaching the end of the stream before `boundary` ends the read early; a
/// record that fails to decode fails the whole call.
pub async fn replay<S: LogStore, E: StreamEvent>(
    store: &S,
    stream: &StreamName,
    boundary: StreamPosition,
) -> Result<Vec<EventEnvelope<E>>, StreamError> {
    let mut events = Vec::new();
    if boundary == StreamPosition::ZERO {
        return Ok(events);
    }

    read_through(store, stream, boundary, DEFAULT_REPLAY_PAGE_SIZE, |envelope| {
        events.push(envelope);
        async { true }
    })
    .await?;

    Ok(events)
}

/// Replay every event from position 0 through `last`, inclusive, into `sink`.
///
/// Each event is accepted by the sink before the next one is read.
pub(crate) async fn replay_through<S: LogStore, E: StreamEvent>(
    store: &S,
    stream: &StreamName,
    last: StreamPosition,
    page_size: u64,
    sink: &EventSender<EventEnvelope<E>>,
) -> Result<ReplaySummary, StreamError> {
    read_through(store, stream, last, page_size, move |envelope| async move {
        sink.deliver(envelope).await.is_ok()
    })
    .await
}

async fn read_through<S, E, F, Fut>(
    store: &S,
    stream: &StreamName,
    last: StreamPosition,
    page_size: u64,
    mut accept: F,
) -> Result<ReplaySummary, StreamError>
where
    S: LogStore,
    E: StreamEvent,
    F: FnMut(EventEnvelope<E>) -> Fut,
    Fut: Future<Output = bool>,
{
    let page_size = page_size.max(1);
    let mut summary = ReplaySummary::default();
    let mut next = StreamPosition::ZERO;

    debug!(%stream, %last, "replaying stream");

    while next <= last {
        let count = page_size.min(last.value() - next.value() + 1);
        let batch = match store
            .read_stream(stream, ReadOptions::forwards(ReadFrom::At(next)), count)
            .await
        {
            Ok(batch) => batch,
            Err(e) if e.is_not_found() => break,
            Err(e) => return Err(e),
        };

        if batch.is_empty() {
            break;
        }

        for record in batch {
            if record.position > last {
                return Ok(summary);
            }

            let envelope = EventEnvelope::<E>::decode(&record, true)?;
            if !accept(envelope).await {
                summary.receivers_dropped = true;
                return Ok(summary);
            }

            summary.delivered += 1;
            summary.last = Some(record.position);
            next = record.position.next();
        }
    }

    debug!(%stream, delivered = summary.delivered, "replay complete");

    Ok(summary)
}
