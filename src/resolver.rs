//! Finding the replay boundary of a stream.

use crate::error::StreamError;
use crate::store::{LogStore, ReadOptions};
use crate::types::{StreamName, StreamPosition};

/// Position of the most recently appended event, or `None` if the stream has
/// never been written.
pub async fn resolve_last<S: LogStore>(
    store: &S,
    stream: &StreamName,
) -> Result<Option<StreamPosition>, StreamError> {
    match store
        .read_stream(stream, ReadOptions::backwards_from_end(), 1)
        .await
    {
        Ok(batch) => Ok(batch.first().map(|event| event.position)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Position of the most recently appended event, `0` for an empty stream.
///
/// An empty stream is a normal outcome, not an error. Note that `0` is also
/// the position of a stream holding exactly one event.
pub async fn resolve<S: LogStore>(
    store: &S,
    stream: &StreamName,
) -> Result<StreamPosition, StreamError> {
    Ok(resolve_last(store, stream).await?.unwrap_or_default())
}
