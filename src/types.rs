//! Core types for stream identity and positions.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Name of one ordered, append-only log.
///
/// Names are opaque to this crate. A consumer binds to exactly one name,
/// taken once from the header of the event type it consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName(Cow<'static, str>);

impl StreamName {
    /// Create a stream name from any string.
    pub fn new(name: impl Into<String>) -> Self {
        StreamName(Cow::Owned(name.into()))
    }

    /// Create a stream name from a static string without allocating.
    pub const fn from_static(name: &'static str) -> Self {
        StreamName(Cow::Borrowed(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(s: &str) -> Self {
        StreamName::new(s)
    }
}

impl From<String> for StreamName {
    fn from(s: String) -> Self {
        StreamName::new(s)
    }
}

/// Event-type tag stored alongside each payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(Cow<'static, str>);

impl EventType {
    /// Create a tag from any string.
    pub fn new(tag: impl Into<String>) -> Self {
        EventType(Cow::Owned(tag.into()))
    }

    /// Create a tag from a static string without allocating.
    pub const fn from_static(tag: &'static str) -> Self {
        EventType(Cow::Borrowed(tag))
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        EventType::new(s)
    }
}

/// Zero-based offset of an event within its stream.
///
/// Positions increase by exactly one per append. `StreamPosition::ZERO` is
/// both the position of the first event and what [`resolve`](crate::resolve)
/// reports for a stream that has never been written, so callers that need to
/// tell the two apart use [`resolve_last`](crate::resolve_last).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StreamPosition(u64);

impl StreamPosition {
    pub const ZERO: StreamPosition = StreamPosition(0);

    pub const fn new(value: u64) -> Self {
        StreamPosition(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position directly after this one.
    ///
    /// Saturates at `u64::MAX`, which no stream can reach.
    pub const fn next(self) -> Self {
        StreamPosition(self.0.saturating_add(1))
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamPosition {
    fn from(value: u64) -> Self {
        StreamPosition(value)
    }
}

/// Read direction for batch reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forwards,
    Backwards,
}

/// Where a batch read starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadFrom {
    /// The first event of the stream.
    #[default]
    Start,
    /// The last event of the stream.
    End,
    /// A specific position, inclusive.
    At(StreamPosition),
}

/// Where a live subscription is anchored.
///
/// A subscription never re-delivers its anchor: `After(p)` yields `p + 1`
/// first, `Start` yields position 0 first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscribeFrom {
    #[default]
    Start,
    After(StreamPosition),
}

impl SubscribeFrom {
    /// The first position a subscription with this anchor will deliver.
    pub fn first_position(&self) -> StreamPosition {
        match self {
            SubscribeFrom::Start => StreamPosition::ZERO,
            SubscribeFrom::After(p) => p.next(),
        }
    }

    /// Anchor that continues right after `last`, or from the start if
    /// nothing has been seen.
    pub fn after(last: Option<StreamPosition>) -> Self {
        match last {
            Some(p) => SubscribeFrom::After(p),
            None => SubscribeFrom::Start,
        }
    }
}

impl fmt::Display for SubscribeFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeFrom::Start => f.write_str("start"),
            SubscribeFrom::After(p) => write!(f, "after {}", p),
        }
    }
}
