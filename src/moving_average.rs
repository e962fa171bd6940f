//! Moving-average crossover events.

use crate::event::{StreamEvent, StreamEventHeader};
use crate::types::{EventType, StreamName};
use serde::{Deserialize, Serialize};

pub const MOVING_AVERAGE_STREAM: StreamName = StreamName::from_static("moving_average");
pub const MOVING_AVERAGE_CROSS_EVENT_TYPE: EventType = EventType::from_static("MA-cross");

/// Which side of the moving average the price crossed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovingAverageState {
    CrossedBelow,
    CrossedAbove,
    None,
}

/// A price crossed its moving average for one symbol and period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovingAverageCrossEvent {
    pub symbol: String,
    pub period: u32,
    pub state: MovingAverageState,
}

impl MovingAverageCrossEvent {
    pub fn new(symbol: impl Into<String>, period: u32, state: MovingAverageState) -> Self {
        Self {
            symbol: symbol.into(),
            period,
            state,
        }
    }
}

impl StreamEvent for MovingAverageCrossEvent {
    fn header() -> StreamEventHeader {
        StreamEventHeader {
            stream_name: MOVING_AVERAGE_STREAM,
            event_type: MOVING_AVERAGE_CROSS_EVENT_TYPE,
            schema_version: 1,
        }
    }
}
