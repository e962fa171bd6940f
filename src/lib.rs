//! Ordered Streams
//!
//! A client for append-only event logs that replays a stream's history and
//! then follows it live, re-establishing the live subscription whenever the
//! transport drops it. Every position is delivered once and in order.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ordered_streams::moving_average::{MovingAverageCrossEvent, MovingAverageState};
//! use ordered_streams::{EventProducer, EventStreamConsumer, InMemoryLogStore};
//! use tokio_util::sync::CancellationToken;
//! use tokio_util::task::TaskTracker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryLogStore::new();
//!
//!     // Append an event
//!     let producer = EventProducer::new(store.clone());
//!     producer
//!         .save(&MovingAverageCrossEvent::new("AAPL", 20, MovingAverageState::CrossedAbove))
//!         .await?;
//!
//!     // Replay, then follow live
//!     let consumer = EventStreamConsumer::<MovingAverageCrossEvent, _>::new(store.clone());
//!     let events = consumer.events();
//!     let tracker = TaskTracker::new();
//!     tracker.spawn(async move {
//!         while let Some(envelope) = events.recv().await {
//!             println!("{} {:?} replay={}", envelope.position, envelope.state, envelope.is_replay);
//!         }
//!     });
//!
//!     let cancel = CancellationToken::new();
//!     let handle = consumer.start(cancel.clone(), &tracker).await?;
//!
//!     cancel.cancel();
//!     tracker.close();
//!     tracker.wait().await;
//!     handle.wait().await?;
//!
//!     Ok(())
//! }
//! ```

mod consumer;
mod error;
mod event;
mod memory;
pub mod moving_average;
mod producer;
mod replay;
mod resolver;
mod retry;
mod sink;
mod store;
mod subscriber;
mod types;

pub use consumer::{ConsumerBuilder, ConsumerHandle, EventStreamConsumer};
pub use error::StreamError;
pub use event::{EventEnvelope, StreamEvent, StreamEventHeader};
pub use memory::{InMemoryLogStore, InMemorySubscription};
pub use producer::{EventProducer, ProducerBuilder};
pub use replay::{replay, DEFAULT_REPLAY_PAGE_SIZE};
pub use resolver::{resolve, resolve_last};
pub use retry::{apply_jitter, JitterMode, RetryConfig};
pub use sink::{EventReceiver, DEFAULT_SINK_CAPACITY};
pub use store::{
    AppendResult, LogStore, ProposedEvent, ReadOptions, RecordedEvent, Subscription,
    SubscriptionEvent,
};
pub use subscriber::StopReason;
pub use types::{Direction, EventType, ReadFrom, StreamName, StreamPosition, SubscribeFrom};
