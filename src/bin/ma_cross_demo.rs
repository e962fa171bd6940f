//! Moving-average crossover demo.
//!
//! Seeds an in-memory log, starts a consumer that replays it, keeps producing
//! crossover events while dropping the live subscription now and then, and
//! shuts down once every event has been seen or on Ctrl-C.
//!
//! Usage: `ma-cross-demo [COUNT]` (default 10). Set `RUST_LOG` to change the
//! log filter.

use ordered_streams::moving_average::{
    MovingAverageCrossEvent, MovingAverageState, MOVING_AVERAGE_STREAM,
};
use ordered_streams::{EventProducer, EventStreamConsumer, InMemoryLogStore, StopReason};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_COUNT: u32 = 10;

fn crossing(period: u32) -> MovingAverageCrossEvent {
    let state = if period % 2 == 0 {
        MovingAverageState::CrossedAbove
    } else {
        MovingAverageState::CrossedBelow
    };
    MovingAverageCrossEvent::new("AAPL", period, state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let count = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u32>()?,
        None => DEFAULT_COUNT,
    };
    if count == 0 {
        info!("nothing to produce");
        return Ok(());
    }
    let seeded = count / 2;

    let store = InMemoryLogStore::new();
    let producer = EventProducer::new(store.clone());
    for period in 0..seeded {
        producer.save(&crossing(period)).await?;
    }
    info!(seeded, "seeded history");

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let consumer = EventStreamConsumer::<MovingAverageCrossEvent, _>::new(store.clone());
    let events = consumer.events();
    let reader = tracker.spawn(async move {
        let mut seen = 0;
        while seen < count {
            let Some(envelope) = events.recv().await else {
                break;
            };
            seen += 1;
            if envelope.is_replay {
                continue;
            }
            info!(
                position = %envelope.position,
                symbol = %envelope.symbol,
                period = envelope.period,
                state = ?envelope.state,
                "moving average crossed"
            );
        }
        seen
    });

    let handle = consumer.start(cancel.clone(), &tracker).await?;

    for period in seeded..count {
        producer.save(&crossing(period)).await?;
        if period % 3 == 0 {
            store.drop_subscriptions(&MOVING_AVERAGE_STREAM);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::select! {
        seen = reader => match seen {
            Ok(seen) => info!(seen, "all events observed"),
            Err(e) => warn!(error = %e, "reader task failed"),
        },
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted");
        }
    }

    cancel.cancel();
    tracker.close();
    tracker.wait().await;

    match handle.wait().await? {
        StopReason::Cancelled => info!("gracefully shut down"),
        StopReason::ReceiversDropped => info!("reader finished first"),
    }
    producer.close();

    Ok(())
}
