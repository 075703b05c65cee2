//! Live event stream (Server-Sent Events).
//!
//! Subscriber-per-connection fan-out over the in-process event bus: a
//! `stream.connected` marker on subscribe, every durable event thereafter
//! (optionally filtered by run id), and a `stream.heartbeat` every 15
//! seconds. This is not a durable queue; missed messages are recoverable
//! from the persisted event log.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Duration, Instant, Interval};
use tracing::warn;

use crate::model::RunEvent;
use crate::AppState;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    #[serde(rename = "runId")]
    pub run_id: Option<String>,
}

/// True when an event should be delivered to a subscriber with the given
/// run-id filter.
pub fn event_matches(run_filter: Option<&str>, event: &RunEvent) -> bool {
    run_filter.map_or(true, |id| event.run_id.0 == id)
}

/// Serialize an event for the wire. A serialization failure degrades to an
/// empty object rather than terminating the stream.
pub fn render_event_json(event: &RunEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("Failed to serialize event {} for stream: {}", event.id, e);
        "{}".to_string()
    })
}

fn connected_event() -> Event {
    Event::default()
        .event("stream.connected")
        .data("{\"connected\":true}")
}

fn heartbeat_event() -> Event {
    Event::default()
        .event("stream.heartbeat")
        .data("{\"alive\":true}")
}

fn live_event(event: &RunEvent) -> Event {
    Event::default()
        .event(event.event_type.clone())
        .data(render_event_json(event))
}

struct StreamCtx {
    rx: broadcast::Receiver<RunEvent>,
    heartbeat: Interval,
    connected_sent: bool,
    run_filter: Option<String>,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ctx = StreamCtx {
        rx: state.bus.subscribe(),
        heartbeat: interval_at(Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD),
        connected_sent: false,
        run_filter: params.run_id,
    };

    let stream = futures::stream::unfold(ctx, |mut ctx| async move {
        if !ctx.connected_sent {
            ctx.connected_sent = true;
            return Some((Ok(connected_event()), ctx));
        }

        loop {
            tokio::select! {
                _ = ctx.heartbeat.tick() => {
                    return Some((Ok(heartbeat_event()), ctx));
                }
                received = ctx.rx.recv() => match received {
                    Ok(event) => {
                        if event_matches(ctx.run_filter.as_deref(), &event) {
                            return Some((Ok(live_event(&event)), ctx));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow subscriber: drop the backlog and keep going;
                        // history stays available from the persisted log.
                        warn!("Stream subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    });

    Sse::new(stream)
}
