use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::AppState;

/// Server-sent event stream of scan lifecycle events. Slow consumers that
/// fall behind the broadcast buffer silently skip the events they missed.
pub async fn scan_events(
    State(app_state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app_state.event_bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|event| match event {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().data(data))),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize scan event");
                None
            }
        },
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
