//! Server-Sent Events support
//!
//! Bridges a conversation's broadcast frame channel onto an SSE response.

use crate::runtime::Frame;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Convert broadcast frames to an SSE stream, preceded by the init frame
pub fn sse_stream(
    init_frame: Frame,
    broadcast_rx: tokio::sync::broadcast::Receiver<Frame>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move { Ok(frame_to_event(&init_frame)) });

    let broadcasts = BroadcastStream::new(broadcast_rx).filter_map(|result| match result {
        Ok(frame) => Some(Ok(frame_to_event(&frame))),
        Err(_) => None, // Skip lagged frames
    });

    let combined = init.chain(broadcasts);

    Sse::new(combined).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn frame_to_event(frame: &Frame) -> Event {
    let data = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(frame.event_name()).data(data)
}
