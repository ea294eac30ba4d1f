//! Relays an upstream completion stream to the caller as server-sent events.
//!
//! Every relayed stream ends with exactly one `[DONE]` event. A failure after
//! the stream has opened is reported in-band as an error event just before it.

use crate::inference::ChunkStream;
use axum::response::sse::Event;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

pub const DONE_SENTINEL: &str = "[DONE]";

/// One outbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Content(String),
    Error(String),
    Done,
}

#[derive(Serialize)]
struct ContentPayload<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    error: &'a str,
}

impl RelayFrame {
    pub fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            RelayFrame::Content(content) => {
                Event::default().json_data(ContentPayload { content: &content })
            }
            RelayFrame::Error(error) => Event::default().json_data(ErrorPayload { error: &error }),
            RelayFrame::Done => Ok(Event::default().data(DONE_SENTINEL)),
        }
    }
}

enum RelayState {
    Streaming(ChunkStream),
    Failed,
    Finished,
}

/// Turn upstream chunks into frames, in order, closed by a single `Done`.
pub fn relay_frames(chunks: ChunkStream) -> impl Stream<Item = RelayFrame> + Send {
    stream::unfold(RelayState::Streaming(chunks), |state| async move {
        match state {
            RelayState::Streaming(mut chunks) => match chunks.next().await {
                Some(Ok(content)) => Some((RelayFrame::Content(content), RelayState::Streaming(chunks))),
                Some(Err(e)) => {
                    warn!(error = %e, "Inference stream failed mid-response");
                    Some((RelayFrame::Error(e.to_string()), RelayState::Failed))
                }
                None => {
                    debug!("Inference stream complete");
                    Some((RelayFrame::Done, RelayState::Finished))
                }
            },
            RelayState::Failed => Some((RelayFrame::Done, RelayState::Finished)),
            RelayState::Finished => None,
        }
    })
}

/// Same as [`relay_frames`], rendered as SSE events.
pub fn relay_events(chunks: ChunkStream) -> impl Stream<Item = Result<Event, axum::Error>> + Send {
    relay_frames(chunks).map(RelayFrame::into_event)
}
