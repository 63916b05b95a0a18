//! Live update stream.
//!
//! `GET /events/{slug}` serves server-sent `update` events carrying
//! transcript/changelog/roll deltas in commit order. A subscriber that
//! lags far enough to be dropped from the channel reconciles by
//! re-reading `/transcript?cursor=...`; nothing here ever writes.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::AppState;

pub async fn events(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.bus.subscribe(&slug).await;
    debug!(slug, "SSE subscriber attached");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    let data = match serde_json::to_string(&update) {
                        Ok(data) => data,
                        Err(_) => continue,
                    };
                    yield Ok(Event::default().event("update").data(data));
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Tell the client to reconcile via cursor re-read.
                    debug!(slug, skipped, "SSE subscriber lagged");
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(format!("{{\"skipped\":{skipped}}}")));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new())
}
