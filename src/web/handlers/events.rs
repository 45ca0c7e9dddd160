//! Live deployment event streaming via Server-Sent Events
//!
//! Subscribers get `deployment` events (state transitions and container
//! log lines) from the moment they connect. A slow consumer gets a
//! `lagged` event with the number of dropped messages instead of
//! backpressuring the executors.

use axum::{
    extract::{Query, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::orchestrator::{EventFilter, StreamItem};
use crate::web::AppState;

/// Query parameters for the event stream
#[derive(Debug, Deserialize, IntoParams)]
pub struct EventStreamParams {
    /// Only stream events for this job
    pub job_id: Option<Uuid>,
    /// Only stream events for this target
    pub target: Option<String>,
}

/// Stream deployment events via SSE
#[utoipa::path(
    get,
    path = "/events",
    tag = "events",
    params(EventStreamParams),
    responses(
        (status = 200, description = "SSE stream of deployment events", content_type = "text/event-stream"),
    )
)]
pub async fn stream_events(
    Query(params): Query<EventStreamParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    debug!(job_id = ?params.job_id, target = ?params.target, "event stream subscriber connected");

    let filter = match params.job_id {
        Some(job_id) => EventFilter::Job(job_id),
        None => EventFilter::All,
    };
    let mut stream = state.events.subscribe(filter);
    let target_filter = params.target;

    let sse_stream = async_stream::stream! {
        loop {
            match stream.next().await {
                Some(StreamItem::Event(event)) => {
                    if let Some(ref target) = target_filter {
                        if event.target != *target {
                            continue;
                        }
                    }
                    match Event::default()
                        .id(event.job_id.to_string())
                        .event("deployment")
                        .json_data(&event)
                    {
                        Ok(sse_event) => yield Ok::<Event, axum::Error>(sse_event),
                        Err(e) => error!("failed to serialize deployment event: {}", e),
                    }
                }
                Some(StreamItem::Lagged(missed)) => {
                    // The subscriber fell behind; say how much was dropped
                    // rather than silently resuming.
                    let notice = serde_json::json!({ "missed": missed });
                    yield Ok(Event::default().event("lagged").data(notice.to_string()));
                }
                None => break,
            }
        }
    };

    Sse::new(sse_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    )
}
