//! Server-sent stream of run lifecycle events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use uuid::Uuid;

use jobflow_core::event::Received;
use jobflow_types::event::WorkflowEvent;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only events of this run.
    pub run_id: Option<Uuid>,
}

/// SSE event name: the event's `type` tag.
fn event_name(event: &WorkflowEvent) -> &'static str {
    match event {
        WorkflowEvent::RunStarted { .. } => "run_started",
        WorkflowEvent::StepStarted { .. } => "step_started",
        WorkflowEvent::StepAdvanced { .. } => "step_advanced",
        WorkflowEvent::StepWaiting { .. } => "step_waiting",
        WorkflowEvent::RunSucceeded { .. } => "run_succeeded",
        WorkflowEvent::RunFailed { .. } => "run_failed",
        WorkflowEvent::CallbackDelivered { .. } => "callback_delivered",
        WorkflowEvent::CallbackFailed { .. } => "callback_failed",
    }
}

/// GET /api/v1/events - Live `WorkflowEvent`s as server-sent events.
///
/// A slow client that falls behind the broadcast buffer gets a `lagged`
/// event carrying the number of events it missed.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe_filtered(query.run_id);

    let sse_stream = async_stream::stream! {
        while let Some(item) = rx.next().await {
            yield Ok::<_, Infallible>(to_sse(item));
        }
    };

    Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse(item: Received) -> Event {
    match item {
        Received::Event(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Event::default().event(event_name(&event)).data(data)
        }
        Received::Lagged(missed) => {
            tracing::warn!(missed, "event stream subscriber lagged");
            let data = serde_json::json!({ "missed": missed });
            Event::default().event("lagged").data(data.to_string())
        }
    }
}
