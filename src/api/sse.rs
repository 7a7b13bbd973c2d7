//! Server-Sent Events support
//!
//! REQ-API-005: Real-time Streaming

use crate::bus::BusEvent;
use crate::runtime::SseEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Convert the turn-internal broadcast stream (this conversation's own
/// `SseEvent`s) and the cross-conversation bus stream (`BusEvent`s,
/// including ones forwarded from a subagent) into one SSE response.
/// `message` is duplicated between the two for a conversation's own
/// direct subscribers; the spec's at-least-once + client-side
/// `(conversation_id, sequence_id)` dedupe absorbs that.
pub fn sse_stream(
    init_event: SseEvent,
    broadcast_rx: tokio::sync::broadcast::Receiver<SseEvent>,
    bus_rx: tokio::sync::broadcast::Receiver<BusEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move { Ok(sse_event_to_axum(init_event)) });

    let broadcasts = BroadcastStream::new(broadcast_rx).filter_map(|result| match result {
        Ok(event) => Some(Ok(sse_event_to_axum(event))),
        Err(_) => None, // Skip lagged messages
    });

    let bus_events = BroadcastStream::new(bus_rx).filter_map(|result| match result {
        Ok(event) => Some(Ok(bus_event_to_axum(event))),
        Err(_) => None,
    });

    let combined = init.chain(futures::stream::select(broadcasts, bus_events));

    Sse::new(combined).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn sse_event_to_axum(event: SseEvent) -> Event {
    let (event_type, data) = match event {
        SseEvent::Init {
            conversation,
            messages,
            agent_working,
            last_sequence_id,
            context_window_size,
            model_context_window,
            breadcrumbs,
        } => (
            "init",
            json!({
                "type": "init",
                "conversation": conversation,
                "messages": messages,
                "agent_working": agent_working,
                "last_sequence_id": last_sequence_id,
                "context_window_size": context_window_size,
                "model_context_window": model_context_window,
                "breadcrumbs": breadcrumbs
            }),
        ),
        SseEvent::Message { message } => (
            "message",
            json!({
                "type": "message",
                "message": message
            }),
        ),
        SseEvent::StateChange { state } => (
            "state_change",
            json!({
                "type": "state_change",
                "state": state
            }),
        ),
        SseEvent::AgentDone => (
            "agent_done",
            json!({
                "type": "agent_done"
            }),
        ),
        SseEvent::Error { message } => (
            "error",
            json!({
                "type": "error",
                "message": message
            }),
        ),
    };

    Event::default().event(event_type).data(data.to_string())
}

fn bus_event_to_axum(event: BusEvent) -> Event {
    let (event_type, data) = match event {
        BusEvent::MessageAppended { conversation_id, message } => (
            "message",
            json!({
                "type": "message",
                "conversation_id": conversation_id,
                "message": message
            }),
        ),
        BusEvent::ConversationState { conversation_id, working, model } => (
            "conversation_state",
            json!({
                "type": "conversation_state",
                "conversation_id": conversation_id,
                "working": working,
                "model": model
            }),
        ),
        BusEvent::ConversationListUpdate { update_type, conversation, conversation_id } => (
            "conversation_list_update",
            json!({
                "type": "conversation_list_update",
                "update_type": update_type,
                "conversation": conversation,
                "conversation_id": conversation_id
            }),
        ),
        BusEvent::Heartbeat => (
            "heartbeat",
            json!({
                "type": "heartbeat"
            }),
        ),
    };

    Event::default().event(event_type).data(data.to_string())
}
