//! Server-Sent Events framing for subscriptions.

use axum::response::sse::Event;
use chrono::Utc;
use serde_json::{json, Value};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";

/// One frame on a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// `id:` / `event:` / `data:` frame. `data` always carries a `timestamp`.
    Message {
        id: Option<String>,
        event: Option<String>,
        data: Value,
    },
    /// `: text` comment line, invisible to `EventSource` listeners.
    Comment(String),
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl SseFrame {
    #[must_use]
    pub fn connected(subscription_id: &str, agent_id: &str, endpoint_id: &str) -> Self {
        Self::Message {
            id: Some(subscription_id.to_string()),
            event: Some(EVENT_CONNECTED.to_string()),
            data: json!({
                "subscriptionId": subscription_id,
                "agentId": agent_id,
                "endpointId": endpoint_id,
                "timestamp": now_millis(),
            }),
        }
    }

    #[must_use]
    pub fn disconnected(subscription_id: &str, reason: &str) -> Self {
        Self::Message {
            id: Some(subscription_id.to_string()),
            event: Some(EVENT_DISCONNECTED.to_string()),
            data: json!({
                "subscriptionId": subscription_id,
                "reason": reason,
                "timestamp": now_millis(),
            }),
        }
    }

    /// A published event, addressed to one subscription.
    #[must_use]
    pub fn event(subscription_id: &str, event: &str, payload: Value) -> Self {
        Self::Message {
            id: Some(subscription_id.to_string()),
            event: Some(event.to_string()),
            data: json!({
                "event": event,
                "payload": payload,
                "timestamp": now_millis(),
            }),
        }
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Comment("heartbeat".to_string())
    }

    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Message { event, .. } => event.as_deref(),
            Self::Comment(_) => None,
        }
    }

    /// `connected` and `disconnected` frames frame the stream's lifecycle.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self.event_name(), Some(EVENT_CONNECTED | EVENT_DISCONNECTED))
    }

    #[must_use]
    pub fn is_comment(&self) -> bool {
        matches!(self, Self::Comment(_))
    }

    /// Raw `text/event-stream` encoding, terminated by a blank line.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Message { id, event, data } => {
                let mut out = String::new();
                if let Some(id) = id {
                    out.push_str(&format!("id: {}\n", id));
                }
                if let Some(event) = event {
                    out.push_str(&format!("event: {}\n", event));
                }
                out.push_str(&format!("data: {}\n\n", data));
                out
            }
            Self::Comment(text) => format!(": {}\n\n", text),
        }
    }

    #[must_use]
    pub fn to_axum_event(&self) -> Event {
        match self {
            Self::Message { id, event, data } => {
                let mut ev = Event::default().data(data.to_string());
                if let Some(id) = id {
                    ev = ev.id(id);
                }
                if let Some(event) = event {
                    ev = ev.event(event);
                }
                ev
            }
            Self::Comment(text) => Event::default().comment(text),
        }
    }
}
