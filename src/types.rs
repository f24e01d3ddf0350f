use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events a trigger node can subscribe to.
pub const TRIGGER_EVENTS: &[(&str, &str)] = &[
    ("ai_note.generated", "AI Note Generated"),
    ("ai_note.shared_to_channel", "AI Note Shared to Channel"),
    ("action_item.assigned", "Action Item Assigned"),
    ("action_item.completed", "Action Item Completed"),
];

/// Human-readable name for an event, falling back to the raw event string.
pub fn event_display_name(event: &str) -> &str {
    TRIGGER_EVENTS
        .iter()
        .find(|(value, _)| *value == event)
        .map(|(_, name)| *name)
        .unwrap_or(event)
}

/// Persisted per-node trigger state. Field names match the workflow static
/// data the host historically stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

/// Body of `POST /webhooks`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateWebhookRequest<'a> {
    pub url: &'a str,
    pub enabled_events: Vec<&'a str>,
    pub description: String,
    pub status: &'static str,
}

/// Response of `POST /webhooks`: `{ "webhook": { "id", "secret" } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateWebhookResponse {
    #[serde(default)]
    pub webhook: Option<WebhookSubscription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookSubscription {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    Challenge,
    Unauthorized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub node_id: String,
    pub received_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// An accepted delivery queued for event.publish, not yet sent to host.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_type: String,
    pub subject: String,
    pub data: serde_json::Value,
}
