//! Trigger node: remote webhook registration and inbound delivery dispatch.

use crate::client::{ApiTransport, Method};
use crate::error::{Error, Result};
use crate::store::NodeStateStore;
use crate::types::{
    event_display_name, CreateWebhookRequest, CreateWebhookResponse, NodeState, TRIGGER_EVENTS,
};
use crate::verification;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub const HEADER_MESSAGE_ID: &str = "svix-id";
pub const HEADER_TIMESTAMP: &str = "svix-timestamp";
pub const HEADER_SIGNATURE: &str = "svix-signature";

const DESCRIPTION_PREFIX: &str = "Workflow trigger";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Absent,
    Registering,
    Active,
    Deregistering,
}

impl RegistrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Deregistering => "deregistering",
        }
    }
}

/// Creates and tears down the remote subscription for trigger nodes.
pub struct WebhookLifecycle {
    api: Arc<dyn ApiTransport>,
    store: Arc<dyn NodeStateStore>,
    api_base: String,
    in_flight: Mutex<HashMap<String, RegistrationState>>,
}

impl WebhookLifecycle {
    pub fn new(api: Arc<dyn ApiTransport>, store: Arc<dyn NodeStateStore>, api_base: String) -> Self {
        Self {
            api,
            store,
            api_base,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, node_id: &str) -> RegistrationState {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = in_flight.get(node_id) {
            return *state;
        }
        if self.check_exists(node_id) {
            RegistrationState::Active
        } else {
            RegistrationState::Absent
        }
    }

    fn set_in_flight(&self, node_id: &str, state: Option<RegistrationState>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            Some(s) => {
                in_flight.insert(node_id.to_string(), s);
            }
            None => {
                in_flight.remove(node_id);
            }
        }
    }

    /// Whether a subscription id is persisted locally. The provider is not
    /// consulted.
    pub fn check_exists(&self, node_id: &str) -> bool {
        let exists = self
            .store
            .get(node_id)
            .and_then(|s| s.webhook_id)
            .is_some();
        tracing::debug!(node_id, exists, "check_exists");
        exists
    }

    /// Register `callback_url` for `event` and persist the returned id and
    /// secret. Returns the provider's webhook id.
    pub async fn create(&self, node_id: &str, callback_url: &str, event: &str) -> Result<String> {
        if !TRIGGER_EVENTS.iter().any(|(value, _)| *value == event) {
            return Err(Error::UnknownEvent(event.to_string()));
        }

        self.set_in_flight(node_id, Some(RegistrationState::Registering));
        let result = self.register(node_id, callback_url, event).await;
        self.set_in_flight(node_id, None);

        match &result {
            Ok(webhook_id) => {
                tracing::info!(node_id, webhook_id = %webhook_id, event, "webhook registered")
            }
            Err(e) => tracing::error!(node_id, event, error = %e, "failed to register webhook"),
        }
        result
    }

    async fn register(&self, node_id: &str, callback_url: &str, event: &str) -> Result<String> {
        let request = CreateWebhookRequest {
            url: callback_url,
            enabled_events: vec![event],
            description: format!("{DESCRIPTION_PREFIX}: {}", event_display_name(event)),
            status: "active",
        };
        let url = format!("{}/webhooks", self.api_base);
        let response = self
            .api
            .request(Method::POST, &url, Some(serde_json::to_value(&request)?))
            .await?;

        let webhook = serde_json::from_value::<CreateWebhookResponse>(response)
            .unwrap_or_default()
            .webhook
            .unwrap_or_default();
        let webhook_id = webhook
            .id
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingWebhookField("ID"))?;

        // The provider holds a subscription from here on; undo it on failure.
        if let Err(e) = self.persist(node_id, &webhook_id, webhook.secret, event) {
            self.delete_remote(node_id, &webhook_id).await;
            return Err(e);
        }
        Ok(webhook_id)
    }

    fn persist(
        &self,
        node_id: &str,
        webhook_id: &str,
        webhook_secret: Option<String>,
        event: &str,
    ) -> Result<()> {
        // Without a secret every delivery would have to be accepted unverified.
        let webhook_secret = webhook_secret
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingWebhookField("secret"))?;
        self.store.set(
            node_id,
            NodeState {
                webhook_id: Some(webhook_id.to_string()),
                webhook_secret: Some(webhook_secret),
                event: Some(event.to_string()),
                registered_at: Some(Utc::now()),
            },
        )
    }

    /// Single-attempt remote delete; failures are logged and swallowed.
    async fn delete_remote(&self, node_id: &str, webhook_id: &str) {
        let url = format!("{}/webhooks/{}", self.api_base, webhook_id);
        match self.api.request(Method::DELETE, &url, None).await {
            Ok(_) => tracing::info!(node_id, webhook_id, "webhook deleted"),
            Err(e) => tracing::error!(node_id, webhook_id, error = %e, "failed to delete webhook"),
        }
    }

    /// Remove the remote subscription and clear local state. Remote failures
    /// are logged only; the subscription may already be gone.
    pub async fn delete(&self, node_id: &str) -> Result<()> {
        let Some(webhook_id) = self.store.get(node_id).and_then(|s| s.webhook_id) else {
            tracing::debug!(node_id, "no webhook id stored, nothing to delete");
            return Ok(());
        };

        self.set_in_flight(node_id, Some(RegistrationState::Deregistering));
        self.delete_remote(node_id, &webhook_id).await;
        let cleared = self.store.delete(node_id);
        self.set_in_flight(node_id, None);
        cleared
    }
}

// ─── Inbound dispatch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingSecret,
    MissingHeader(&'static str),
    MissingBody,
    InvalidSignature,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSecret => f.write_str("no webhook secret stored"),
            Self::MissingHeader(h) => write!(f, "missing {h} header"),
            Self::MissingBody => f.write_str("raw body unavailable"),
            Self::InvalidSignature => f.write_str("invalid signature"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// URL-verification handshake; respond with the token verbatim.
    Challenge(String),
    Accepted {
        payload: Value,
        event: Option<String>,
        message_id: String,
    },
    Rejected(Rejection),
}

/// Decide what to do with one inbound request for `node_id`.
pub fn dispatch_delivery(
    store: &dyn NodeStateStore,
    node_id: &str,
    headers: &HeaderMap,
    raw_body: Option<&[u8]>,
) -> DeliveryOutcome {
    let parsed: Option<Value> = raw_body.and_then(|b| serde_json::from_slice(b).ok());
    if let Some(token) = parsed.as_ref().and_then(url_verification_challenge) {
        tracing::info!(node_id, "responding to URL verification challenge");
        return DeliveryOutcome::Challenge(token.to_string());
    }

    match check_authenticity(store, node_id, headers, raw_body) {
        Ok((event, message_id)) => {
            tracing::debug!(node_id, message_id = %message_id, "signature verified");
            let payload = parsed.unwrap_or_else(|| {
                Value::String(String::from_utf8_lossy(raw_body.unwrap_or_default()).into_owned())
            });
            DeliveryOutcome::Accepted {
                payload,
                event,
                message_id,
            }
        }
        Err(rejection) => {
            tracing::warn!(node_id, reason = %rejection, "rejecting webhook delivery");
            DeliveryOutcome::Rejected(rejection)
        }
    }
}

fn check_authenticity(
    store: &dyn NodeStateStore,
    node_id: &str,
    headers: &HeaderMap,
    raw_body: Option<&[u8]>,
) -> std::result::Result<(Option<String>, String), Rejection> {
    let state = store.get(node_id).unwrap_or_default();
    let secret = state
        .webhook_secret
        .filter(|s| !s.is_empty())
        .ok_or(Rejection::MissingSecret)?;
    let msg_id = header(headers, HEADER_MESSAGE_ID)?;
    let timestamp = header(headers, HEADER_TIMESTAMP)?;
    let signature = header(headers, HEADER_SIGNATURE)?;
    let body = raw_body.ok_or(Rejection::MissingBody)?;

    if !verification::verify_svix(&secret, msg_id, timestamp, body, signature) {
        return Err(Rejection::InvalidSignature);
    }
    Ok((state.event, msg_id.to_string()))
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> std::result::Result<&'a str, Rejection> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(Rejection::MissingHeader(name))
}

fn url_verification_challenge(body: &Value) -> Option<&str> {
    if body.get("type")?.as_str()? != "url_verification" {
        return None;
    }
    body.get("challenge")?.as_str().filter(|c| !c.is_empty())
}
