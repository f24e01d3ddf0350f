use crate::client::{ApiTransport, Method};
use crate::error::{Error, Result};
use crate::state::{AppState, Connection};
use crate::store::NodeStateStore;
use crate::trigger::RegistrationState;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Route an `execute` call to its handler.
pub async fn execute(operation: &str, input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value> {
    match operation {
        "action_item.get" => {
            let conn = connection(state).await?;
            action_item_get(conn.api.as_ref(), &conn.api_base, input).await
        }
        "action_item.get_many" => {
            let conn = connection(state).await?;
            action_item_get_many(conn.api.as_ref(), &conn.api_base, input).await
        }
        "action_item.complete" => {
            let conn = connection(state).await?;
            action_item_complete(conn.api.as_ref(), &conn.api_base, input).await
        }
        "note.get" => {
            let conn = connection(state).await?;
            note_get(conn.api.as_ref(), &conn.api_base, input).await
        }
        "note.get_many" => {
            let conn = connection(state).await?;
            note_get_many(conn.api.as_ref(), &conn.api_base, input).await
        }
        "trigger.activate" => op_trigger_activate(input, state).await,
        "trigger.deactivate" => op_trigger_deactivate(input, state).await,
        "trigger.status" => op_trigger_status(input, state).await,
        "get_recent_deliveries" => op_get_recent_deliveries(input, state).await,
        "get_server_info" => op_get_server_info(state).await,
        _ => Err(Error::UnknownOperation(operation.to_string())),
    }
}

async fn connection(state: &Arc<RwLock<AppState>>) -> Result<Arc<Connection>> {
    state
        .read()
        .await
        .connection
        .clone()
        .ok_or(Error::MissingCredentials("subdomain and api_key"))
}

fn required_str<'a>(input: &'a Value, field: &'static str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingField(field))
}

/// An id that is interpolated into a URL path. It must survive the
/// round-trip through percent-decoding unchanged.
fn path_id<'a>(input: &'a Value, field: &'static str) -> Result<&'a str> {
    let id = required_str(input, field)?;
    if id.contains(&['/', '?', '#', '%'][..]) || id.chars().any(char::is_whitespace) {
        return Err(Error::InvalidField(field));
    }
    Ok(id)
}

/// Copy the listed keys from `input` when present and non-empty.
fn pick(input: &Value, keys: &[&str]) -> Value {
    let mut body = Map::new();
    for key in keys {
        match input.get(*key) {
            None | Some(Value::Null) => {}
            Some(Value::Object(o)) if o.is_empty() => {}
            Some(Value::String(s)) if s.is_empty() => {}
            Some(v) => {
                body.insert(key.to_string(), v.clone());
            }
        }
    }
    Value::Object(body)
}

/// Turn `{<key>: {data: [...], page_info}}` into one item per entry, each
/// carrying the page info.
fn flatten_page(response: &Value, key: &str, empty_message: &str) -> Value {
    let page = &response[key];
    let page_info = page.get("page_info").cloned().unwrap_or(Value::Null);
    let items: Vec<Value> = page
        .get("data")
        .and_then(|d| d.as_array())
        .map(|data| {
            data.iter()
                .map(|item| {
                    let mut obj = item.as_object().cloned().unwrap_or_default();
                    obj.insert("_pagination".into(), page_info.clone());
                    Value::Object(obj)
                })
                .collect()
        })
        .unwrap_or_default();

    if items.is_empty() {
        return json!([{ "message": empty_message, "_pagination": page_info }]);
    }
    Value::Array(items)
}

// ─── Action items ───────────────────────────────────────────────────────────────

pub async fn action_item_get(api: &dyn ApiTransport, base: &str, input: &Value) -> Result<Value> {
    let id = path_id(input, "action_item_id")?;
    api.request(Method::GET, &format!("{base}/action_item/{id}"), None)
        .await
}

pub async fn action_item_get_many(api: &dyn ApiTransport, base: &str, input: &Value) -> Result<Value> {
    let body = pick(input, &["filters", "order_by", "pagination"]);
    let response = api
        .request(Method::POST, &format!("{base}/action_items"), Some(body))
        .await?;
    Ok(flatten_page(&response, "action_items", "No action items found"))
}

pub async fn action_item_complete(api: &dyn ApiTransport, base: &str, input: &Value) -> Result<Value> {
    let id = path_id(input, "action_item_id")?;
    api.request(
        Method::POST,
        &format!("{base}/action_item/{id}/complete"),
        Some(json!({ "completed": true })),
    )
    .await
}

// ─── Notes ──────────────────────────────────────────────────────────────────────

pub async fn note_get(api: &dyn ApiTransport, base: &str, input: &Value) -> Result<Value> {
    let id = path_id(input, "note_id")?;
    api.request(Method::GET, &format!("{base}/note/{id}"), None).await
}

pub async fn note_get_many(api: &dyn ApiTransport, base: &str, input: &Value) -> Result<Value> {
    let body = pick(input, &["filters", "include", "pagination"]);
    let response = api
        .request(Method::POST, &format!("{base}/notes"), Some(body))
        .await?;
    Ok(flatten_page(&response, "notes", "No notes found"))
}

// ─── Trigger lifecycle ──────────────────────────────────────────────────────────

async fn op_trigger_activate(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value> {
    let node_id = path_id(input, "node_id")?;
    let event = required_str(input, "event")?;
    let conn = connection(state).await?;
    let url = state.read().await.callback_url(node_id);

    if conn.lifecycle.check_exists(node_id) {
        let existing = state.read().await.store.get(node_id).unwrap_or_default();
        return Ok(json!({
            "node_id": node_id,
            "webhook_id": existing.webhook_id,
            "event": existing.event,
            "url": url,
            "state": RegistrationState::Active.as_str(),
            "already_active": true,
        }));
    }

    let webhook_id = conn.lifecycle.create(node_id, &url, event).await?;
    Ok(json!({
        "node_id": node_id,
        "webhook_id": webhook_id,
        "event": event,
        "url": url,
        "state": conn.lifecycle.state(node_id).as_str(),
        "already_active": false,
    }))
}

async fn op_trigger_deactivate(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value> {
    let node_id = required_str(input, "node_id")?;
    let conn = connection(state).await?;
    conn.lifecycle.delete(node_id).await?;
    Ok(json!({ "node_id": node_id, "deleted": true }))
}

async fn op_trigger_status(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value> {
    let node_id = required_str(input, "node_id")?;
    let st = state.read().await;
    let node = st.store.get(node_id).unwrap_or_default();
    let registration = match &st.connection {
        Some(conn) => conn.lifecycle.state(node_id),
        None if node.webhook_id.is_some() => RegistrationState::Active,
        None => RegistrationState::Absent,
    };
    Ok(json!({
        "node_id": node_id,
        "state": registration.as_str(),
        "webhook_id": node.webhook_id,
        "event": node.event,
        "registered_at": node.registered_at,
        "has_secret": node.webhook_secret.is_some(),
        "url": st.callback_url(node_id),
    }))
}

async fn op_get_recent_deliveries(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value> {
    let node_id = required_str(input, "node_id")?;
    let st = state.read().await;
    if st.store.get(node_id).is_none() {
        return Err(Error::NodeNotFound(node_id.to_string()));
    }
    let deliveries = st.store.deliveries(node_id);
    Ok(json!({ "deliveries": deliveries }))
}

async fn op_get_server_info(state: &Arc<RwLock<AppState>>) -> Result<Value> {
    let st = state.read().await;
    let port = st.port.ok_or(Error::NotInitialized)?;
    Ok(json!({
        "port": port,
        "base_url": st.base_url,
        "callback_base": st.callback_base(),
        "connected": st.connection.is_some(),
        "active_triggers": st.store.active_nodes(),
    }))
}
