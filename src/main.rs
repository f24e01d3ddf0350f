mod client;
mod config;
mod error;
mod http_server;
mod ops;
mod state;
mod store;
mod trigger;
mod types;
mod verification;

use config::{ApiConfig, Credentials, Environment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state::{AppState, Connection};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    raw_response(
        id,
        serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        }),
    )
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // stdout carries the JSON-RPC stream, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let state: Arc<RwLock<AppState>> = Arc::new(RwLock::new(AppState::new(
        PathBuf::from("."),
        ApiConfig::from_env(),
    )));

    let state_clone = state.clone();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    let stdin_loop = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";

            let response = handle.block_on(handle_request(&request, &state_clone, &mut out));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    });

    if let Err(e) = stdin_loop.await {
        tracing::error!(error = %e, "stdin loop terminated abnormally");
    }
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize response"),
    }
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => handle_initialize(req, state).await,
        "shutdown" => handle_shutdown(req, state).await,
        "execute" => handle_execute(req, state, out).await,
        _ => err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_initialize(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
) -> JsonRpcResponse {
    let data_dir = req
        .params
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut st = state.write().await;
    let mut config = st.config.clone();
    if let Some(env) = req.params.get("environment").and_then(|v| v.as_str()) {
        config.environment = Environment::parse(env);
        config.url_pattern = config.environment.url_pattern().to_string();
    }
    if let Some(url) = req.params.get("public_url").and_then(|v| v.as_str()) {
        config.public_url = Some(url.to_string());
    }

    *st = AppState::new(data_dir, config);
    if let Err(e) = st.store.load() {
        tracing::warn!(error = %e, "failed to load persisted node state");
    }

    let (port, pending_rx) = match http_server::start(st.store.clone()).await {
        Ok(r) => r,
        Err(e) => {
            return err_response(req.id.clone(), -32603, format!("HTTP server failed: {e}"));
        }
    };
    st.port = Some(port);
    st.base_url = format!("http://127.0.0.1:{port}");
    st.pending_rx = Some(pending_rx);

    match Credentials::from_params(&req.params)
        .and_then(|creds| Connection::from_credentials(&st.config, &creds, st.store.clone()))
    {
        Ok(conn) => {
            tracing::info!(api_base = %conn.api_base, "connected to Fellow API");
            st.connection = Some(Arc::new(conn));
        }
        Err(e) => tracing::warn!(error = %e, "Fellow API not configured; only inbound deliveries will work"),
    }

    tracing::info!(
        callback_base = %st.callback_base(),
        active_triggers = st.store.active_nodes().len(),
        "initialized"
    );
    raw_response(req.id.clone(), serde_json::json!({ "ready": true }))
}

async fn handle_shutdown(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
) -> JsonRpcResponse {
    let st = state.read().await;
    if let Err(e) = st.store.save() {
        tracing::warn!(error = %e, "failed to persist node state on shutdown");
    }
    raw_response(req.id.clone(), serde_json::json!({}))
}

async fn handle_execute(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    drain_pending_events(state, out).await;

    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    match ops::execute(operation, &input, state).await {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(e) => {
            tracing::debug!(operation, error = %e, "operation failed");
            err_response(req.id.clone(), -32000, e.to_string())
        }
    }
}

// ─── Pending event draining ───────────────────────────────────────────────────

/// Publish deliveries queued by the HTTP server as IPC events.
/// Must be called while the host is in its read loop (i.e., during any execute call).
async fn drain_pending_events(state: &Arc<RwLock<AppState>>, out: &mut dyn Write) {
    let mut pending = Vec::new();
    {
        let mut st = state.write().await;
        if let Some(rx) = &mut st.pending_rx {
            while let Ok(item) = rx.try_recv() {
                pending.push(item);
            }
        }
    }

    if pending.is_empty() {
        return;
    }

    static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(20000);
    let stdin = io::stdin();

    for event in &pending {
        let call_id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "event.publish",
            "params": {
                "type": event.event_type,
                "subject": event.subject,
                "data": event.data,
            },
            "id": call_id,
        });
        let _ = writeln!(out, "{req}");
        let _ = out.flush();
        tracing::debug!(event = %event.event_type, node_id = %event.subject, "published delivery");

        // Read back the host's response to keep the protocol in sync
        let mut line = String::new();
        let _ = stdin.lock().read_line(&mut line);
    }
}
