use crate::error::Result;
use crate::store::{FileStore, NodeStateStore};
use crate::trigger::{self, DeliveryOutcome, HEADER_MESSAGE_ID};
use crate::types::{Delivery, DeliveryStatus, PendingEvent};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Clone)]
struct ServerState {
    store: Arc<FileStore>,
    event_tx: mpsc::UnboundedSender<PendingEvent>,
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/hooks/{node_id}", post(handle_webhook))
        .with_state(state)
}

/// Spawn the Axum server on 127.0.0.1:0 and return the bound port and
/// a channel receiver for accepted deliveries.
pub async fn start(store: Arc<FileStore>) -> Result<(u16, mpsc::UnboundedReceiver<PendingEvent>)> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let app = router(ServerState { store, event_tx });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tracing::info!(port, "inbound webhook server bound");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "inbound webhook server stopped");
        }
    });

    Ok((port, event_rx))
}

// The body arrives as raw bytes; it must reach the verifier untouched.
async fn handle_webhook(
    Path(node_id): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    tracing::debug!(node_id = %node_id, bytes = body.len(), "webhook received");
    let outcome = trigger::dispatch_delivery(state.store.as_ref(), &node_id, &headers, Some(&body[..]));

    let message_id = headers
        .get(HEADER_MESSAGE_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (status, reason, response) = match outcome {
        DeliveryOutcome::Challenge(token) => {
            (DeliveryStatus::Challenge, None, (StatusCode::OK, token).into_response())
        }
        DeliveryOutcome::Accepted { payload, event, .. } => {
            let event_type = event.unwrap_or_else(|| {
                payload
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("webhook")
                    .to_string()
            });
            let pending = PendingEvent {
                event_type,
                subject: node_id.clone(),
                data: payload,
            };
            if state.event_tx.send(pending).is_err() {
                tracing::error!(node_id = %node_id, "event channel closed, dropping delivery");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            (DeliveryStatus::Success, None, StatusCode::OK.into_response())
        }
        DeliveryOutcome::Rejected(rejection) => (
            DeliveryStatus::Unauthorized,
            Some(rejection.to_string()),
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        ),
    };

    if let Err(e) = record(&state.store, &node_id, status, message_id, reason) {
        tracing::warn!(node_id = %node_id, error = %e, "failed to record delivery");
    }
    response
}

// Only nodes we know about get a delivery log.
fn record(
    store: &FileStore,
    node_id: &str,
    status: DeliveryStatus,
    message_id: Option<String>,
    reason: Option<String>,
) -> Result<()> {
    if store.get(node_id).is_none() {
        return Ok(());
    }
    store.record_delivery(Delivery {
        id: uuid::Uuid::new_v4().to_string(),
        node_id: node_id.to_string(),
        received_at: Utc::now(),
        status,
        message_id,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{HEADER_SIGNATURE, HEADER_TIMESTAMP};
    use crate::types::NodeState;
    use crate::verification::sign;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "whsec_dGVzdC1zZWNyZXQta2V5";

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<FileStore>,
        rx: mpsc::UnboundedReceiver<PendingEvent>,
        app: Router,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()));
        store
            .set(
                "node-1",
                NodeState {
                    webhook_id: Some("wh_1".into()),
                    webhook_secret: Some(SECRET.into()),
                    event: Some("action_item.assigned".into()),
                    registered_at: None,
                },
            )
            .unwrap();
        let (event_tx, rx) = mpsc::unbounded_channel();
        let app = router(ServerState {
            store: store.clone(),
            event_tx,
        });
        Harness {
            _dir: dir,
            store,
            rx,
            app,
        }
    }

    fn request(node_id: &str, body: &str, signed_body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/hooks/{node_id}"))
            .header("content-type", "application/json");
        if let Some(signed) = signed_body {
            let ts = Utc::now().timestamp().to_string();
            builder = builder
                .header(HEADER_MESSAGE_ID, "msg_1")
                .header(HEADER_TIMESTAMP, &ts)
                .header(HEADER_SIGNATURE, sign(SECRET, "msg_1", &ts, signed.as_bytes()));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn forwards_verified_delivery() {
        let mut h = harness();
        let body = r#"{"type":"action_item.assigned","data":{"action_item_id":"ai_1"}}"#;
        let response = h.app.oneshot(request("node-1", body, Some(body))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = h.rx.try_recv().unwrap();
        assert_eq!(event.event_type, "action_item.assigned");
        assert_eq!(event.subject, "node-1");
        assert_eq!(event.data["data"]["action_item_id"], "ai_1");

        let log = h.store.deliveries("node-1");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, DeliveryStatus::Success);
        assert_eq!(log[0].message_id.as_deref(), Some("msg_1"));
    }

    #[tokio::test]
    async fn rejects_tampered_delivery() {
        let mut h = harness();
        let response = h
            .app
            .oneshot(request("node-1", r#"{"a":2}"#, Some(r#"{"a":1}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(h.rx.try_recv().is_err());

        let log = h.store.deliveries("node-1");
        assert_eq!(log[0].status, DeliveryStatus::Unauthorized);
        assert_eq!(log[0].reason.as_deref(), Some("invalid signature"));
    }

    #[tokio::test]
    async fn rejects_unsigned_delivery() {
        let mut h = harness();
        let response = h.app.oneshot(request("node-1", r#"{"a":1}"#, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await, "Unauthorized");
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn echoes_challenge_for_unregistered_node() {
        let mut h = harness();
        let body = r#"{"type":"url_verification","challenge":"tok_123"}"#;
        let response = h.app.oneshot(request("node-new", body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "tok_123");
        assert!(h.rx.try_recv().is_err());
        assert!(h.store.deliveries("node-new").is_empty());
    }

    #[tokio::test]
    async fn unknown_node_is_unauthorized_and_not_logged() {
        let h = harness();
        let body = r#"{"a":1}"#;
        let response = h.app.oneshot(request("node-x", body, Some(body))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(h.store.deliveries("node-x").is_empty());
    }
}
