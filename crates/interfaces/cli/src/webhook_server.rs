//! HTTP listener for Notion webhook notifications.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use notesync_sync::WebhookGate;

pub(crate) fn router(gate: Arc<WebhookGate>) -> Router {
    Router::new()
        .route("/webhook", post(receive))
        .route("/health", get(health))
        .with_state(gate)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Always acknowledged with 200; bodies that are not JSON count as an
/// ignored notification.
async fn receive(State(gate): State<Arc<WebhookGate>>, body: Bytes) -> Json<Value> {
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|err| {
        warn!(error = %err, "webhook body is not JSON");
        Value::Null
    });
    let outcome = gate.handle(&payload);
    Json(json!({ "ok": true, "outcome": outcome.as_str() }))
}

/// Serve on `listener` until `shutdown_rx` flips to `true`.
pub(crate) fn spawn_webhook_server(
    listener: TcpListener,
    gate: Arc<WebhookGate>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let addr = listener.local_addr()?;
    let app = router(gate);
    let shutdown = async move {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    };

    info!(%addr, "webhook listener started");
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %err, "webhook listener failed");
        }
        info!("webhook listener stopped");
    }))
}
