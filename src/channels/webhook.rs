//! HTTP ingress: Pub/Sub push notifications, manual triggers and cursor status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::pipeline::scheduler::{MailboxScheduler, Submission};
use crate::pipeline::types::Trigger;
use crate::store::CursorStore;

/// Shared state for webhook handlers.
#[derive(Clone)]
pub struct WebhookState {
    pub scheduler: MailboxScheduler,
    pub store: Arc<dyn CursorStore>,
    pub api_key: Option<Arc<SecretString>>,
}

/// Build the ingress router.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/pubsub", post(pubsub_push))
        .route("/api/v1/triggers", post(manual_trigger))
        .route("/api/v1/cursors/{mailbox}", get(cursor_status))
        .with_state(state)
}

async fn health(State(state): State<WebhookState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_mailboxes": state.scheduler.active_mailboxes(),
    }))
}

// ── Pub/Sub push ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxNotification {
    email_address: String,
    history_id: HistoryId,
}

/// Gmail sends `historyId` as a number; some relays stringify it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryId {
    Number(u64),
    Text(String),
}

impl HistoryId {
    fn value(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Decode a Pub/Sub push body into a trigger.
pub fn decode_pubsub(body: &[u8]) -> Result<Trigger, ChannelError> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| ChannelError::InvalidPayload(format!("envelope: {e}")))?;

    let data = envelope.message.data.trim();
    let decoded = STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .map_err(|e| ChannelError::InvalidPayload(format!("data is not base64: {e}")))?;

    let notification: MailboxNotification = serde_json::from_slice(&decoded)
        .map_err(|e| ChannelError::InvalidPayload(format!("notification: {e}")))?;

    let sequence = notification
        .history_id
        .value()
        .ok_or_else(|| ChannelError::InvalidPayload("historyId is not a number".into()))?;
    if notification.email_address.is_empty() {
        return Err(ChannelError::InvalidPayload("emailAddress is empty".into()));
    }

    Ok(Trigger::new(notification.email_address, sequence))
}

async fn pubsub_push(State(state): State<WebhookState>, body: axum::body::Bytes) -> impl IntoResponse {
    let trigger = match decode_pubsub(&body) {
        Ok(trigger) => trigger,
        Err(e) => {
            warn!(error = %e, "Rejected push notification");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };
    info!(mailbox = %trigger.mailbox_id, sequence = %trigger.sequence, "Push notification received");
    submit(&state, trigger)
}

// ── Manual trigger ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    mailbox_id: String,
    sequence: u64,
}

async fn manual_trigger(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(body): Json<TriggerRequest>,
) -> impl IntoResponse {
    if let Some(expected) = &state.api_key {
        let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.expose_secret()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid API key"})),
            );
        }
    }
    if body.mailbox_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "mailbox_id is required"})),
        );
    }
    debug!(mailbox = %body.mailbox_id, sequence = body.sequence, "Manual trigger");
    submit(&state, Trigger::new(body.mailbox_id, body.sequence))
}

fn submit(state: &WebhookState, trigger: Trigger) -> (StatusCode, Json<serde_json::Value>) {
    let mailbox_id = trigger.mailbox_id.clone();
    let sequence = trigger.sequence;
    match state.scheduler.submit(trigger) {
        Submission::ShuttingDown => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "Shutting down"})),
        ),
        submission => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "mailbox_id": mailbox_id,
                "sequence": sequence,
                "submission": submission,
            })),
        ),
    }
}

// ── Cursor status ───────────────────────────────────────────────────

async fn cursor_status(
    State(state): State<WebhookState>,
    Path(mailbox): Path<String>,
) -> impl IntoResponse {
    match state.store.record(&mailbox).await {
        Ok(Some(record)) => (StatusCode::OK, Json(serde_json::json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "No cursor for mailbox"})),
        ),
        Err(e) => {
            warn!(mailbox = %mailbox, error = %e, "Cursor lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}
