//! Slack notifier: posts urgent-mail alerts with `chat.postMessage`.
//!
//! Slack does not collapse repeated posts, so the idempotency key travels
//! in the message metadata for downstream consumers and the executor's
//! recency cache handles suppression.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::config::SlackConfig;
use crate::error::DeliveryError;
use crate::pipeline::types::{NotificationPayload, NotifySink};

/// Slack error codes worth retrying.
const TRANSIENT_ERRORS: &[&str] = &[
    "ratelimited",
    "rate_limited",
    "service_unavailable",
    "internal_error",
    "fatal_error",
    "request_timeout",
];

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackNotifier {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.config.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl NotifySink for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(
        &self,
        idempotency_key: &str,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        let body = post_message_body(&self.config.channel_id, idempotency_key, payload);
        let resp = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(self.config.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("chat.postMessage: {e}")))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DeliveryError::Transient(format!(
                "chat.postMessage returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!(
                "chat.postMessage returned {status}"
            )));
        }

        let parsed: PostMessageResponse = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("chat.postMessage body: {e}")))?;
        check_response(parsed)?;
        debug!(key = idempotency_key, channel = %self.config.channel_id, "Posted to Slack");
        Ok(())
    }
}

/// Alert text for a notification.
pub fn format_text(payload: &NotificationPayload) -> String {
    format!(
        ":rotating_light: *Urgent Email Received* :rotating_light:\n\n\
         *From*: {}\n\
         *Subject*: {}\n\
         *Summary*: {}\n\n\
         <{}|View Email>",
        payload.sender, payload.subject, payload.summary, payload.source_link
    )
}

fn post_message_body(
    channel: &str,
    idempotency_key: &str,
    payload: &NotificationPayload,
) -> serde_json::Value {
    serde_json::json!({
        "channel": channel,
        "text": format_text(payload),
        "unfurl_links": false,
        "metadata": {
            "event_type": "urgent_email",
            "event_payload": {
                "idempotency_key": idempotency_key,
                "source_link": payload.source_link,
            }
        }
    })
}

fn check_response(resp: PostMessageResponse) -> Result<(), DeliveryError> {
    if resp.ok {
        return Ok(());
    }
    let code = resp.error.unwrap_or_else(|| "unknown_error".to_string());
    if TRANSIENT_ERRORS.contains(&code.as_str()) {
        Err(DeliveryError::Transient(code))
    } else {
        Err(DeliveryError::Rejected(code))
    }
}
