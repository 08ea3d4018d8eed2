//! Gmail REST adapter: change listing, message fetch and labelling.
//!
//! Implements `ChangeSource` over `users.history.list`, `MessageSource`
//! over `users.messages.get` (format=full) and `LabelSink` over
//! `users.messages.modify`. Label ids are looked up (or created) once per
//! mailbox and cached. `watch`/`stop` manage the Pub/Sub push registration
//! that feeds the webhook ingress.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::GmailConfig;
use crate::error::{ChannelError, FetchError, LabelError, ResolveError};
use crate::pipeline::types::{
    ChangeRecord, ChangeSet, ChangeSource, LabelSink, Message, MessageSource, Watermark,
};

/// Upper bound on history pages read for one listing.
const MAX_HISTORY_PAGES: usize = 50;

// ── API response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageStub,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchApiResponse {
    history_id: String,
    #[serde(default)]
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

/// An active push registration.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRegistration {
    /// Mailbox history id at the moment the watch was registered.
    pub history_id: Watermark,
    pub expiration: Option<DateTime<Utc>>,
}

// ── Client ──────────────────────────────────────────────────────────

pub struct GmailClient {
    config: GmailConfig,
    client: reqwest::Client,
    /// (mailbox, label name) → label id.
    label_ids: RwLock<HashMap<(String, String), String>>,
}

impl GmailClient {
    pub fn new(config: GmailConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            client,
            label_ids: RwLock::new(HashMap::new()),
        }
    }

    fn url(&self, mailbox_id: &str, path: &str) -> String {
        format!(
            "{}/users/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            mailbox_id,
            path
        )
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(self.config.access_token.expose_secret())
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(self.config.access_token.expose_secret())
    }

    async fn history_page(
        &self,
        mailbox_id: &str,
        since: Watermark,
        page_token: Option<&str>,
    ) -> Result<HistoryListResponse, ResolveError> {
        let mut query = vec![
            ("startHistoryId", since.to_string()),
            ("historyTypes", "messageAdded".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let resp = self
            .get(self.url(mailbox_id, "history"))
            .query(&query)
            .send()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("history.list: {e}")))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ResolveError::WatermarkExpired {
                mailbox_id: mailbox_id.to_string(),
                watermark: since,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ResolveError::Unavailable(format!(
                "history.list returned {status}: {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("history.list body: {e}")))
    }

    /// Register push notifications for the mailbox INBOX on a Pub/Sub topic.
    pub async fn watch(
        &self,
        mailbox_id: &str,
        topic: &str,
    ) -> Result<WatchRegistration, ChannelError> {
        let resp = self
            .post(self.url(mailbox_id, "watch"))
            .json(&watch_request_body(topic))
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("users.watch: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Http(format!(
                "users.watch returned {status}: {body}"
            )));
        }
        let parsed: WatchApiResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("users.watch body: {e}")))?;
        let registration = parse_watch_response(parsed)?;
        info!(
            mailbox = mailbox_id,
            topic,
            history_id = %registration.history_id,
            expiration = ?registration.expiration,
            "Push notifications registered"
        );
        Ok(registration)
    }

    /// Stop push notifications for the mailbox.
    pub async fn stop(&self, mailbox_id: &str) -> Result<(), ChannelError> {
        let resp = self
            .post(self.url(mailbox_id, "stop"))
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("users.stop: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::Http(format!("users.stop returned {status}")));
        }
        info!(mailbox = mailbox_id, "Push notifications stopped");
        Ok(())
    }

    /// Label id for `name`, creating the label if the mailbox lacks it.
    async fn label_id(&self, mailbox_id: &str, name: &str) -> Result<String, LabelError> {
        let key = (mailbox_id.to_string(), name.to_string());
        if let Some(id) = self.label_ids.read().await.get(&key) {
            return Ok(id.clone());
        }

        let id = match self.find_label(mailbox_id, name).await? {
            Some(id) => id,
            None => match self.create_label(mailbox_id, name).await {
                Ok(id) => id,
                // Created concurrently by someone else.
                Err(LabelError::Rejected(_)) => self
                    .find_label(mailbox_id, name)
                    .await?
                    .ok_or_else(|| LabelError::Rejected(format!("label '{name}' unavailable")))?,
                Err(e) => return Err(e),
            },
        };

        self.label_ids.write().await.insert(key, id.clone());
        Ok(id)
    }

    async fn find_label(&self, mailbox_id: &str, name: &str) -> Result<Option<String>, LabelError> {
        let resp = self
            .get(self.url(mailbox_id, "labels"))
            .send()
            .await
            .map_err(|e| LabelError::Transient(format!("labels.list: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(label_status_error("labels.list", status));
        }
        let list: LabelList = resp
            .json()
            .await
            .map_err(|e| LabelError::Transient(format!("labels.list body: {e}")))?;
        Ok(list
            .labels
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.id))
    }

    async fn create_label(&self, mailbox_id: &str, name: &str) -> Result<String, LabelError> {
        let resp = self
            .post(self.url(mailbox_id, "labels"))
            .json(&serde_json::json!({
                "name": name,
                "labelListVisibility": "labelShow",
                "messageListVisibility": "show",
            }))
            .send()
            .await
            .map_err(|e| LabelError::Transient(format!("labels.create: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(label_status_error("labels.create", status));
        }
        let label: Label = resp
            .json()
            .await
            .map_err(|e| LabelError::Transient(format!("labels.create body: {e}")))?;
        info!(mailbox = mailbox_id, label = %label.name, id = %label.id, "Created label");
        Ok(label.id)
    }
}

#[async_trait]
impl ChangeSource for GmailClient {
    async fn list_changes_since(
        &self,
        mailbox_id: &str,
        since: Watermark,
    ) -> Result<ChangeSet, ResolveError> {
        // Gmail has no history before the first known id.
        if since.is_beginning() {
            return Err(ResolveError::WatermarkExpired {
                mailbox_id: mailbox_id.to_string(),
                watermark: since,
            });
        }

        let mut set = ChangeSet {
            records: Vec::new(),
            new_watermark: since,
        };
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_HISTORY_PAGES {
            let page = self
                .history_page(mailbox_id, since, page_token.as_deref())
                .await?;
            page_token = page.next_page_token.clone();
            let last = page_token.is_none();
            merge_history_page(&mut set, page, last);
            if last {
                break;
            }
        }
        if page_token.is_some() {
            // Unread pages remain; the watermark stops at the last entry read.
            warn!(
                mailbox = mailbox_id,
                since = %since,
                pages = MAX_HISTORY_PAGES,
                read_to = %set.new_watermark,
                "History listing truncated, remaining changes left for the next trigger"
            );
        }
        debug!(
            mailbox = mailbox_id,
            since = %since,
            records = set.records.len(),
            history_id = %set.new_watermark,
            "Listed history"
        );
        Ok(set)
    }
}

#[async_trait]
impl MessageSource for GmailClient {
    async fn fetch(&self, mailbox_id: &str, message_id: &str) -> Result<Message, FetchError> {
        let transient = |reason: String| FetchError::Transient {
            message_id: message_id.to_string(),
            reason,
        };

        let resp = self
            .get(self.url(mailbox_id, &format!("messages/{message_id}")))
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(|e| transient(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                message_id: message_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(transient(format!("messages.get returned {status}")));
        }
        let detail: MessageDetail = resp
            .json()
            .await
            .map_err(|e| transient(format!("messages.get body: {e}")))?;
        Ok(parse_message(detail))
    }
}

#[async_trait]
impl LabelSink for GmailClient {
    async fn apply_label(
        &self,
        mailbox_id: &str,
        message_id: &str,
        label: &str,
    ) -> Result<(), LabelError> {
        let label_id = self.label_id(mailbox_id, label).await?;
        let resp = self
            .post(self.url(mailbox_id, &format!("messages/{message_id}/modify")))
            .json(&serde_json::json!({
                "addLabelIds": [label_id],
                "removeLabelIds": [],
            }))
            .send()
            .await
            .map_err(|e| LabelError::Transient(format!("messages.modify: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(label_status_error("messages.modify", status));
        }
        Ok(())
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Fold one history page into `set`. The page's `historyId` is the mailbox's
/// current position, so it only counts once the listing is complete.
fn merge_history_page(set: &mut ChangeSet, page: HistoryListResponse, last: bool) {
    for entry in page.history {
        let Ok(sequence) = entry.id.parse::<u64>() else {
            debug!(id = %entry.id, "Skipping history entry with non-numeric id");
            continue;
        };
        for added in entry.messages_added {
            set.records
                .push(ChangeRecord::new(sequence, added.message.id));
        }
        set.new_watermark = set.new_watermark.max(Watermark::new(sequence));
    }
    if !last {
        return;
    }
    if let Some(id) = page.history_id.and_then(|h| h.parse::<u64>().ok()) {
        set.new_watermark = set.new_watermark.max(Watermark::new(id));
    }
}

fn watch_request_body(topic: &str) -> serde_json::Value {
    serde_json::json!({
        "labelIds": ["INBOX"],
        "topicName": topic,
    })
}

fn parse_watch_response(resp: WatchApiResponse) -> Result<WatchRegistration, ChannelError> {
    let history_id = resp
        .history_id
        .trim()
        .parse::<u64>()
        .map_err(|_| ChannelError::Http(format!("users.watch historyId '{}'", resp.history_id)))?;
    let expiration = resp
        .expiration
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);
    Ok(WatchRegistration {
        history_id: Watermark::new(history_id),
        expiration,
    })
}

fn parse_message(detail: MessageDetail) -> Message {
    let payload = detail.payload.unwrap_or_default();
    let header = |name: &str| -> Option<String> {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    let received_at = header("Date")
        .and_then(|d| parse_date_header(&d))
        .or_else(|| {
            detail
                .internal_date
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::<Utc>::from_timestamp_millis)
        })
        .unwrap_or_else(Utc::now);

    let mut plain = None;
    let mut html = None;
    walk_parts(&payload, &mut plain, &mut html);
    // Single-part message with an unrecognised type: use the body as text.
    if plain.is_none() && html.is_none() {
        plain = payload
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_body);
    }

    Message {
        id: detail.id,
        thread_id: detail.thread_id.filter(|t| !t.is_empty()),
        subject: header("Subject").unwrap_or_default(),
        sender: header("From").unwrap_or_default(),
        body_plain: plain.unwrap_or_default(),
        body_html: html,
        received_at,
    }
}

/// First `text/plain` and first `text/html` part, depth first.
fn walk_parts(part: &MessagePart, plain: &mut Option<String>, html: &mut Option<String>) {
    let data = part.body.as_ref().and_then(|b| b.data.as_deref());
    match part.mime_type.as_str() {
        "text/plain" if plain.is_none() => *plain = data.and_then(decode_body),
        "text/html" if html.is_none() => *html = data.and_then(decode_body),
        _ => {}
    }
    for child in &part.parts {
        if plain.is_some() && html.is_some() {
            return;
        }
        walk_parts(child, plain, html);
    }
}

/// Decode a base64url body (padding optional).
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim().trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// RFC 2822 date, tolerating a trailing `(UTC)`-style comment.
fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    let value = value.split(" (").next().unwrap_or(value).trim();
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn label_status_error(call: &str, status: StatusCode) -> LabelError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        LabelError::Transient(format!("{call} returned {status}"))
    } else {
        LabelError::Rejected(format!("{call} returned {status}"))
    }
}
