//! Configuration types.
//!
//! Everything the pipeline tunes at runtime is a named field here and is
//! handed to components at construction. Nothing reads the environment
//! after startup.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::retry::RetryPolicy;

/// What to do with a message whose classification is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassificationPolicy {
    /// Treat as non-urgent and settle it. Favors availability.
    FailOpen,
    /// Hold the message so the next invocation retries it. Favors correctness.
    #[default]
    FailClosed,
}

impl FromStr for ClassificationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(ConfigError::InvalidValue {
                key: "TRIAGE_CLASSIFY_POLICY".into(),
                message: format!("expected fail_open or fail_closed, got '{other}'"),
            }),
        }
    }
}

/// Where to restart when the stored watermark fell off the retention horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPoint {
    /// Jump straight to the trigger's sequence. Everything in between is lost.
    #[default]
    Now,
    /// Re-resolve from `positions` before the trigger's sequence.
    Rewind { positions: u64 },
}

impl FromStr for RecoveryPoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "now" {
            return Ok(Self::Now);
        }
        if let Some(n) = s.strip_prefix("rewind:")
            && let Ok(positions) = n.trim().parse::<u64>()
        {
            return Ok(Self::Rewind { positions });
        }
        Err(ConfigError::InvalidValue {
            key: "TRIAGE_RECOVERY".into(),
            message: format!("expected 'now' or 'rewind:<positions>', got '{s}'"),
        })
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Label applied to urgent messages.
    pub urgent_label: String,
    /// Body characters submitted to the classifier.
    pub max_body_chars: usize,
    /// Upper bound on a single classifier call.
    pub classify_timeout: Duration,
    /// Budget for one whole batch (resolve, fetch, classify, act).
    pub batch_timeout: Duration,
    /// How long in-flight messages may keep running after shutdown is signalled.
    pub shutdown_grace: Duration,
    /// Messages processed concurrently within a batch.
    pub worker_concurrency: usize,
    /// How long an issued notify key suppresses re-delivery.
    pub dedup_window: Duration,
    /// Maximum notify keys remembered.
    pub dedup_capacity: usize,
    /// Deep link to the source message; `{id}` is replaced with the thread or message id.
    pub source_link_template: String,
    pub classification_policy: ClassificationPolicy,
    pub recovery: RecoveryPoint,
    pub fetch_retry: RetryPolicy,
    pub classify_retry: RetryPolicy,
    pub tag_retry: RetryPolicy,
    pub notify_retry: RetryPolicy,
    /// Re-runs of a whole batch after a retryable batch-level failure.
    pub batch_retry: RetryPolicy,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            urgent_label: "URGENT_AI".to_string(),
            max_body_chars: 1024,
            classify_timeout: Duration::from_secs(15),
            batch_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            worker_concurrency: 4,
            dedup_window: Duration::from_secs(3600),
            dedup_capacity: 4096,
            source_link_template: "https://mail.google.com/mail/u/0/#inbox/{id}".to_string(),
            classification_policy: ClassificationPolicy::default(),
            recovery: RecoveryPoint::default(),
            fetch_retry: RetryPolicy::default(),
            classify_retry: RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
            tag_retry: RetryPolicy::default(),
            notify_retry: RetryPolicy::default(),
            batch_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: true,
            },
        }
    }
}

impl TriageConfig {
    /// Build config from `TRIAGE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let classification_policy = match std::env::var("TRIAGE_CLASSIFY_POLICY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.classification_policy,
        };
        let recovery = match std::env::var("TRIAGE_RECOVERY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.recovery,
        };

        Ok(Self {
            urgent_label: std::env::var("TRIAGE_URGENT_LABEL").unwrap_or(defaults.urgent_label),
            max_body_chars: env_parse("TRIAGE_MAX_BODY_CHARS", defaults.max_body_chars),
            classify_timeout: env_millis("TRIAGE_CLASSIFY_TIMEOUT_MS", defaults.classify_timeout),
            batch_timeout: env_millis("TRIAGE_BATCH_TIMEOUT_MS", defaults.batch_timeout),
            shutdown_grace: env_millis("TRIAGE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            worker_concurrency: env_parse("TRIAGE_WORKERS", defaults.worker_concurrency).max(1),
            dedup_window: env_millis("TRIAGE_DEDUP_WINDOW_MS", defaults.dedup_window),
            dedup_capacity: env_parse("TRIAGE_DEDUP_CAPACITY", defaults.dedup_capacity),
            source_link_template: std::env::var("TRIAGE_SOURCE_LINK_TEMPLATE")
                .unwrap_or(defaults.source_link_template),
            classification_policy,
            recovery,
            fetch_retry: retry_from_env("FETCH", defaults.fetch_retry),
            classify_retry: retry_from_env("CLASSIFY", defaults.classify_retry),
            tag_retry: retry_from_env("TAG", defaults.tag_retry),
            notify_retry: retry_from_env("NOTIFY", defaults.notify_retry),
            batch_retry: retry_from_env("BATCH", defaults.batch_retry),
        })
    }

    /// Render the source link for a message.
    pub fn source_link(&self, link_id: &str) -> String {
        self.source_link_template.replace("{id}", link_id)
    }
}

/// Mail store (Gmail REST) adapter configuration.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub api_base: String,
    pub access_token: SecretString,
    pub request_timeout: Duration,
    /// Mailbox registered for push notifications at startup.
    pub watch_mailbox: String,
    /// Full Pub/Sub topic name (`projects/{project}/topics/{topic}`).
    /// Push registration is skipped when unset.
    pub pubsub_topic: Option<String>,
}

impl GmailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token = std::env::var("GMAIL_ACCESS_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("GMAIL_ACCESS_TOKEN".into()))?;
        Ok(Self {
            api_base: std::env::var("GMAIL_API_BASE")
                .unwrap_or_else(|_| "https://gmail.googleapis.com/gmail/v1".to_string()),
            access_token: SecretString::from(access_token),
            request_timeout: env_millis("GMAIL_REQUEST_TIMEOUT_MS", Duration::from_secs(20)),
            watch_mailbox: std::env::var("GMAIL_WATCH_MAILBOX").unwrap_or_else(|_| "me".to_string()),
            pubsub_topic: std::env::var("GMAIL_PUBSUB_TOPIC")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        })
    }
}

/// Delivery channel (Slack Web API) adapter configuration.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub api_base: String,
    pub bot_token: SecretString,
    pub channel_id: String,
    pub request_timeout: Duration,
}

impl SlackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("SLACK_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("SLACK_BOT_TOKEN".into()))?;
        let channel_id = std::env::var("SLACK_CHANNEL_ID")
            .map_err(|_| ConfigError::MissingEnvVar("SLACK_CHANNEL_ID".into()))?;
        if !bot_token.starts_with("xoxb-") {
            tracing::warn!("SLACK_BOT_TOKEN does not look like a bot token (expected xoxb- prefix)");
        }
        Ok(Self {
            api_base: std::env::var("SLACK_API_BASE")
                .unwrap_or_else(|_| "https://slack.com/api".to_string()),
            bot_token: SecretString::from(bot_token),
            channel_id,
            request_timeout: env_millis("SLACK_REQUEST_TIMEOUT_MS", Duration::from_secs(10)),
        })
    }
}

/// HTTP ingress and persistence settings for the daemon.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    /// Required on the manual trigger endpoint when set.
    pub api_key: Option<SecretString>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("TRIAGE_PORT", 8080),
            db_path: std::env::var("TRIAGE_DB_PATH")
                .unwrap_or_else(|_| "./data/mail-triage.db".to_string()),
            api_key: std::env::var("TRIAGE_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// `TRIAGE_<STAGE>_MAX_ATTEMPTS`, `_BASE_DELAY_MS`, `_MAX_DELAY_MS`, `_JITTER`.
fn retry_from_env(stage: &str, default: RetryPolicy) -> RetryPolicy {
    RetryPolicy {
        max_attempts: env_parse(
            &format!("TRIAGE_{stage}_MAX_ATTEMPTS"),
            default.max_attempts,
        ),
        base_delay: env_millis(&format!("TRIAGE_{stage}_BASE_DELAY_MS"), default.base_delay),
        max_delay: env_millis(&format!("TRIAGE_{stage}_MAX_DELAY_MS"), default.max_delay),
        jitter: env_parse(&format!("TRIAGE_{stage}_JITTER"), default.jitter),
    }
}
